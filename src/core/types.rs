use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::X509Certificate;

/// Read-only projection of a certificate held by the secret store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Profile name the record was requested for (store name until bound to a profile)
    pub name: String,
    /// Certificate name inside the secret store
    pub store_name: String,
    /// Store-assigned version identifier, if any
    pub version: Option<String>,
    /// Upper-case hex SHA-1 thumbprint of the leaf certificate
    pub thumbprint: String,
    /// Store-assigned resource id
    pub id: Option<String>,
    /// Subject distinguished name (e.g. "CN=example.com")
    pub subject: String,
    /// DNS names from the subjectAltName extension
    pub subject_alternative_names: Vec<String>,
    /// Issuer distinguished name
    pub issuer_name: String,
    /// Public key size in bits
    pub key_size: Option<u32>,
    /// Key usage flags (e.g. "digitalSignature")
    pub key_usage: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    /// Certificate validity end date
    pub expires: DateTime<Utc>,
    /// Certificate validity start date
    pub not_before: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub enabled: Option<bool>,
}

impl CertificateRecord {
    /// Builds a record from a DER-encoded leaf certificate.
    pub fn from_der(store_name: &str, der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| anyhow!("failed to parse certificate DER: {e}"))?;
        let expires = to_utc(cert.validity().not_after.timestamp())?;
        let not_before = to_utc(cert.validity().not_before.timestamp())?;
        let key_size = openssl::x509::X509::from_der(der)
            .and_then(|x509| x509.public_key())
            .map(|key| key.bits())
            .ok();

        Ok(Self {
            name: store_name.to_string(),
            store_name: store_name.to_string(),
            version: None,
            thumbprint: hex::encode_upper(openssl::sha::sha1(der)),
            id: None,
            subject: cert.subject().to_string(),
            subject_alternative_names: dns_names(&cert),
            issuer_name: cert.issuer().to_string(),
            key_size,
            key_usage: key_usage_names(&cert),
            created: None,
            expires,
            not_before: Some(not_before),
            updated: None,
            enabled: None,
        })
    }

    /// Re-labels the record with the profile name it was looked up by.
    pub fn for_profile(mut self, profile_name: &str) -> Self {
        self.name = profile_name.to_string();
        self
    }

    /// True iff `expires - now <= buffer`; equality counts as expiring.
    pub fn is_expiring_within(&self, buffer: Duration) -> bool {
        self.is_expiring_within_at(buffer, Utc::now())
    }

    pub fn is_expiring_within_at(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        self.expires.signed_duration_since(now) <= buffer
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| anyhow!("certificate timestamp {timestamp} is out of range"))
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn key_usage_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(usage)) = cert.key_usage() else {
        return Vec::new();
    };
    let usage = usage.value;
    [
        (usage.digital_signature(), "digitalSignature"),
        (usage.non_repudiation(), "nonRepudiation"),
        (usage.key_encipherment(), "keyEncipherment"),
        (usage.data_encipherment(), "dataEncipherment"),
        (usage.key_agreement(), "keyAgreement"),
        (usage.key_cert_sign(), "keyCertSign"),
        (usage.crl_sign(), "cRLSign"),
        (usage.encipher_only(), "encipherOnly"),
        (usage.decipher_only(), "decipherOnly"),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .map(|(_, name)| name.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
    Other(String),
}

/// One challenge variant offered by an authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDescriptor {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
    pub status: ChallengeStatus,
    /// Problem detail reported by the CA when the challenge failed
    pub error: Option<String>,
}

/// Per-domain proof-of-control requirement, as last observed from the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<ChallengeDescriptor>,
}

impl Authorization {
    pub fn challenge(&self, kind: &ChallengeKind) -> Option<&ChallengeDescriptor> {
        self.challenges.iter().find(|challenge| &challenge.kind == kind)
    }

    /// "domain: detail1,detail2" built from the invalid challenges.
    pub fn failure_summary(&self) -> String {
        let details: Vec<&str> = self
            .challenges
            .iter()
            .filter(|challenge| challenge.status == ChallengeStatus::Invalid)
            .map(|challenge| challenge.error.as_deref().unwrap_or(""))
            .collect();
        format!("{}: {}", self.domain, details.join(","))
    }
}

/// Result of a handler that satisfied an authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChallenge {
    pub domain: String,
    pub kind: ChallengeKind,
    pub token: String,
    pub status: ChallengeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// TXT record set published for DNS-01 validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordSet {
    pub zone: String,
    pub name: String,
    pub ttl: u32,
    pub values: Vec<String>,
    /// Identifier of the order session that created the set
    pub order_id: Option<String>,
}

/// Persisted account key blob, one per CA server alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKeyCacheEntry {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub server: String,
}

impl AccountKeyCacheEntry {
    pub fn is_fresh_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) <= ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one renew-all-due pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub renewed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<SweepFailure>,
}
