//! Application configuration.
//!
//! Certificate profiles, the ACME account, the account-key cache and the
//! runtime knobs for issuance, the HTTP surface and the daily sweep are read
//! from one TOML file and validated before anything is wired.

use std::{
    collections::HashSet,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveTime;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::normalize_domain;
use crate::issuance::challenge::HandlerErrorPolicy;
use crate::issuance::dns::DnsProviderKind;

pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const DEFAULT_PFX_PASSWORD: &str = "P@ssw0rd";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("certificate {profile}: DNS provider '{provider}' has no registered implementation")]
    UnknownProvider { profile: String, provider: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub acme_account: AcmeAccountSettings,
    #[serde(default)]
    pub certificates: Vec<CertificateProfile>,
    #[serde(default)]
    pub acme_key_cache: KeyCacheSettings,
    #[serde(default = "default_renewal_days")]
    pub renewal_before_expire_days: u32,
    #[serde(default)]
    pub issuance: IssuanceSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub secret_store: SecretStoreSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeAccountSettings {
    pub email: String,
}

/// One named certificate managed by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateProfile {
    pub name: String,
    pub domains: Vec<String>,
    #[serde(default = "default_acme_server")]
    pub acme_server: String,
    #[serde(default)]
    pub dns_challenge: Option<DnsChallengeConfig>,
    pub key_vault: KeyVaultLocation,
    #[serde(default)]
    pub kv_cert_name: Option<String>,
    #[serde(default)]
    pub pfx_password: Option<String>,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyVaultLocation {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsChallengeConfig {
    /// Registry tag of the DNS zone client (e.g. "azure_dns")
    pub provider: String,
    pub zone: DnsZoneSettings,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_challenge_ttl")]
    pub ttl_secs: u32,
}

impl DnsChallengeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsZoneSettings {
    pub name: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub resource_group: String,
}

impl CertificateProfile {
    /// First configured domain; validation guarantees there is one.
    pub fn common_name(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or_default()
    }

    pub fn kv_cert_name(&self) -> &str {
        match self.kv_cert_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.name,
        }
    }

    pub fn pfx_password(&self) -> &str {
        self.pfx_password.as_deref().unwrap_or(DEFAULT_PFX_PASSWORD)
    }

    pub fn vault_uri(&self) -> &str {
        &self.key_vault.uri
    }

    /// Resolves the CA server alias to an ACME directory URL.
    pub fn directory_url(&self) -> Option<String> {
        resolve_directory_url(&self.acme_server)
    }
}

pub fn resolve_directory_url(alias: &str) -> Option<String> {
    let alias = alias.trim();
    if alias.eq_ignore_ascii_case("staging") {
        Some(LETSENCRYPT_STAGING.to_string())
    } else if alias.eq_ignore_ascii_case("production") {
        Some(LETSENCRYPT_PRODUCTION.to_string())
    } else if is_https(alias) {
        Some(alias.to_string())
    } else {
        None
    }
}

fn is_https(url: &str) -> bool {
    url.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCacheBackendKind {
    File,
    SecretStore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyCacheSettings {
    #[serde(default = "default_key_cache_backend")]
    pub backend: KeyCacheBackendKind,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub vault_uri: Option<String>,
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default = "default_cache_hours")]
    pub cache_time_hours: u32,
}

impl Default for KeyCacheSettings {
    fn default() -> Self {
        Self {
            backend: default_key_cache_backend(),
            file_path: Some(PathBuf::from("acme-account.json")),
            vault_uri: None,
            secret_name: None,
            cache_time_hours: default_cache_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuanceSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,
    #[serde(default)]
    pub handler_error_policy: HandlerErrorPolicy,
    #[serde(default = "default_sweep_timeout")]
    pub sweep_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_renewals: usize,
}

impl IssuanceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            validation_timeout_secs: default_validation_timeout(),
            handler_error_policy: HandlerErrorPolicy::default(),
            sweep_timeout_secs: default_sweep_timeout(),
            max_concurrent_renewals: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_at: default_daily_at(),
        }
    }
}

impl ScheduleSettings {
    pub fn daily_time(&self) -> Result<NaiveTime, SettingsError> {
        NaiveTime::parse_from_str(self.daily_at.trim(), "%H:%M").map_err(|err| {
            SettingsError::Invalid(format!(
                "schedule.daily_at '{}' is not HH:MM: {err}",
                self.daily_at
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretStoreBackendKind {
    #[default]
    KeyVault,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretStoreSettings {
    #[serde(default)]
    pub backend: SecretStoreBackendKind,
}

impl AppSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: AppSettings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn profile(&self, name: &str) -> Option<&CertificateProfile> {
        self.certificates.iter().find(|profile| profile.name == name)
    }

    pub fn renewal_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renewal_before_expire_days))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.acme_account.email.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "acme_account.email is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for profile in &self.certificates {
            validate_profile(profile)?;
            if !seen.insert(profile.name.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "certificate name '{}' is configured more than once",
                    profile.name
                )));
            }
        }

        match self.acme_key_cache.backend {
            KeyCacheBackendKind::File => {
                if self.acme_key_cache.file_path.is_none() {
                    return Err(SettingsError::Invalid(
                        "acme_key_cache.file_path is required for the file backend".to_string(),
                    ));
                }
            }
            KeyCacheBackendKind::SecretStore => {
                let has_uri = self
                    .acme_key_cache
                    .vault_uri
                    .as_deref()
                    .is_some_and(|uri| !uri.trim().is_empty());
                let has_name = self
                    .acme_key_cache
                    .secret_name
                    .as_deref()
                    .is_some_and(|name| !name.trim().is_empty());
                if !has_uri || !has_name {
                    return Err(SettingsError::Invalid(
                        "acme_key_cache.vault_uri and secret_name are required for the secret_store backend"
                            .to_string(),
                    ));
                }
            }
        }

        if self.issuance.poll_interval_secs == 0 {
            return Err(SettingsError::Invalid(
                "issuance.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.issuance.validation_timeout_secs == 0 || self.issuance.sweep_timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "issuance.validation_timeout_secs and sweep_timeout_secs must be greater than zero"
                    .to_string(),
            ));
        }
        if self.issuance.max_concurrent_renewals == 0 {
            return Err(SettingsError::Invalid(
                "issuance.max_concurrent_renewals must be greater than zero".to_string(),
            ));
        }
        self.schedule.daily_time()?;
        Ok(())
    }
}

fn validate_profile(profile: &CertificateProfile) -> Result<(), SettingsError> {
    if profile.name.trim().is_empty() {
        return Err(SettingsError::Invalid(
            "certificate name can't be empty".to_string(),
        ));
    }
    if profile.domains.is_empty() {
        return Err(SettingsError::Invalid(format!(
            "certificate {} must list at least one domain",
            profile.name
        )));
    }
    for domain in &profile.domains {
        normalize_domain(domain).map_err(|err| {
            SettingsError::Invalid(format!("certificate {}: {err}", profile.name))
        })?;
    }
    if profile.directory_url().is_none() {
        return Err(SettingsError::Invalid(format!(
            "certificate {}: unknown acme_server '{}'",
            profile.name, profile.acme_server
        )));
    }
    if profile.key_vault.uri.trim().is_empty() {
        return Err(SettingsError::Invalid(format!(
            "certificate {}: key_vault.uri is required",
            profile.name
        )));
    }
    if let Some(dns) = &profile.dns_challenge {
        if DnsProviderKind::from_tag(&dns.provider).is_none() {
            return Err(SettingsError::UnknownProvider {
                profile: profile.name.clone(),
                provider: dns.provider.clone(),
            });
        }
        if dns.zone.name.trim().is_empty() {
            return Err(SettingsError::Invalid(format!(
                "certificate {}: dns_challenge.zone.name is required",
                profile.name
            )));
        }
    }
    Ok(())
}

fn default_renewal_days() -> u32 {
    20
}

fn default_acme_server() -> String {
    "staging".to_string()
}

fn default_true() -> bool {
    true
}

fn default_settle_delay() -> u64 {
    10
}

fn default_challenge_ttl() -> u32 {
    60
}

fn default_key_cache_backend() -> KeyCacheBackendKind {
    KeyCacheBackendKind::File
}

fn default_cache_hours() -> u32 {
    8760
}

fn default_poll_interval() -> u64 {
    5
}

fn default_validation_timeout() -> u64 {
    600
}

fn default_sweep_timeout() -> u64 {
    3600
}

fn default_max_concurrent() -> usize {
    4
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7071))
}

fn default_daily_at() -> String {
    "02:15".to_string()
}
