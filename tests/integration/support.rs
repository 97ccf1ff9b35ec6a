use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    x509::{X509, X509Builder, X509Req, extension::SubjectAlternativeName},
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

use le_cert_manager::core::errors::CertError;
use le_cert_manager::core::types::{
    Authorization, AuthorizationStatus, ChallengeDescriptor, ChallengeKind, ChallengeStatus,
    OrderStatus,
};
use le_cert_manager::domain::challenge_record_name;
use le_cert_manager::issuance::acme::{AcmeAccount, AcmeDirectory, AcmeOrder};
use le_cert_manager::issuance::challenge::dns01_txt_value;
use le_cert_manager::issuance::dns_providers::MemoryDnsZoneClient;

/// Certificate authority that validates DNS-01 against an in-memory zone and
/// signs CSRs with a throwaway root.
pub struct FakeCa {
    inner: Arc<CaInner>,
}

struct CaInner {
    dns: Arc<MemoryDnsZoneClient>,
    zone: String,
    ca_cert: X509,
    ca_key: PKey<Private>,
    serial: AtomicU32,
    accounts_created: AtomicUsize,
    accounts_restored: AtomicUsize,
    orders: AtomicUsize,
}

impl FakeCa {
    pub fn new(dns: Arc<MemoryDnsZoneClient>, zone: &str) -> Arc<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params
            .distinguished_name
            .push(DnType::CommonName, "Fake Test Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().expect("ca key");
        let cert = params.self_signed(&key).expect("ca cert");

        Arc::new(Self {
            inner: Arc::new(CaInner {
                dns,
                zone: zone.to_string(),
                ca_cert: X509::from_pem(cert.pem().as_bytes()).expect("ca x509"),
                ca_key: PKey::private_key_from_pem(key.serialize_pem().as_bytes())
                    .expect("ca pkey"),
                serial: AtomicU32::new(1),
                accounts_created: AtomicUsize::new(0),
                accounts_restored: AtomicUsize::new(0),
                orders: AtomicUsize::new(0),
            }),
        })
    }

    pub fn accounts_created(&self) -> usize {
        self.inner.accounts_created.load(Ordering::SeqCst)
    }

    pub fn accounts_restored(&self) -> usize {
        self.inner.accounts_restored.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> usize {
        self.inner.orders.load(Ordering::SeqCst)
    }
}

impl CaInner {
    fn sign(&self, csr_der: &[u8], domains: &[String]) -> String {
        let req = X509Req::from_der(csr_der).expect("csr");
        let public_key = req.public_key().expect("csr key");
        assert!(req.verify(&public_key).expect("verify csr"));

        let mut builder = X509Builder::new().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(self.serial.fetch_add(1, Ordering::SeqCst))
            .and_then(|bn| bn.to_asn1_integer())
            .expect("serial");
        builder.set_serial_number(&serial).expect("serial");
        builder.set_subject_name(req.subject_name()).expect("subject");
        builder
            .set_issuer_name(self.ca_cert.subject_name())
            .expect("issuer");
        builder.set_pubkey(&public_key).expect("pubkey");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("now"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(90).expect("later"))
            .expect("not after");
        let mut san = SubjectAlternativeName::new();
        for domain in domains {
            san.dns(domain);
        }
        let extension = san
            .build(&builder.x509v3_context(Some(&self.ca_cert), None))
            .expect("san");
        builder.append_extension(extension).expect("append san");
        builder
            .sign(&self.ca_key, MessageDigest::sha256())
            .expect("sign");
        let leaf = builder.build();

        let leaf_pem = String::from_utf8(leaf.to_pem().expect("leaf pem")).expect("utf8");
        let ca_pem = String::from_utf8(self.ca_cert.to_pem().expect("ca pem")).expect("utf8");
        format!("{leaf_pem}{ca_pem}")
    }
}

#[async_trait]
impl AcmeDirectory for FakeCa {
    async fn create_account(
        &self,
        _directory_url: &str,
        contact_email: &str,
    ) -> Result<(Arc<dyn AcmeAccount>, String), CertError> {
        let n = self.inner.accounts_created.fetch_add(1, Ordering::SeqCst);
        Ok((
            Arc::new(FakeAccount {
                ca: Arc::clone(&self.inner),
            }),
            format!("account-{n}-{contact_email}"),
        ))
    }

    async fn restore_account(
        &self,
        _directory_url: &str,
        account_key: &str,
    ) -> Result<Arc<dyn AcmeAccount>, CertError> {
        if !account_key.starts_with("account-") {
            return Err(CertError::Acme("unknown account key".into()));
        }
        self.inner.accounts_restored.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeAccount {
            ca: Arc::clone(&self.inner),
        }))
    }
}

struct FakeAccount {
    ca: Arc<CaInner>,
}

#[async_trait]
impl AcmeAccount for FakeAccount {
    async fn new_order(&self, domains: &[String]) -> Result<Arc<dyn AcmeOrder>, CertError> {
        let n = self.ca.orders.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeOrder {
            ca: Arc::clone(&self.ca),
            id: format!("fake-order-{n}"),
            domains: domains.to_vec(),
            state: Mutex::new(OrderState::default()),
        }))
    }
}

#[derive(Default)]
struct OrderState {
    validated: Vec<(String, bool)>,
    chain: Option<String>,
}

struct FakeOrder {
    ca: Arc<CaInner>,
    id: String,
    domains: Vec<String>,
    state: Mutex<OrderState>,
}

impl FakeOrder {
    fn token(domain: &str) -> String {
        format!("token-{}", domain.replace('*', "wild"))
    }

    fn authorization(&self, domain: &str) -> Authorization {
        let state = self.state.lock().expect("state");
        let outcome = state
            .validated
            .iter()
            .find(|(validated, _)| validated == domain)
            .map(|(_, ok)| *ok);
        let (status, challenge_status, error) = match outcome {
            None => (AuthorizationStatus::Pending, ChallengeStatus::Pending, None),
            Some(true) => (AuthorizationStatus::Valid, ChallengeStatus::Valid, None),
            Some(false) => (
                AuthorizationStatus::Invalid,
                ChallengeStatus::Invalid,
                Some("TXT record not found".to_string()),
            ),
        };
        Authorization {
            domain: domain.to_string(),
            status,
            challenges: vec![ChallengeDescriptor {
                kind: ChallengeKind::Dns01,
                url: format!("https://fake-ca.test/chall/{}", Self::token(domain)),
                token: Self::token(domain),
                status: challenge_status,
                error,
            }],
        }
    }
}

#[async_trait]
impl AcmeOrder for FakeOrder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn refresh_authorizations(&self) -> Result<Vec<Authorization>, CertError> {
        Ok(self
            .domains
            .iter()
            .map(|domain| self.authorization(domain))
            .collect())
    }

    async fn key_authorization(
        &self,
        _domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<String, CertError> {
        Ok(format!("{}.fake-thumbprint", challenge.token))
    }

    async fn set_challenge_ready(
        &self,
        domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<(), CertError> {
        let ca = &self.ca;
        let expected = dns01_txt_value(&format!("{}.fake-thumbprint", challenge.token));
        let published = challenge_record_name(domain, &ca.zone)
            .and_then(|name| ca.dns.record(&ca.zone, &name))
            .is_some_and(|record| record.values.contains(&expected));
        self.state
            .lock()
            .expect("state")
            .validated
            .push((domain.to_string(), published));
        Ok(())
    }

    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CertError> {
        let chain = self.ca.sign(csr_der, &self.domains);
        self.state.lock().expect("state").chain = Some(chain);
        Ok(())
    }

    async fn refresh_status(&self) -> Result<OrderStatus, CertError> {
        let state = self.state.lock().expect("state");
        Ok(if state.chain.is_some() {
            OrderStatus::Valid
        } else {
            OrderStatus::Pending
        })
    }

    async fn certificate_chain(&self) -> Result<Option<String>, CertError> {
        Ok(self.state.lock().expect("state").chain.clone())
    }
}
