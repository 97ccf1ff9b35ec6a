//! ACME protocol seam.
//!
//! The engine drives orders through these traits; `InstantAcmeDirectory`
//! implements them on top of `instant-acme`.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, NewAccount, NewOrder, Order,
};
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::errors::CertError;
use crate::core::types::{
    Authorization, AuthorizationStatus, ChallengeDescriptor, ChallengeKind, ChallengeStatus,
    OrderStatus,
};

/// Account registration and restoration against one ACME directory.
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Registers a new account and returns it together with its serialized key material.
    async fn create_account(
        &self,
        directory_url: &str,
        contact_email: &str,
    ) -> Result<(Arc<dyn AcmeAccount>, String), CertError>;

    /// Rebuilds an account from key material produced by `create_account`.
    async fn restore_account(
        &self,
        directory_url: &str,
        account_key: &str,
    ) -> Result<Arc<dyn AcmeAccount>, CertError>;
}

#[async_trait]
pub trait AcmeAccount: Send + Sync {
    async fn new_order(&self, domains: &[String]) -> Result<Arc<dyn AcmeOrder>, CertError>;
}

/// One certificate order. Authorizations are addressed by their identifier label
/// (`example.com`, `*.example.com`).
#[async_trait]
pub trait AcmeOrder: Send + Sync {
    /// Identifier of this order session, stable for the lifetime of the order.
    fn id(&self) -> &str;
    /// Current state of every authorization in the order, fetched in one pass.
    async fn refresh_authorizations(&self) -> Result<Vec<Authorization>, CertError>;
    async fn key_authorization(
        &self,
        domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<String, CertError>;
    async fn set_challenge_ready(
        &self,
        domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<(), CertError>;
    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CertError>;
    async fn refresh_status(&self) -> Result<OrderStatus, CertError>;
    /// PEM chain once the order is valid.
    async fn certificate_chain(&self) -> Result<Option<String>, CertError>;
}

/// Account bound to the CA server it was obtained from.
#[derive(Clone)]
pub struct AccountContext {
    pub server_alias: String,
    pub directory_url: String,
    pub account: Arc<dyn AcmeAccount>,
}

impl AccountContext {
    pub async fn new_order(&self, domains: &[String]) -> Result<Arc<dyn AcmeOrder>, CertError> {
        debug!(
            "[acme] requesting order from {} ({})",
            self.server_alias, self.directory_url
        );
        self.account.new_order(domains).await
    }
}

fn acme_error(context: &str, err: impl std::fmt::Display) -> CertError {
    CertError::Acme(format!("{context}: {err}"))
}

#[derive(Default)]
pub struct InstantAcmeDirectory;

impl InstantAcmeDirectory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AcmeDirectory for InstantAcmeDirectory {
    async fn create_account(
        &self,
        directory_url: &str,
        contact_email: &str,
    ) -> Result<(Arc<dyn AcmeAccount>, String), CertError> {
        info!("[acme] registering account {contact_email} at {directory_url}");
        let contact = format!("mailto:{contact_email}");
        let (account, credentials) = Account::builder()
            .map_err(|e| acme_error("failed to build ACME client", e))?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url.to_owned(),
                None,
            )
            .await
            .map_err(|e| acme_error("account registration failed", e))?;
        let key = serde_json::to_string(&credentials)
            .map_err(|e| CertError::Internal(anyhow::anyhow!("failed to serialize account: {e}")))?;
        Ok((Arc::new(InstantAcmeAccount { account }), key))
    }

    async fn restore_account(
        &self,
        directory_url: &str,
        account_key: &str,
    ) -> Result<Arc<dyn AcmeAccount>, CertError> {
        debug!("[acme] restoring cached account for {directory_url}");
        let credentials: AccountCredentials = serde_json::from_str(account_key)
            .map_err(|e| acme_error("cached account key is malformed", e))?;
        let account = Account::builder()
            .map_err(|e| acme_error("failed to build ACME client", e))?
            .from_credentials(credentials)
            .await
            .map_err(|e| acme_error("failed to restore account", e))?;
        Ok(Arc::new(InstantAcmeAccount { account }))
    }
}

struct InstantAcmeAccount {
    account: Account,
}

#[async_trait]
impl AcmeAccount for InstantAcmeAccount {
    async fn new_order(&self, domains: &[String]) -> Result<Arc<dyn AcmeOrder>, CertError> {
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        let order = self
            .account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| acme_error("failed to create order", e))?;
        Ok(Arc::new(InstantAcmeOrder {
            id: Uuid::new_v4().to_string(),
            order: Mutex::new(order),
            walked: AtomicBool::new(false),
            key_authorizations: StdMutex::new(HashMap::new()),
        }))
    }
}

struct InstantAcmeOrder {
    id: String,
    order: Mutex<Order>,
    walked: AtomicBool,
    /// dns-01 key authorizations by challenge token, filled while walking the order.
    key_authorizations: StdMutex<HashMap<String, String>>,
}

fn map_challenge_type(kind: &ChallengeType) -> ChallengeKind {
    match kind {
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        other => ChallengeKind::Other(format!("{other:?}")),
    }
}

fn to_challenge_type(kind: &ChallengeKind) -> Result<ChallengeType, CertError> {
    match kind {
        ChallengeKind::Dns01 => Ok(ChallengeType::Dns01),
        ChallengeKind::Http01 => Ok(ChallengeType::Http01),
        ChallengeKind::TlsAlpn01 => Ok(ChallengeType::TlsAlpn01),
        ChallengeKind::Other(name) => Err(CertError::Acme(format!(
            "challenge type {name} is not supported"
        ))),
    }
}

fn map_authorization_status(status: instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    match status {
        instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
        instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
        _ => AuthorizationStatus::Invalid,
    }
}

fn map_challenge_status(status: instant_acme::ChallengeStatus) -> ChallengeStatus {
    match status {
        instant_acme::ChallengeStatus::Pending => ChallengeStatus::Pending,
        instant_acme::ChallengeStatus::Processing => ChallengeStatus::Processing,
        instant_acme::ChallengeStatus::Valid => ChallengeStatus::Valid,
        _ => ChallengeStatus::Invalid,
    }
}

fn map_order_status(status: instant_acme::OrderStatus) -> OrderStatus {
    match status {
        instant_acme::OrderStatus::Pending => OrderStatus::Pending,
        instant_acme::OrderStatus::Ready => OrderStatus::Ready,
        instant_acme::OrderStatus::Processing => OrderStatus::Processing,
        instant_acme::OrderStatus::Valid => OrderStatus::Valid,
        _ => OrderStatus::Invalid,
    }
}

fn describe_challenge(challenge: &instant_acme::Challenge) -> ChallengeDescriptor {
    ChallengeDescriptor {
        kind: map_challenge_type(&challenge.r#type),
        url: challenge.url.clone(),
        token: challenge.token.clone(),
        status: map_challenge_status(challenge.status),
        error: challenge.error.as_ref().map(|problem| {
            problem
                .detail
                .clone()
                .unwrap_or_else(|| problem.to_string())
        }),
    }
}

impl InstantAcmeOrder {
    /// Walks the order's authorizations once. The first walk fetches their
    /// state; later walks refresh each authorization with one request.
    async fn collect(&self) -> Result<Vec<Authorization>, CertError> {
        let refresh = self.walked.load(Ordering::SeqCst);
        let mut order = self.order.lock().await;
        let mut authorizations = order.authorizations();
        let mut collected = Vec::new();
        let mut key_authorizations = Vec::new();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| acme_error("failed to fetch authorization", e))?;
            if refresh {
                authz
                    .refresh()
                    .await
                    .map_err(|e| acme_error("failed to refresh authorization", e))?;
            }
            let domain = authz.identifier().to_string();
            let status = map_authorization_status(authz.status);
            let challenges: Vec<ChallengeDescriptor> =
                authz.challenges.iter().map(describe_challenge).collect();
            if let Some(handle) = authz.challenge(ChallengeType::Dns01) {
                key_authorizations.push((
                    handle.token.clone(),
                    handle.key_authorization().as_str().to_string(),
                ));
            }
            collected.push(Authorization {
                domain,
                status,
                challenges,
            });
        }
        drop(authorizations);
        drop(order);

        self.walked.store(true, Ordering::SeqCst);
        if let Ok(mut cache) = self.key_authorizations.lock() {
            cache.extend(key_authorizations);
        }
        Ok(collected)
    }

    fn cached_key_authorization(&self, token: &str) -> Option<String> {
        self.key_authorizations
            .lock()
            .ok()
            .and_then(|cache| cache.get(token).cloned())
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn refresh_authorizations(&self) -> Result<Vec<Authorization>, CertError> {
        self.collect().await
    }

    async fn key_authorization(
        &self,
        domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<String, CertError> {
        if let Some(cached) = self.cached_key_authorization(&challenge.token) {
            return Ok(cached);
        }
        let kind = to_challenge_type(&challenge.kind)?;
        let mut order = self.order.lock().await;
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| acme_error("failed to fetch authorization", e))?;
            if authz.identifier().to_string() != domain {
                continue;
            }
            let handle = authz.challenge(kind.clone()).ok_or_else(|| {
                CertError::Acme(format!("{domain} offers no {:?} challenge", challenge.kind))
            })?;
            return Ok(handle.key_authorization().as_str().to_string());
        }
        Err(CertError::Acme(format!("authorization for {domain} disappeared")))
    }

    async fn set_challenge_ready(
        &self,
        domain: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<(), CertError> {
        let kind = to_challenge_type(&challenge.kind)?;
        let mut order = self.order.lock().await;
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| acme_error("failed to fetch authorization", e))?;
            if authz.identifier().to_string() != domain {
                continue;
            }
            let mut handle = authz.challenge(kind.clone()).ok_or_else(|| {
                CertError::Acme(format!("{domain} offers no {:?} challenge", challenge.kind))
            })?;
            return handle
                .set_ready()
                .await
                .map_err(|e| acme_error("failed to trigger challenge validation", e));
        }
        Err(CertError::Acme(format!("authorization for {domain} disappeared")))
    }

    async fn finalize(&self, csr_der: &[u8]) -> Result<(), CertError> {
        self.order
            .lock()
            .await
            .finalize_csr(csr_der)
            .await
            .map_err(|e| CertError::OrderFinalizationError(e.to_string()))
    }

    async fn refresh_status(&self) -> Result<OrderStatus, CertError> {
        let mut order = self.order.lock().await;
        let state = order
            .refresh()
            .await
            .map_err(|e| acme_error("failed to refresh order", e))?;
        Ok(map_order_status(state.status))
    }

    async fn certificate_chain(&self) -> Result<Option<String>, CertError> {
        self.order
            .lock()
            .await
            .certificate()
            .await
            .map_err(|e| acme_error("failed to download certificate", e))
    }
}
