//! ACME issuance state machine.
//!
//! One attempt walks `AccountReady -> OrderCreated -> Authorizing ->
//! Validating -> Finalizing -> Downloaded -> Done`; any error moves it to
//! `Failed`. Every network call and every wait races the caller's
//! cancellation token, and validation polling is bounded by a deadline.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::acme::{AccountContext, AcmeDirectory, AcmeOrder};
use super::bundle::{build_csr, build_pfx, split_chain};
use super::challenge::{ChallengeContext, ChallengeHandler, HandlerErrorPolicy};
use super::issuer::{CertificateIssuer, IssuedCertificate};
use crate::core::cancel::{guarded, pause_until};
use crate::core::errors::CertError;
use crate::core::types::{
    Authorization, AuthorizationStatus, CertificateRecord, CompletedChallenge, OrderStatus,
};
use crate::settings::{CertificateProfile, IssuanceSettings};
use crate::storage::key_cache::AccountKeyCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Started,
    AccountReady,
    OrderCreated,
    Authorizing,
    Validating,
    Finalizing,
    Downloaded,
    Done,
    Failed,
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IssuanceState::Started => "started",
            IssuanceState::AccountReady => "account-ready",
            IssuanceState::OrderCreated => "order-created",
            IssuanceState::Authorizing => "authorizing",
            IssuanceState::Validating => "validating",
            IssuanceState::Finalizing => "finalizing",
            IssuanceState::Downloaded => "downloaded",
            IssuanceState::Done => "done",
            IssuanceState::Failed => "failed",
        };
        f.write_str(label)
    }
}

struct Attempt<'a> {
    profile: &'a str,
    state: IssuanceState,
}

impl Attempt<'_> {
    fn advance(&mut self, next: IssuanceState) {
        debug!("[acme] {}: {} -> {}", self.profile, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: &CertError) {
        warn!(
            "[acme] {}: issuance failed while {}: {err}",
            self.profile, self.state
        );
        self.state = IssuanceState::Failed;
    }
}

/// Drives ACME orders for certificate profiles.
pub struct AcmeIssuanceEngine {
    directory: Arc<dyn AcmeDirectory>,
    key_cache: Arc<AccountKeyCache>,
    handlers: Vec<Arc<dyn ChallengeHandler>>,
    policy: HandlerErrorPolicy,
    poll_interval: Duration,
    validation_timeout: Duration,
    contact_email: String,
}

impl AcmeIssuanceEngine {
    pub fn new(
        directory: Arc<dyn AcmeDirectory>,
        key_cache: Arc<AccountKeyCache>,
        contact_email: impl Into<String>,
    ) -> Self {
        let defaults = IssuanceSettings::default();
        Self {
            directory,
            key_cache,
            handlers: Vec::new(),
            policy: defaults.handler_error_policy,
            poll_interval: defaults.poll_interval(),
            validation_timeout: defaults.validation_timeout(),
            contact_email: contact_email.into(),
        }
    }

    pub fn with_settings(mut self, settings: &IssuanceSettings) -> Self {
        self.policy = settings.handler_error_policy;
        self.poll_interval = settings.poll_interval();
        self.validation_timeout = settings.validation_timeout();
        self
    }

    /// Registers a handler; handlers are tried in ascending priority.
    pub fn with_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|handler| handler.priority());
        self
    }

    pub fn with_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Account for `server_alias`, restored from the key cache when a fresh
    /// key exists and registered with the CA otherwise.
    pub async fn get_or_create_account(
        &self,
        server_alias: &str,
        directory_url: &str,
        cancel: &CancellationToken,
    ) -> Result<AccountContext, CertError> {
        if let Some(key) = self.key_cache.get_account_key(server_alias).await {
            match guarded(cancel, self.directory.restore_account(directory_url, &key)).await {
                Ok(account) => {
                    info!("[acme] using cached account key for {server_alias}");
                    return Ok(AccountContext {
                        server_alias: server_alias.to_string(),
                        directory_url: directory_url.to_string(),
                        account,
                    });
                }
                Err(CertError::Cancelled) => return Err(CertError::Cancelled),
                Err(err) => warn!(
                    "[acme] cached account key for {server_alias} is unusable, registering a new account: {err}"
                ),
            }
        }

        info!("[acme] creating new ACME account for {server_alias}");
        let (account, key) = guarded(
            cancel,
            self.directory.create_account(directory_url, &self.contact_email),
        )
        .await?;
        if let Err(err) = self.key_cache.save_account_key(&key, server_alias).await {
            warn!("[acme] failed to cache account key for {server_alias}: {err:#}");
        }
        Ok(AccountContext {
            server_alias: server_alias.to_string(),
            directory_url: directory_url.to_string(),
            account,
        })
    }

    async fn complete_authorization(
        &self,
        authorization: &Authorization,
        ctx: &ChallengeContext<'_>,
    ) -> Result<CompletedChallenge, CertError> {
        for handler in &self.handlers {
            match guarded(ctx.cancel, handler.try_complete(authorization, ctx)).await {
                Ok(Some(completed)) => {
                    info!(
                        "[acme] {} satisfied by {} handler",
                        authorization.domain,
                        handler.name()
                    );
                    return Ok(completed);
                }
                Ok(None) => continue,
                Err(CertError::Cancelled) => return Err(CertError::Cancelled),
                Err(err) => match self.policy {
                    HandlerErrorPolicy::Skip => warn!(
                        "[acme] {} handler failed for {}, trying next: {err}",
                        handler.name(),
                        authorization.domain
                    ),
                    HandlerErrorPolicy::FailFast => return Err(err),
                },
            }
        }
        Err(CertError::AuthorizationUnsatisfiable(
            authorization.domain.clone(),
        ))
    }

    /// Refreshes the whole batch of authorizations each cycle until none is pending.
    async fn await_validation(
        &self,
        order: &dyn AcmeOrder,
        cancel: &CancellationToken,
    ) -> Result<Vec<Authorization>, CertError> {
        let started = Instant::now();
        let deadline = started + self.validation_timeout;
        loop {
            let refreshed = guarded(cancel, order.refresh_authorizations()).await?;
            let pending: Vec<String> = refreshed
                .iter()
                .filter(|authz| authz.status == AuthorizationStatus::Pending)
                .map(|authz| authz.domain.clone())
                .collect();
            if pending.is_empty() {
                return Ok(refreshed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CertError::ValidationTimeout {
                    elapsed_secs: now.duration_since(started).as_secs(),
                    pending,
                });
            }
            debug!(
                "[acme] {} authorization(s) still pending: {}",
                pending.len(),
                pending.join(",")
            );
            pause_until(cancel, (now + self.poll_interval).min(deadline)).await?;
        }
    }

    async fn await_issued(
        &self,
        order: &dyn AcmeOrder,
        domains: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), CertError> {
        let started = Instant::now();
        let deadline = started + self.validation_timeout;
        loop {
            match guarded(cancel, order.refresh_status()).await? {
                OrderStatus::Valid => return Ok(()),
                OrderStatus::Processing => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CertError::ValidationTimeout {
                            elapsed_secs: now.duration_since(started).as_secs(),
                            pending: domains.to_vec(),
                        });
                    }
                    debug!("[acme] order {} is processing", order.id());
                    pause_until(cancel, (now + self.poll_interval).min(deadline)).await?;
                }
                status => {
                    return Err(CertError::OrderFinalizationError(format!(
                        "order {} finished with status {status:?}",
                        order.id()
                    )));
                }
            }
        }
    }

    async fn run(
        &self,
        profile: &CertificateProfile,
        attempt: &mut Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificate, CertError> {
        let directory_url = profile.directory_url().ok_or_else(|| {
            CertError::Configuration(format!(
                "certificate {}: unknown acme_server '{}'",
                profile.name, profile.acme_server
            ))
        })?;
        let account = self
            .get_or_create_account(&profile.acme_server, &directory_url, cancel)
            .await?;
        attempt.advance(IssuanceState::AccountReady);

        let domains = order_domains(profile);
        let order = guarded(cancel, account.new_order(&domains)).await?;
        info!(
            "[acme] order {} created for {}",
            order.id(),
            domains.join(",")
        );
        attempt.advance(IssuanceState::OrderCreated);

        let authorizations = guarded(cancel, order.refresh_authorizations()).await?;
        attempt.advance(IssuanceState::Authorizing);
        let ctx = ChallengeContext {
            order: order.as_ref(),
            profile,
            cancel,
        };
        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Valid => {
                    debug!("[acme] {} is already authorized", authorization.domain);
                }
                AuthorizationStatus::Invalid => {
                    debug!("[acme] {} is already invalid", authorization.domain);
                }
                AuthorizationStatus::Pending => {
                    self.complete_authorization(authorization, &ctx).await?;
                }
            }
        }

        attempt.advance(IssuanceState::Validating);
        let validated = self.await_validation(order.as_ref(), cancel).await?;
        let failures: Vec<String> = validated
            .iter()
            .filter(|authz| authz.status == AuthorizationStatus::Invalid)
            .map(Authorization::failure_summary)
            .collect();
        if !failures.is_empty() {
            return Err(CertError::DomainValidationFailed(failures.join(";")));
        }

        attempt.advance(IssuanceState::Finalizing);
        let csr = build_csr(&domains)?;
        guarded(cancel, order.finalize(&csr.csr_der)).await?;
        self.await_issued(order.as_ref(), &domains, cancel).await?;

        let chain_pem = guarded(cancel, order.certificate_chain())
            .await?
            .ok_or_else(|| {
                CertError::OrderFinalizationError(format!(
                    "order {} is valid but has no certificate",
                    order.id()
                ))
            })?;
        attempt.advance(IssuanceState::Downloaded);
        log_issued(profile, &chain_pem);

        let pfx = build_pfx(
            &chain_pem,
            &csr.key_pem,
            profile.pfx_password(),
            profile.common_name(),
        )?;
        attempt.advance(IssuanceState::Done);
        Ok(IssuedCertificate { pfx })
    }
}

/// Domains as sent to the CA; the first entry stays the common name.
fn order_domains(profile: &CertificateProfile) -> Vec<String> {
    profile
        .domains
        .iter()
        .map(|domain| domain.trim().trim_end_matches('.').to_ascii_lowercase())
        .collect()
}

fn log_issued(profile: &CertificateProfile, chain_pem: &str) {
    let summary = split_chain(chain_pem)
        .and_then(|(leaf, _)| Ok(leaf.to_der()?))
        .and_then(|der| CertificateRecord::from_der(profile.kv_cert_name(), &der));
    match summary {
        Ok(record) => info!(
            "[acme] issued certificate for {}: subject={} expires={} issuer={} san={}",
            profile.name,
            record.subject,
            record.expires,
            record.issuer_name,
            record.subject_alternative_names.join(",")
        ),
        Err(err) => warn!(
            "[acme] issued certificate for {} could not be inspected: {err:#}",
            profile.name
        ),
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuanceEngine {
    async fn request_certificate(
        &self,
        profile: &CertificateProfile,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificate, CertError> {
        let mut attempt = Attempt {
            profile: &profile.name,
            state: IssuanceState::Started,
        };
        let result = self.run(profile, &mut attempt, cancel).await;
        if let Err(err) = &result {
            attempt.fail(err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChallengeDescriptor, ChallengeKind, ChallengeStatus};
    use crate::issuance::acme::AcmeAccount;
    use crate::settings::KeyVaultLocation;
    use crate::storage::key_cache::KeyCacheBackend;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemoryBackend {
        blobs: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl KeyCacheBackend for MemoryBackend {
        async fn read(&self, alias: &str) -> anyhow::Result<Option<String>> {
            Ok(self.blobs.lock().expect("lock").get(alias).cloned())
        }

        async fn write(&self, alias: &str, data: &str) -> anyhow::Result<()> {
            self.blobs
                .lock()
                .expect("lock")
                .insert(alias.to_string(), data.to_string());
            Ok(())
        }
    }

    /// Order whose authorizations report `final_status` once their challenge is ready.
    struct ScriptedOrder {
        domains: Vec<String>,
        final_status: AuthorizationStatus,
        order_status: OrderStatus,
        ready: Mutex<Vec<String>>,
        walks: Arc<AtomicUsize>,
    }

    impl ScriptedOrder {
        fn authorization(&self, domain: &str) -> Authorization {
            let ready = self.ready.lock().expect("lock").contains(&domain.to_string());
            let (status, challenge_status, error) = match (ready, self.final_status) {
                (false, _) | (true, AuthorizationStatus::Pending) => {
                    (AuthorizationStatus::Pending, ChallengeStatus::Pending, None)
                }
                (true, AuthorizationStatus::Valid) => {
                    (AuthorizationStatus::Valid, ChallengeStatus::Valid, None)
                }
                (true, AuthorizationStatus::Invalid) => (
                    AuthorizationStatus::Invalid,
                    ChallengeStatus::Invalid,
                    Some("no TXT record found".to_string()),
                ),
            };
            Authorization {
                domain: domain.to_string(),
                status,
                challenges: vec![ChallengeDescriptor {
                    kind: ChallengeKind::Dns01,
                    url: format!("https://ca.test/chall/{domain}"),
                    token: format!("token-{domain}"),
                    status: challenge_status,
                    error,
                }],
            }
        }
    }

    #[async_trait]
    impl AcmeOrder for ScriptedOrder {
        fn id(&self) -> &str {
            "order-1"
        }

        async fn refresh_authorizations(&self) -> Result<Vec<Authorization>, CertError> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            Ok(self.domains.iter().map(|d| self.authorization(d)).collect())
        }

        async fn key_authorization(
            &self,
            domain: &str,
            _challenge: &ChallengeDescriptor,
        ) -> Result<String, CertError> {
            Ok(format!("token-{domain}.thumbprint"))
        }

        async fn set_challenge_ready(
            &self,
            domain: &str,
            _challenge: &ChallengeDescriptor,
        ) -> Result<(), CertError> {
            self.ready.lock().expect("lock").push(domain.to_string());
            Ok(())
        }

        async fn finalize(&self, _csr_der: &[u8]) -> Result<(), CertError> {
            Ok(())
        }

        async fn refresh_status(&self) -> Result<OrderStatus, CertError> {
            Ok(self.order_status)
        }

        async fn certificate_chain(&self) -> Result<Option<String>, CertError> {
            Ok(None)
        }
    }

    struct ScriptedAccount {
        final_status: AuthorizationStatus,
        order_status: OrderStatus,
        walks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AcmeAccount for ScriptedAccount {
        async fn new_order(&self, domains: &[String]) -> Result<Arc<dyn AcmeOrder>, CertError> {
            Ok(Arc::new(ScriptedOrder {
                domains: domains.to_vec(),
                final_status: self.final_status,
                order_status: self.order_status,
                ready: Mutex::new(Vec::new()),
                walks: Arc::clone(&self.walks),
            }))
        }
    }

    struct ScriptedDirectory {
        final_status: AuthorizationStatus,
        order_status: OrderStatus,
        created: AtomicUsize,
        restored: AtomicUsize,
        walks: Arc<AtomicUsize>,
    }

    impl ScriptedDirectory {
        fn new(final_status: AuthorizationStatus) -> Arc<Self> {
            Self::with_order_status(final_status, OrderStatus::Invalid)
        }

        fn with_order_status(
            final_status: AuthorizationStatus,
            order_status: OrderStatus,
        ) -> Arc<Self> {
            Arc::new(Self {
                final_status,
                order_status,
                created: AtomicUsize::new(0),
                restored: AtomicUsize::new(0),
                walks: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn account(&self) -> Arc<dyn AcmeAccount> {
            Arc::new(ScriptedAccount {
                final_status: self.final_status,
                order_status: self.order_status,
                walks: Arc::clone(&self.walks),
            })
        }
    }

    #[async_trait]
    impl AcmeDirectory for ScriptedDirectory {
        async fn create_account(
            &self,
            _directory_url: &str,
            _contact_email: &str,
        ) -> Result<(Arc<dyn AcmeAccount>, String), CertError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok((self.account(), "account-key".to_string()))
        }

        async fn restore_account(
            &self,
            _directory_url: &str,
            account_key: &str,
        ) -> Result<Arc<dyn AcmeAccount>, CertError> {
            if account_key != "account-key" {
                return Err(CertError::Acme("unknown account".into()));
            }
            self.restored.fetch_add(1, Ordering::SeqCst);
            Ok(self.account())
        }
    }

    enum Behaviour {
        Decline,
        Complete,
        Fail,
        Hang,
    }

    struct RecordingHandler {
        name: &'static str,
        priority: i32,
        behaviour: Behaviour,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ChallengeHandler for RecordingHandler {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn name(&self) -> &'static str {
            self.name
        }

        async fn try_complete(
            &self,
            authorization: &Authorization,
            ctx: &ChallengeContext<'_>,
        ) -> Result<Option<CompletedChallenge>, CertError> {
            self.calls.lock().expect("lock").push(self.name);
            match self.behaviour {
                Behaviour::Decline => Ok(None),
                Behaviour::Fail => Err(CertError::Acme("handler exploded".into())),
                Behaviour::Hang => std::future::pending().await,
                Behaviour::Complete => {
                    let challenge = authorization
                        .challenge(&ChallengeKind::Dns01)
                        .expect("dns challenge");
                    ctx.order
                        .set_challenge_ready(&authorization.domain, challenge)
                        .await?;
                    Ok(Some(CompletedChallenge {
                        domain: authorization.domain.clone(),
                        kind: ChallengeKind::Dns01,
                        token: challenge.token.clone(),
                        status: ChallengeStatus::Processing,
                    }))
                }
            }
        }
    }

    fn handler(
        name: &'static str,
        priority: i32,
        behaviour: Behaviour,
        calls: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn ChallengeHandler> {
        Arc::new(RecordingHandler {
            name,
            priority,
            behaviour,
            calls: Arc::clone(calls),
        })
    }

    fn profile(domains: &[&str]) -> CertificateProfile {
        CertificateProfile {
            name: "example".into(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            acme_server: "staging".into(),
            dns_challenge: None,
            key_vault: KeyVaultLocation {
                uri: "https://vault.test".into(),
            },
            kv_cert_name: None,
            pfx_password: None,
            auto_renew: true,
        }
    }

    fn engine(directory: Arc<ScriptedDirectory>) -> (AcmeIssuanceEngine, Arc<AccountKeyCache>) {
        let cache = Arc::new(AccountKeyCache::new(Box::new(MemoryBackend::default()), 24));
        let engine = AcmeIssuanceEngine::new(directory, Arc::clone(&cache), "ops@example.com")
            .with_poll_interval(Duration::from_secs(5))
            .with_validation_timeout(Duration::from_secs(60));
        (engine, cache)
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order_until_one_completes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Valid));
        let engine = engine
            .with_handler(handler("late", 10, Behaviour::Complete, &calls))
            .with_handler(handler("early", 1, Behaviour::Decline, &calls))
            .with_handler(handler("middle", 5, Behaviour::Complete, &calls));

        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("scripted order never issues");

        assert!(matches!(err, CertError::OrderFinalizationError(_)));
        assert_eq!(*calls.lock().expect("lock"), vec!["early", "middle"]);
    }

    #[tokio::test]
    async fn unsatisfied_authorization_fails_request() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Valid));
        let engine = engine.with_handler(handler("decline", 1, Behaviour::Decline, &calls));

        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("must fail");
        match err {
            CertError::AuthorizationUnsatisfiable(domain) => assert_eq!(domain, "example.com"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn skip_policy_falls_through_failing_handler() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Valid));
        let engine = engine
            .with_handler(handler("broken", 1, Behaviour::Fail, &calls))
            .with_handler(handler("working", 2, Behaviour::Complete, &calls));

        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("scripted order never issues");
        assert!(matches!(err, CertError::OrderFinalizationError(_)));
        assert_eq!(*calls.lock().expect("lock"), vec!["broken", "working"]);
    }

    #[tokio::test]
    async fn fail_fast_policy_propagates_handler_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Valid));
        let engine = engine
            .with_policy(HandlerErrorPolicy::FailFast)
            .with_handler(handler("broken", 1, Behaviour::Fail, &calls))
            .with_handler(handler("working", 2, Behaviour::Complete, &calls));

        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, CertError::Acme(_)));
        assert_eq!(*calls.lock().expect("lock"), vec!["broken"]);
    }

    #[tokio::test]
    async fn invalid_authorizations_are_aggregated() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Invalid));
        let engine = engine.with_handler(handler("dns", 1, Behaviour::Complete, &calls));

        let err = engine
            .request_certificate(
                &profile(&["example.com", "www.example.com"]),
                &CancellationToken::new(),
            )
            .await
            .err()
            .expect("must fail");
        match err {
            CertError::DomainValidationFailed(message) => assert_eq!(
                message,
                "example.com: no TXT record found;www.example.com: no TXT record found"
            ),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_validation_times_out_with_pending_domains() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Pending));
        let engine = engine.with_handler(handler("dns", 1, Behaviour::Complete, &calls));

        let started = Instant::now();
        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("must time out");
        match err {
            CertError::ValidationTimeout {
                elapsed_secs,
                pending,
            } => {
                assert_eq!(pending, vec!["example.com".to_string()]);
                assert!(elapsed_secs >= 60);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Pending));
        let engine = engine.with_handler(handler("dns", 1, Behaviour::Complete, &calls));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let err = engine
            .request_certificate(&profile(&["example.com"]), &cancel)
            .await
            .err()
            .expect("must cancel");
        assert!(matches!(err, CertError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reaches_stalled_handler() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::new(AuthorizationStatus::Valid));
        let engine = engine.with_handler(handler("stalled", 1, Behaviour::Hang, &calls));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            engine.request_certificate(&profile(&["example.com"]), &cancel),
        )
        .await
        .expect("engine must return once cancelled");
        assert!(matches!(outcome, Err(CertError::Cancelled)));
        assert_eq!(*calls.lock().expect("lock"), vec!["stalled"]);
    }

    #[tokio::test]
    async fn validation_refreshes_all_authorizations_in_one_pass() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let directory = ScriptedDirectory::new(AuthorizationStatus::Valid);
        let (engine, _) = engine(Arc::clone(&directory));
        let engine = engine.with_handler(handler("dns", 1, Behaviour::Complete, &calls));

        engine
            .request_certificate(
                &profile(&["example.com", "www.example.com", "api.example.com"]),
                &CancellationToken::new(),
            )
            .await
            .err()
            .expect("scripted order never issues");

        // One walk to list the authorizations, one validation cycle.
        assert_eq!(directory.walks.load(Ordering::SeqCst), 2);
        assert_eq!(calls.lock().expect("lock").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn order_stuck_processing_times_out() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, _) = engine(ScriptedDirectory::with_order_status(
            AuthorizationStatus::Valid,
            OrderStatus::Processing,
        ));
        let engine = engine.with_handler(handler("dns", 1, Behaviour::Complete, &calls));

        let err = engine
            .request_certificate(&profile(&["example.com"]), &CancellationToken::new())
            .await
            .err()
            .expect("must time out");
        match err {
            CertError::ValidationTimeout {
                elapsed_secs,
                pending,
            } => {
                assert_eq!(pending, vec!["example.com".to_string()]);
                assert!(elapsed_secs >= 60);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn account_key_is_cached_then_reused() {
        let directory = ScriptedDirectory::new(AuthorizationStatus::Valid);
        let (engine, cache) = engine(Arc::clone(&directory));
        let cancel = CancellationToken::new();

        engine
            .get_or_create_account("staging", "https://ca.test/dir", &cancel)
            .await
            .expect("create");
        assert_eq!(directory.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get_account_key("staging").await.as_deref(),
            Some("account-key")
        );

        engine
            .get_or_create_account("staging", "https://ca.test/dir", &cancel)
            .await
            .expect("restore");
        assert_eq!(directory.created.load(Ordering::SeqCst), 1);
        assert_eq!(directory.restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_cached_key_registers_new_account() {
        let directory = ScriptedDirectory::new(AuthorizationStatus::Valid);
        let (engine, cache) = engine(Arc::clone(&directory));
        cache
            .save_account_key("stale-key", "staging")
            .await
            .expect("seed");

        engine
            .get_or_create_account("staging", "https://ca.test/dir", &CancellationToken::new())
            .await
            .expect("account");
        assert_eq!(directory.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get_account_key("staging").await.as_deref(),
            Some("account-key")
        );
    }

    #[test]
    fn order_domains_keep_common_name_first() {
        let domains = order_domains(&profile(&["Example.com.", "*.example.com"]));
        assert_eq!(domains, vec!["example.com".to_string(), "*.example.com".to_string()]);
    }
}
