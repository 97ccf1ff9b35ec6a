//! Pluggable strategies for satisfying one domain authorization.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use log::{debug, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::acme::AcmeOrder;
use super::dns::DnsRecordPublisher;
use crate::core::cancel::guarded;
use crate::core::errors::CertError;
use crate::core::types::{Authorization, ChallengeKind, ChallengeStatus, CompletedChallenge};
use crate::settings::CertificateProfile;

/// What the engine does when a handler fails instead of declining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Log the failure and offer the authorization to the next handler.
    #[default]
    Skip,
    /// Abort the issuance attempt with the handler's error.
    FailFast,
}

/// Everything a handler may need about the order in progress.
pub struct ChallengeContext<'a> {
    pub order: &'a dyn AcmeOrder,
    pub profile: &'a CertificateProfile,
    pub cancel: &'a CancellationToken,
}

impl ChallengeContext<'_> {
    pub fn order_id(&self) -> &str {
        self.order.id()
    }
}

#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Lower values are tried first.
    fn priority(&self) -> i32;

    fn name(&self) -> &'static str;

    /// Satisfies `authorization` and tells the CA to validate it.
    ///
    /// `Ok(None)` means the handler does not apply to this authorization.
    async fn try_complete(
        &self,
        authorization: &Authorization,
        ctx: &ChallengeContext<'_>,
    ) -> Result<Option<CompletedChallenge>, CertError>;
}

/// TXT value for a DNS-01 challenge: base64url(SHA-256(key authorization)).
pub fn dns01_txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Completes DNS-01 challenges by publishing the TXT record in the profile's zone.
pub struct Dns01ChallengeHandler {
    publisher: Arc<DnsRecordPublisher>,
}

impl Dns01ChallengeHandler {
    pub const PRIORITY: i32 = 1;

    pub fn new(publisher: Arc<DnsRecordPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ChallengeHandler for Dns01ChallengeHandler {
    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn name(&self) -> &'static str {
        "dns-01"
    }

    async fn try_complete(
        &self,
        authorization: &Authorization,
        ctx: &ChallengeContext<'_>,
    ) -> Result<Option<CompletedChallenge>, CertError> {
        let Some(dns) = ctx.profile.dns_challenge.as_ref() else {
            debug!(
                "[dns-01] certificate {} has no DNS challenge settings",
                ctx.profile.name
            );
            return Ok(None);
        };
        let Some(challenge) = authorization.challenge(&ChallengeKind::Dns01) else {
            debug!("[dns-01] {} offers no dns-01 challenge", authorization.domain);
            return Ok(None);
        };

        info!("[dns-01] processing DNS challenge for {}", authorization.domain);
        let key_authorization = guarded(
            ctx.cancel,
            ctx.order.key_authorization(&authorization.domain, challenge),
        )
        .await?;
        let value = dns01_txt_value(&key_authorization);
        self.publisher
            .publish_challenge_record(&authorization.domain, &value, dns, ctx.order_id(), ctx.cancel)
            .await?;
        guarded(
            ctx.cancel,
            ctx.order.set_challenge_ready(&authorization.domain, challenge),
        )
        .await?;

        // The CA validates asynchronously once told the challenge is ready.
        Ok(Some(CompletedChallenge {
            domain: authorization.domain.clone(),
            kind: ChallengeKind::Dns01,
            token: challenge.token.clone(),
            status: ChallengeStatus::Processing,
        }))
    }
}
