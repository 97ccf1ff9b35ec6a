//! Renewal policy: decides when a profile needs a new certificate, drives the
//! issuer and confirms the upload. The sweep renews every due profile on its
//! own task under one overall deadline.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Duration;
use log::{error, info, warn};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::core::cancel::guarded;
use crate::core::errors::CertError;
use crate::core::types::{CertificateRecord, SweepFailure, SweepReport};
use crate::issuance::CertificateIssuer;
use crate::secrets::store::SecretStoreClient;
use crate::settings::{AppSettings, CertificateProfile};

/// Current certificate plus whether it is already expired.
#[derive(Debug, Clone)]
pub struct ExpiryStatus {
    pub record: CertificateRecord,
    pub expiring: bool,
}

pub struct CertificateRenewalOrchestrator {
    settings: Arc<AppSettings>,
    store: Arc<dyn SecretStoreClient>,
    issuer: Arc<dyn CertificateIssuer>,
}

impl CertificateRenewalOrchestrator {
    pub fn new(
        settings: Arc<AppSettings>,
        store: Arc<dyn SecretStoreClient>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        Self {
            settings,
            store,
            issuer,
        }
    }

    pub fn profile(&self, name: &str) -> Result<&CertificateProfile, CertError> {
        if name.trim().is_empty() {
            return Err(CertError::InvalidArgument(
                "certificate name can't be empty".to_string(),
            ));
        }
        self.settings
            .profile(name)
            .ok_or_else(|| CertError::ProfileNotFound(name.to_string()))
    }

    async fn stored_certificate(
        &self,
        profile: &CertificateProfile,
    ) -> Result<Option<CertificateRecord>, CertError> {
        let record = self
            .store
            .get_certificate(profile.kv_cert_name(), profile.vault_uri())
            .await?;
        Ok(record.map(|record| record.for_profile(&profile.name)))
    }

    /// Certificate currently held by the secret store for profile `name`.
    pub async fn get_certificate(&self, name: &str) -> Result<CertificateRecord, CertError> {
        let profile = self.profile(name)?;
        self.stored_certificate(profile)
            .await?
            .ok_or_else(|| CertError::CertificateUnavailable(name.to_string()))
    }

    pub fn is_expiring_within(record: &CertificateRecord, buffer: Duration) -> bool {
        record.is_expiring_within(buffer)
    }

    /// Looks the certificate up and checks it against a zero buffer.
    pub async fn check_status(&self, name: &str) -> Result<ExpiryStatus, CertError> {
        let record = self.get_certificate(name).await?;
        let expiring = Self::is_expiring_within(&record, Duration::zero());
        if expiring {
            warn!("[renewal] certificate {name} expired on {}", record.expires);
        }
        Ok(ExpiryStatus { record, expiring })
    }

    /// Renews `name` when it is due, or unconditionally with `force`.
    ///
    /// `Ok(None)` means the current certificate is outside the renewal window.
    pub async fn renew(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CertificateRecord>, CertError> {
        let profile = self.profile(name)?;
        let threshold = self.settings.renewal_threshold();

        if force {
            info!("[renewal] {name}: forced renewal requested");
        } else {
            match guarded(cancel, self.stored_certificate(profile)).await? {
                Some(existing) if !Self::is_expiring_within(&existing, threshold) => {
                    info!(
                        "[renewal] {name}: certificate expires {}, not due for renewal",
                        existing.expires
                    );
                    return Ok(None);
                }
                Some(existing) => info!(
                    "[renewal] {name}: certificate expires {}, within {} days",
                    existing.expires,
                    threshold.num_days()
                ),
                None => info!("[renewal] {name}: no certificate in the secret store yet"),
            }
        }

        let issued = self.issuer.request_certificate(profile, cancel).await?;
        info!(
            "[renewal] {name}: uploading certificate as {} to {}",
            profile.kv_cert_name(),
            profile.vault_uri()
        );
        guarded(cancel, async {
            self.store
                .import_certificate(
                    profile.kv_cert_name(),
                    profile.vault_uri(),
                    &issued.pfx,
                    profile.pfx_password(),
                )
                .await
                .map_err(CertError::from)
        })
        .await?;

        let record = guarded(cancel, self.stored_certificate(profile))
            .await?
            .ok_or_else(|| CertError::PostUploadVerificationFailed(name.to_string()))?;
        info!(
            "[renewal] {name}: renewed, thumbprint {} expires {}",
            record.thumbprint, record.expires
        );
        Ok(Some(record))
    }

    /// Renews every auto-renew profile that is due. One profile's failure or
    /// hang never prevents the others from being attempted; profiles still
    /// running at the sweep deadline are cancelled and reported as failed.
    pub async fn renew_all_due(self: &Arc<Self>, shutdown: &CancellationToken) -> SweepReport {
        let names: Vec<String> = self
            .settings
            .certificates
            .iter()
            .filter(|profile| profile.auto_renew)
            .map(|profile| profile.name.clone())
            .collect();
        let timeout = self.settings.issuance.sweep_timeout();
        info!(
            "[sweep] checking {} certificate(s), deadline {}s",
            names.len(),
            timeout.as_secs()
        );

        let sweep_cancel = shutdown.child_token();
        let permits = Arc::new(Semaphore::new(self.settings.issuance.max_concurrent_renewals));
        let mut tasks = JoinSet::new();
        for name in &names {
            let orchestrator = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = sweep_cancel.child_token();
            let name = name.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(CertError::Cancelled),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => orchestrator.renew(&name, false, &cancel).await,
                        Err(err) => Err(CertError::Internal(err.into())),
                    },
                };
                (name, result)
            });
        }

        let mut report = SweepReport::default();
        let mut unfinished: BTreeSet<String> = names.iter().cloned().collect();
        let deadline = Instant::now() + timeout;
        let mut expired = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, result))) => {
                        unfinished.remove(&name);
                        match result {
                            Ok(Some(_)) => report.renewed.push(name),
                            Ok(None) => report.skipped.push(name),
                            Err(err) => {
                                error!("[sweep] renewal of {name} failed: {err}");
                                report.failed.push(SweepFailure {
                                    name,
                                    error: err.to_string(),
                                });
                            }
                        }
                    }
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => warn!("[sweep] renewal task ended abnormally: {err}"),
                },
                _ = tokio::time::sleep_until(deadline), if !expired => {
                    expired = true;
                    warn!(
                        "[sweep] deadline of {}s reached, cancelling {} renewal(s)",
                        timeout.as_secs(),
                        unfinished.len()
                    );
                    sweep_cancel.cancel();
                    tasks.abort_all();
                }
            }
        }

        for name in unfinished {
            let reason = if expired {
                format!("sweep deadline of {}s exceeded", timeout.as_secs())
            } else {
                "renewal task did not complete".to_string()
            };
            error!("[sweep] renewal of {name} failed: {reason}");
            report.failed.push(SweepFailure {
                name,
                error: reason,
            });
        }

        report.renewed.sort();
        report.skipped.sort();
        report.failed.sort_by(|a, b| a.name.cmp(&b.name));
        info!(
            "[sweep] done: {} renewed, {} not due, {} failed",
            report.renewed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }
}
