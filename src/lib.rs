pub mod api;
pub mod core;
pub mod domain;
pub mod http;
pub mod issuance;
pub mod renewal;
pub mod scheduler;
pub mod secrets;
pub mod settings;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use issuance::acme::{AcmeDirectory, InstantAcmeDirectory};
use issuance::challenge::Dns01ChallengeHandler;
use issuance::dns::{DnsProviderKind, DnsProviderRegistry, DnsRecordPublisher};
use issuance::dns_providers::{AzureDnsClient, MemoryDnsZoneClient};
use issuance::AcmeIssuanceEngine;
use renewal::CertificateRenewalOrchestrator;
use secrets::credentials::AzureCredential;
use secrets::store::SecretStoreClient;
use settings::{AppSettings, SecretStoreBackendKind};
use storage::key_cache::AccountKeyCache;

/// Wires the production collaborators described by `settings`.
pub fn build_orchestrator(settings: AppSettings) -> Result<Arc<CertificateRenewalOrchestrator>> {
    let needs_azure = settings.secret_store.backend == SecretStoreBackendKind::KeyVault
        || settings.certificates.iter().any(|profile| {
            profile.dns_challenge.as_ref().is_some_and(|dns| {
                DnsProviderKind::from_tag(&dns.provider) == Some(DnsProviderKind::AzureDns)
            })
        });
    let credential = if needs_azure {
        Some(Arc::new(
            AzureCredential::from_env().context("Azure credentials are not configured")?,
        ))
    } else {
        None
    };

    let store = secrets::create_secret_store(&settings.secret_store, credential.clone())?;
    let mut registry = DnsProviderRegistry::new().register(
        DnsProviderKind::Memory,
        Arc::new(MemoryDnsZoneClient::new()),
    );
    if let Some(credential) = credential {
        registry = registry.register(
            DnsProviderKind::AzureDns,
            Arc::new(AzureDnsClient::new(credential)),
        );
    }

    build_orchestrator_with(
        settings,
        store,
        Arc::new(InstantAcmeDirectory::new()),
        registry,
    )
}

/// Wires the orchestrator over explicit collaborators.
pub fn build_orchestrator_with(
    settings: AppSettings,
    store: Arc<dyn SecretStoreClient>,
    directory: Arc<dyn AcmeDirectory>,
    registry: DnsProviderRegistry,
) -> Result<Arc<CertificateRenewalOrchestrator>> {
    let key_cache = Arc::new(AccountKeyCache::from_settings(
        &settings.acme_key_cache,
        Arc::clone(&store),
    )?);
    let publisher = Arc::new(DnsRecordPublisher::new(registry));
    let engine = AcmeIssuanceEngine::new(directory, key_cache, settings.acme_account.email.clone())
        .with_settings(&settings.issuance)
        .with_handler(Arc::new(Dns01ChallengeHandler::new(publisher)));

    info!(
        "[renewal] managing {} certificate profile(s)",
        settings.certificates.len()
    );
    Ok(Arc::new(CertificateRenewalOrchestrator::new(
        Arc::new(settings),
        store,
        Arc::new(engine),
    )))
}
