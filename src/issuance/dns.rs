//! DNS-01 TXT record publishing.
//!
//! Challenge values for one order accumulate in a single record set; a set
//! left behind by another order is replaced wholesale.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::types::DnsRecordSet;
use crate::domain::challenge_record_name;
use crate::settings::{DnsChallengeConfig, DnsZoneSettings};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("domain {domain} is not under the zone {zone}")]
    OutsideZone { domain: String, zone: String },
    #[error("DNS provider '{0}' has no registered implementation")]
    UnknownProvider(String),
    #[error("DNS API error: {0}")]
    Api(String),
    #[error("DNS update cancelled")]
    Cancelled,
}

/// Zone client implementations selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsProviderKind {
    AzureDns,
    Memory,
}

impl DnsProviderKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "azure_dns" | "azuredns" => Some(DnsProviderKind::AzureDns),
            "memory" => Some(DnsProviderKind::Memory),
            _ => None,
        }
    }
}

/// Read and replace TXT record sets inside a hosted zone.
#[async_trait]
pub trait DnsZoneClient: Send + Sync {
    /// Existing set at `name`, or `None` when the zone has no such set.
    async fn get_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        name: &str,
    ) -> Result<Option<DnsRecordSet>, DnsError>;

    /// Creates the set or replaces it entirely.
    async fn upsert_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        record: &DnsRecordSet,
    ) -> Result<(), DnsError>;
}

/// Maps provider tags to zone clients.
#[derive(Default, Clone)]
pub struct DnsProviderRegistry {
    clients: Vec<(DnsProviderKind, Arc<dyn DnsZoneClient>)>,
}

impl DnsProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: DnsProviderKind, client: Arc<dyn DnsZoneClient>) -> Self {
        self.clients.retain(|(existing, _)| *existing != kind);
        self.clients.push((kind, client));
        self
    }

    pub fn client_for(&self, tag: &str) -> Result<Arc<dyn DnsZoneClient>, DnsError> {
        let kind =
            DnsProviderKind::from_tag(tag).ok_or_else(|| DnsError::UnknownProvider(tag.to_string()))?;
        self.clients
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map(|(_, client)| Arc::clone(client))
            .ok_or_else(|| DnsError::UnknownProvider(tag.to_string()))
    }
}

async fn unless_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, DnsError>
where
    F: Future<Output = Result<T, DnsError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DnsError::Cancelled),
        result = fut => result,
    }
}

/// Publishes challenge TXT values and waits for them to settle.
#[derive(Clone)]
pub struct DnsRecordPublisher {
    registry: DnsProviderRegistry,
}

impl DnsRecordPublisher {
    pub fn new(registry: DnsProviderRegistry) -> Self {
        Self { registry }
    }

    /// Adds `value` to the challenge record for `domain` in the configured zone.
    ///
    /// Values already present for the same `order_id` are kept; any other
    /// existing set is overwritten. Returns once the settle delay elapses.
    pub async fn publish_challenge_record(
        &self,
        domain: &str,
        value: &str,
        config: &DnsChallengeConfig,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DnsRecordSet, DnsError> {
        let zone = &config.zone;
        let name = challenge_record_name(domain, &zone.name).ok_or_else(|| DnsError::OutsideZone {
            domain: domain.to_string(),
            zone: zone.name.clone(),
        })?;
        let client = self.registry.client_for(&config.provider)?;

        let existing = unless_cancelled(cancel, client.get_txt_record_set(zone, &name)).await?;
        let mut values = match existing {
            Some(existing) if existing.order_id.as_deref() == Some(order_id) => {
                debug!(
                    "[dns-publish] {name}.{} already holds {} value(s) for order {order_id}, appending",
                    zone.name,
                    existing.values.len()
                );
                existing.values
            }
            Some(_) => {
                debug!("[dns-publish] replacing stale record set {name}.{}", zone.name);
                Vec::new()
            }
            None => Vec::new(),
        };
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }

        let record = DnsRecordSet {
            zone: zone.name.clone(),
            name,
            ttl: config.ttl_secs,
            values,
            order_id: Some(order_id.to_string()),
        };
        info!(
            "[dns-publish] writing TXT {}.{} for {domain}: {value}",
            record.name, record.zone
        );
        unless_cancelled(cancel, client.upsert_txt_record_set(zone, &record)).await?;

        let settle = config.settle_delay();
        if !settle.is_zero() {
            debug!("[dns-publish] waiting {}s for DNS to settle", settle.as_secs());
            tokio::select! {
                _ = cancel.cancelled() => return Err(DnsError::Cancelled),
                _ = tokio::time::sleep(settle) => {}
            }
        }
        Ok(record)
    }
}
