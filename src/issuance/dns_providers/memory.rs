use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use log::debug;

use crate::core::types::DnsRecordSet;
use crate::issuance::dns::{DnsError, DnsZoneClient};
use crate::settings::DnsZoneSettings;

/// In-process zone store used by local runs and tests.
#[derive(Default)]
pub struct MemoryDnsZoneClient {
    records: Mutex<HashMap<(String, String), DnsRecordSet>>,
    upserts: AtomicUsize,
}

impl MemoryDnsZoneClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, zone: &str, name: &str) -> Option<DnsRecordSet> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(&key(zone, name)).cloned())
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

fn key(zone: &str, name: &str) -> (String, String) {
    (zone.trim_end_matches('.').to_ascii_lowercase(), name.to_ascii_lowercase())
}

#[async_trait]
impl DnsZoneClient for MemoryDnsZoneClient {
    async fn get_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        name: &str,
    ) -> Result<Option<DnsRecordSet>, DnsError> {
        let records = self
            .records
            .lock()
            .map_err(|err| DnsError::Api(format!("memory zone poisoned: {err}")))?;
        Ok(records.get(&key(&zone.name, name)).cloned())
    }

    async fn upsert_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        record: &DnsRecordSet,
    ) -> Result<(), DnsError> {
        let mut records = self
            .records
            .lock()
            .map_err(|err| DnsError::Api(format!("memory zone poisoned: {err}")))?;
        debug!(
            "[memory-dns] {}.{} <- {:?}",
            record.name, zone.name, record.values
        );
        records.insert(key(&zone.name, &record.name), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
