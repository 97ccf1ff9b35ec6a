use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use openssl::pkcs12::Pkcs12;
use uuid::Uuid;

use super::store::{SecretStoreClient, SecretStoreError};
use crate::core::types::CertificateRecord;

type VaultKey = (String, String);

/// In-process secret store. Imported PKCS#12 bundles are opened with the
/// supplied password and projected into `CertificateRecord`s.
#[derive(Default)]
pub struct MemorySecretStore {
    certificates: Mutex<HashMap<VaultKey, CertificateRecord>>,
    secrets: Mutex<HashMap<VaultKey, String>>,
    friendly_names: Mutex<HashMap<VaultKey, String>>,
    imports: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a certificate as if it had been imported earlier.
    pub fn insert_certificate(&self, name: &str, vault_uri: &str, record: CertificateRecord) {
        if let Ok(mut certificates) = self.certificates.lock() {
            certificates.insert(key(name, vault_uri), record);
        }
    }

    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    /// Friendly name carried by the last bundle imported under `name`.
    pub fn friendly_name(&self, name: &str, vault_uri: &str) -> Option<String> {
        self.friendly_names
            .lock()
            .ok()
            .and_then(|names| names.get(&key(name, vault_uri)).cloned())
    }

    pub fn secret(&self, name: &str, vault_uri: &str) -> Option<String> {
        self.secrets
            .lock()
            .ok()
            .and_then(|secrets| secrets.get(&key(name, vault_uri)).cloned())
    }
}

fn key(name: &str, vault_uri: &str) -> VaultKey {
    (vault_uri.trim_end_matches('/').to_string(), name.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, SecretStoreError> {
    mutex.lock().map_err(map_poison)
}

fn map_poison<T>(err: PoisonError<T>) -> SecretStoreError {
    SecretStoreError::Store(format!("memory store poisoned: {err}"))
}

#[async_trait]
impl SecretStoreClient for MemorySecretStore {
    async fn get_certificate(
        &self,
        name: &str,
        vault_uri: &str,
    ) -> Result<Option<CertificateRecord>, SecretStoreError> {
        Ok(lock(&self.certificates)?.get(&key(name, vault_uri)).cloned())
    }

    async fn import_certificate(
        &self,
        name: &str,
        vault_uri: &str,
        pfx: &[u8],
        password: &str,
    ) -> Result<(), SecretStoreError> {
        let parsed = Pkcs12::from_der(pfx)
            .and_then(|bundle| bundle.parse2(password))
            .map_err(|err| SecretStoreError::Store(format!("invalid PKCS#12 bundle: {err}")))?;
        if parsed.pkey.is_none() {
            return Err(SecretStoreError::Store(
                "PKCS#12 bundle has no private key".to_string(),
            ));
        }
        let cert = parsed.cert.ok_or_else(|| {
            SecretStoreError::Store("PKCS#12 bundle has no certificate".to_string())
        })?;
        let friendly_name = cert
            .alias()
            .map(|alias| String::from_utf8_lossy(alias).into_owned());
        let der = cert
            .to_der()
            .map_err(|err| SecretStoreError::Store(err.to_string()))?;
        let mut record = CertificateRecord::from_der(name, &der)
            .map_err(|err| SecretStoreError::Store(err.to_string()))?;

        let now = Utc::now();
        let version = Uuid::new_v4().simple().to_string();
        record.id = Some(format!(
            "{}/certificates/{name}/{version}",
            vault_uri.trim_end_matches('/')
        ));
        record.version = Some(version);
        record.created = Some(now);
        record.updated = Some(now);
        record.enabled = Some(true);

        debug!("[memory-store] imported certificate {name} into {vault_uri}");
        lock(&self.certificates)?.insert(key(name, vault_uri), record);
        if let Some(friendly_name) = friendly_name {
            lock(&self.friendly_names)?.insert(key(name, vault_uri), friendly_name);
        }
        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_secret(
        &self,
        name: &str,
        vault_uri: &str,
    ) -> Result<Option<String>, SecretStoreError> {
        Ok(lock(&self.secrets)?.get(&key(name, vault_uri)).cloned())
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        vault_uri: &str,
    ) -> Result<(), SecretStoreError> {
        lock(&self.secrets)?.insert(key(name, vault_uri), value.to_string());
        Ok(())
    }
}
