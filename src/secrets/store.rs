use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::CertificateRecord;

/// Errors produced by secret store backends.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store error: {0}")]
    Store(String),
}

/// Remote certificate and secret storage, addressed by vault URI.
///
/// Absence is reported as `Ok(None)`; errors are reserved for an unreachable
/// or misbehaving store.
#[async_trait]
pub trait SecretStoreClient: Send + Sync {
    async fn get_certificate(
        &self,
        name: &str,
        vault_uri: &str,
    ) -> Result<Option<CertificateRecord>, SecretStoreError>;

    async fn import_certificate(
        &self,
        name: &str,
        vault_uri: &str,
        pfx: &[u8],
        password: &str,
    ) -> Result<(), SecretStoreError>;

    async fn get_secret(&self, name: &str, vault_uri: &str)
    -> Result<Option<String>, SecretStoreError>;

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        vault_uri: &str,
    ) -> Result<(), SecretStoreError>;
}
