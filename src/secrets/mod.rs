pub mod credentials;
pub mod key_vault;
pub mod memory;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::{SecretStoreBackendKind, SecretStoreSettings};
use credentials::AzureCredential;
use store::SecretStoreClient;

/// Create the secret store selected in the configuration.
pub fn create_secret_store(
    settings: &SecretStoreSettings,
    credential: Option<Arc<AzureCredential>>,
) -> Result<Arc<dyn SecretStoreClient>> {
    match settings.backend {
        SecretStoreBackendKind::KeyVault => {
            let credential = match credential {
                Some(credential) => credential,
                None => Arc::new(AzureCredential::from_env()?),
            };
            log::info!("[secrets] using Azure Key Vault secret store");
            Ok(Arc::new(key_vault::KeyVaultClient::new(credential)))
        }
        SecretStoreBackendKind::Memory => {
            log::warn!("[secrets] using in-memory secret store; certificates are not persisted");
            Ok(Arc::new(memory::MemorySecretStore::new()))
        }
    }
}
