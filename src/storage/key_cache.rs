//! ACME account key cache.
//!
//! One blob per CA server alias holds the account key material and the time
//! it was cached. Reads never fail: unreadable, malformed or stale entries
//! are logged and reported as absent so the caller registers a new account.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use crate::core::types::AccountKeyCacheEntry;
use crate::secrets::store::SecretStoreClient;
use crate::settings::{KeyCacheBackendKind, KeyCacheSettings};

/// Raw storage for cache blobs, keyed by CA server alias.
#[async_trait]
pub trait KeyCacheBackend: Send + Sync {
    async fn read(&self, server_alias: &str) -> Result<Option<String>>;
    async fn write(&self, server_alias: &str, data: &str) -> Result<()>;
}

/// Stores each alias next to the configured path: `acme-account.json`
/// becomes `acme-account.staging.json`.
pub struct FileKeyCacheBackend {
    base_path: PathBuf,
}

impl FileKeyCacheBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn path_for(&self, server_alias: &str) -> PathBuf {
        let alias = sanitize_alias(server_alias);
        let stem = self
            .base_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "acme-account".to_string());
        let file_name = match self.base_path.extension() {
            Some(ext) => format!("{stem}.{alias}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{alias}"),
        };
        self.base_path.with_file_name(file_name)
    }
}

#[async_trait]
impl KeyCacheBackend for FileKeyCacheBackend {
    async fn read(&self, server_alias: &str) -> Result<Option<String>> {
        let path = self.path_for(server_alias);
        if !path.exists() {
            return Ok(None);
        }
        debug!("[key-cache] reading account key from {}", path.display());
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    async fn write(&self, server_alias: &str, data: &str) -> Result<()> {
        let path = self.path_for(server_alias);
        info!("[key-cache] saving account key to {}", path.display());
        let data = data.to_string();
        tokio::task::spawn_blocking(move || write_secure_file(&path, data.as_bytes()))
            .await
            .map_err(|err| anyhow!("key cache write join error: {err}"))?
    }
}

fn write_secure_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open key cache file {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    #[cfg(unix)]
    {
        let current = fs::metadata(path)?.permissions();
        if current.mode() & 0o777 != 0o600 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).with_context(|| {
                format!("failed to set restrictive permissions on {}", path.display())
            })?;
        }
    }
    Ok(())
}

/// Keeps each alias in a secret named `<secret_name>-<alias>`.
pub struct SecretStoreKeyCacheBackend {
    store: Arc<dyn SecretStoreClient>,
    vault_uri: String,
    secret_name: String,
}

impl SecretStoreKeyCacheBackend {
    pub fn new(store: Arc<dyn SecretStoreClient>, vault_uri: String, secret_name: String) -> Self {
        Self {
            store,
            vault_uri,
            secret_name,
        }
    }

    pub fn secret_name_for(&self, server_alias: &str) -> String {
        format!("{}-{}", self.secret_name, sanitize_alias(server_alias))
    }
}

#[async_trait]
impl KeyCacheBackend for SecretStoreKeyCacheBackend {
    async fn read(&self, server_alias: &str) -> Result<Option<String>> {
        let name = self.secret_name_for(server_alias);
        debug!("[key-cache] reading account key from secret {name} in {}", self.vault_uri);
        Ok(self.store.get_secret(&name, &self.vault_uri).await?)
    }

    async fn write(&self, server_alias: &str, data: &str) -> Result<()> {
        let name = self.secret_name_for(server_alias);
        info!("[key-cache] saving account key to secret {name} in {}", self.vault_uri);
        Ok(self.store.set_secret(&name, data, &self.vault_uri).await?)
    }
}

/// Aliases become part of file and secret names; keep them to `[a-z0-9-]`.
fn sanitize_alias(server_alias: &str) -> String {
    let cleaned: String = server_alias
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Freshness-bounded account key cache over a pluggable backend.
pub struct AccountKeyCache {
    backend: Box<dyn KeyCacheBackend>,
    ttl: Duration,
}

impl AccountKeyCache {
    pub fn new(backend: Box<dyn KeyCacheBackend>, ttl_hours: u32) -> Self {
        Self {
            backend,
            ttl: Duration::hours(i64::from(ttl_hours)),
        }
    }

    pub fn from_settings(
        settings: &KeyCacheSettings,
        store: Arc<dyn SecretStoreClient>,
    ) -> Result<Self> {
        let backend: Box<dyn KeyCacheBackend> = match settings.backend {
            KeyCacheBackendKind::File => {
                let path = settings
                    .file_path
                    .clone()
                    .ok_or_else(|| anyhow!("acme_key_cache.file_path is not configured"))?;
                Box::new(FileKeyCacheBackend::new(path))
            }
            KeyCacheBackendKind::SecretStore => {
                let vault_uri = settings
                    .vault_uri
                    .clone()
                    .ok_or_else(|| anyhow!("acme_key_cache.vault_uri is not configured"))?;
                let secret_name = settings
                    .secret_name
                    .clone()
                    .ok_or_else(|| anyhow!("acme_key_cache.secret_name is not configured"))?;
                Box::new(SecretStoreKeyCacheBackend::new(store, vault_uri, secret_name))
            }
        };
        Ok(Self::new(backend, settings.cache_time_hours))
    }

    /// Persists `key` for `server_alias` unless the cached key is already identical.
    pub async fn save_account_key(&self, key: &str, server_alias: &str) -> Result<()> {
        self.save_account_key_at(key, server_alias, Utc::now()).await
    }

    pub(crate) async fn save_account_key_at(
        &self,
        key: &str,
        server_alias: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if key.trim().is_empty() {
            return Err(anyhow!("account key is empty"));
        }
        match self.backend.read(server_alias).await {
            Ok(Some(existing)) => match serde_json::from_str::<AccountKeyCacheEntry>(&existing) {
                Ok(entry) if entry.key == key => {
                    debug!("[key-cache] account key for {server_alias} unchanged, skipping write");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => warn!("[key-cache] replacing unreadable cache blob for {server_alias}: {err}"),
            },
            Ok(None) => {}
            Err(err) => warn!("[key-cache] failed to read existing cache for {server_alias}: {err:#}"),
        }

        let entry = AccountKeyCacheEntry {
            key: key.to_string(),
            timestamp: now,
            server: server_alias.to_string(),
        };
        let content = serde_json::to_string(&entry).context("failed to serialize key cache entry")?;
        self.backend.write(server_alias, &content).await
    }

    /// Cached key for `server_alias`, or `None` when absent, unreadable or stale.
    pub async fn get_account_key(&self, server_alias: &str) -> Option<String> {
        self.get_account_key_at(server_alias, Utc::now()).await
    }

    pub(crate) async fn get_account_key_at(
        &self,
        server_alias: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let content = match self.backend.read(server_alias).await {
            Ok(Some(content)) if !content.trim().is_empty() => content,
            Ok(_) => return None,
            Err(err) => {
                warn!("[key-cache] error during key cache loading for {server_alias}: {err:#}");
                return None;
            }
        };
        let entry = match serde_json::from_str::<AccountKeyCacheEntry>(&content) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("[key-cache] malformed key cache entry for {server_alias}: {err}");
                return None;
            }
        };
        if !entry.is_fresh_at(self.ttl, now) {
            info!(
                "[key-cache] cached account key for {server_alias} from {} is older than {}h",
                entry.timestamp,
                self.ttl.num_hours()
            );
            return None;
        }
        Some(entry.key)
    }
}
