use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::http::{HttpClient, status_error};

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const REFRESH_MARGIN: Duration = Duration::from_secs(120);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Azure AD client-credentials flow with a per-scope token cache.
pub struct AzureCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority: String,
    http: Client,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl AzureCredential {
    pub fn new(tenant_id: String, client_id: String, client_secret: String) -> Self {
        Self {
            tenant_id,
            client_id,
            client_secret,
            authority: DEFAULT_AUTHORITY.to_string(),
            http: HttpClient::shared(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Reads `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("environment variable {key} is required"))
        };
        Ok(Self::new(
            read("AZURE_TENANT_ID")?,
            read("AZURE_CLIENT_ID")?,
            read("AZURE_CLIENT_SECRET")?,
        ))
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    /// Returns a bearer token for `scope`, reusing a cached one until shortly before expiry.
    pub async fn token(&self, scope: &str) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope) {
            if Instant::now() + REFRESH_MARGIN < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        debug!("[azure-auth] requesting token for scope {scope}");
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await
            .context("failed to reach the Azure AD token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok();
            return Err(status_error("Azure AD", status, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("failed to parse Azure AD token response")?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        cache.insert(
            scope.to_string(),
            CachedToken {
                value: token.access_token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(token.access_token)
    }
}
