//! Azure Key Vault REST adapter for the secret store contract.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::credentials::AzureCredential;
use super::store::{SecretStoreClient, SecretStoreError};
use crate::core::types::CertificateRecord;
use crate::http::{HttpClient, status_error};

const API_VERSION: &str = "7.4";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

pub struct KeyVaultClient {
    credential: Arc<AzureCredential>,
    http: Client,
}

#[derive(Deserialize)]
struct CertificateBundle {
    id: Option<String>,
    cer: Option<String>,
    #[serde(default)]
    attributes: Option<Attributes>,
    #[serde(default)]
    policy: Option<Policy>,
}

#[derive(Deserialize, Default)]
struct Attributes {
    enabled: Option<bool>,
    created: Option<i64>,
    updated: Option<i64>,
}

#[derive(Deserialize)]
struct Policy {
    key_props: Option<KeyProperties>,
    x509_props: Option<X509Properties>,
}

#[derive(Deserialize)]
struct KeyProperties {
    key_size: Option<u32>,
}

#[derive(Deserialize)]
struct X509Properties {
    key_usage: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ImportRequest<'a> {
    value: String,
    pwd: &'a str,
    attributes: ImportAttributes,
}

#[derive(Serialize)]
struct ImportAttributes {
    enabled: bool,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[derive(Serialize)]
struct SetSecretRequest<'a> {
    value: &'a str,
}

impl KeyVaultClient {
    pub fn new(credential: Arc<AzureCredential>) -> Self {
        Self {
            credential,
            http: HttpClient::shared(),
        }
    }

    fn url(vault_uri: &str, collection: &str, name: &str, suffix: &str) -> String {
        format!(
            "{}/{collection}/{name}{suffix}?api-version={API_VERSION}",
            vault_uri.trim_end_matches('/')
        )
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<Response, SecretStoreError> {
        let token = self
            .credential
            .token(VAULT_SCOPE)
            .await
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;
        builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SecretStoreError::Unavailable(format!("Key Vault request failed: {err}")))
    }

    async fn fail(response: Response) -> SecretStoreError {
        let status = response.status();
        let body = response.text().await.ok();
        let err = status_error("Key Vault", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            SecretStoreError::Unavailable(err.to_string())
        } else {
            SecretStoreError::Store(err.to_string())
        }
    }
}

fn from_unix(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|value| Utc.timestamp_opt(value, 0).single())
}

fn bundle_to_record(name: &str, bundle: CertificateBundle) -> Result<CertificateRecord, SecretStoreError> {
    let cer = bundle.cer.ok_or_else(|| {
        SecretStoreError::Store(format!("certificate {name} has no public certificate data"))
    })?;
    let der = STANDARD
        .decode(cer.as_bytes())
        .map_err(|err| SecretStoreError::Store(format!("invalid certificate encoding: {err}")))?;
    let mut record = CertificateRecord::from_der(name, &der)
        .map_err(|err| SecretStoreError::Store(err.to_string()))?;

    let attributes = bundle.attributes.unwrap_or_default();
    record.created = from_unix(attributes.created);
    record.updated = from_unix(attributes.updated);
    record.enabled = attributes.enabled;
    record.version = bundle
        .id
        .as_deref()
        .and_then(|id| id.rsplit('/').next())
        .filter(|version| !version.is_empty() && *version != name)
        .map(str::to_string);
    record.id = bundle.id;

    if let Some(policy) = bundle.policy {
        if let Some(key_size) = policy.key_props.and_then(|props| props.key_size) {
            record.key_size = Some(key_size);
        }
        if let Some(usage) = policy.x509_props.and_then(|props| props.key_usage) {
            if !usage.is_empty() {
                record.key_usage = usage;
            }
        }
    }
    Ok(record)
}

#[async_trait]
impl SecretStoreClient for KeyVaultClient {
    async fn get_certificate(
        &self,
        name: &str,
        vault_uri: &str,
    ) -> Result<Option<CertificateRecord>, SecretStoreError> {
        let url = Self::url(vault_uri, "certificates", name, "");
        let response = self.authorized(self.http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("[key-vault] certificate {name} not found in {vault_uri}");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let bundle: CertificateBundle = response
            .json()
            .await
            .map_err(|err| SecretStoreError::Store(format!("invalid certificate response: {err}")))?;
        let record = bundle_to_record(name, bundle)?;
        info!(
            "[key-vault] found certificate {} expires={} thumbprint={}",
            name, record.expires, record.thumbprint
        );
        Ok(Some(record))
    }

    async fn import_certificate(
        &self,
        name: &str,
        vault_uri: &str,
        pfx: &[u8],
        password: &str,
    ) -> Result<(), SecretStoreError> {
        info!("[key-vault] uploading certificate {name} to {vault_uri}");
        let url = Self::url(vault_uri, "certificates", name, "/import");
        let body = ImportRequest {
            value: STANDARD.encode(pfx),
            pwd: password,
            attributes: ImportAttributes { enabled: true },
        };
        let response = self.authorized(self.http.post(&url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(())
    }

    async fn get_secret(
        &self,
        name: &str,
        vault_uri: &str,
    ) -> Result<Option<String>, SecretStoreError> {
        let url = Self::url(vault_uri, "secrets", name, "");
        let response = self.authorized(self.http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("[key-vault] secret {name} not found in {vault_uri}");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let bundle: SecretBundle = response
            .json()
            .await
            .map_err(|err| SecretStoreError::Store(format!("invalid secret response: {err}")))?;
        Ok(bundle.value)
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        vault_uri: &str,
    ) -> Result<(), SecretStoreError> {
        info!("[key-vault] saving secret {name} to {vault_uri}");
        let url = Self::url(vault_uri, "secrets", name, "");
        let response = self
            .authorized(self.http.put(&url).json(&SetSecretRequest { value }))
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(())
    }
}
