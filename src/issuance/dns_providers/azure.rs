use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::core::types::DnsRecordSet;
use crate::http::{HttpClient, status_error};
use crate::issuance::dns::{DnsError, DnsZoneClient};
use crate::secrets::credentials::AzureCredential;
use crate::settings::DnsZoneSettings;

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const API_VERSION: &str = "2018-05-01";
const ORDER_METADATA_KEY: &str = "order";

/// Azure DNS record sets through the Resource Manager REST API.
pub struct AzureDnsClient {
    credential: Arc<AzureCredential>,
    endpoint: String,
    http: Client,
}

#[derive(Serialize, Deserialize)]
struct RecordSetBody {
    properties: RecordSetProperties,
}

#[derive(Serialize, Deserialize)]
struct RecordSetProperties {
    #[serde(rename = "TTL", default)]
    ttl: u32,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    #[serde(rename = "TXTRecords", default)]
    txt_records: Vec<TxtRecord>,
}

#[derive(Serialize, Deserialize)]
struct TxtRecord {
    #[serde(default)]
    value: Vec<String>,
}

impl AzureDnsClient {
    pub fn new(credential: Arc<AzureCredential>) -> Self {
        Self {
            credential,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            http: HttpClient::shared(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn record_url(&self, zone: &DnsZoneSettings, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnsZones/{}/TXT/{}?api-version={API_VERSION}",
            self.endpoint.trim_end_matches('/'),
            zone.subscription_id,
            zone.resource_group,
            zone.name,
            name
        )
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<Response, DnsError> {
        let token = self
            .credential
            .token(MANAGEMENT_SCOPE)
            .await
            .map_err(|err| DnsError::Api(err.to_string()))?;
        builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| DnsError::Api(format!("Azure DNS request failed: {err}")))
    }

    async fn fail(response: Response) -> DnsError {
        let status = response.status();
        let body = response.text().await.ok();
        DnsError::Api(status_error("Azure DNS", status, body).to_string())
    }
}

#[async_trait]
impl DnsZoneClient for AzureDnsClient {
    async fn get_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        name: &str,
    ) -> Result<Option<DnsRecordSet>, DnsError> {
        let response = self
            .authorized(self.http.get(self.record_url(zone, name)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let body: RecordSetBody = response
            .json()
            .await
            .map_err(|err| DnsError::Api(format!("invalid record set response: {err}")))?;
        let order_id = body
            .properties
            .metadata
            .and_then(|mut metadata| metadata.remove(ORDER_METADATA_KEY));
        Ok(Some(DnsRecordSet {
            zone: zone.name.clone(),
            name: name.to_string(),
            ttl: body.properties.ttl,
            values: body
                .properties
                .txt_records
                .into_iter()
                .flat_map(|record| record.value)
                .collect(),
            order_id,
        }))
    }

    async fn upsert_txt_record_set(
        &self,
        zone: &DnsZoneSettings,
        record: &DnsRecordSet,
    ) -> Result<(), DnsError> {
        let metadata = record
            .order_id
            .as_ref()
            .map(|order| HashMap::from([(ORDER_METADATA_KEY.to_string(), order.clone())]));
        let body = RecordSetBody {
            properties: RecordSetProperties {
                ttl: record.ttl,
                metadata,
                txt_records: record
                    .values
                    .iter()
                    .map(|value| TxtRecord {
                        value: vec![value.clone()],
                    })
                    .collect(),
            },
        };
        debug!(
            "[azure-dns] PUT {}.{} ({} value(s))",
            record.name,
            zone.name,
            record.values.len()
        );
        let response = self
            .authorized(self.http.put(self.record_url(zone, &record.name)).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        Ok(())
    }
}
