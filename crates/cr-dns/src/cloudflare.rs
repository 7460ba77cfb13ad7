//! Cloudflare DNS plugin for ACME DNS-01 challenge records.

use crate::provider::{DnsProvider, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CF_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    result: Option<T>,
    errors: Option<Vec<CloudflareApiError>>,
}

#[derive(Debug, Deserialize)]
struct CloudflareApiError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListedRecord {
    id: String,
    name: String,
    content: String,
}

fn api_error<T>(response: CloudflareResponse<T>, status: reqwest::StatusCode) -> ProviderError {
    let message = response
        .errors
        .map(|errs| {
            errs.iter()
                .map(|e| format!("[{}] {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| format!("HTTP {status}"));
    ProviderError::Api(message)
}

/// Cloudflare-backed TXT record management. Record ids returned on create are
/// remembered so deletes go by id; if the process restarted in between, the
/// id is recovered by listing records with a matching name and content.
pub struct CloudflareProvider {
    client: reqwest::Client,
    api_token: String,
    zone_id: String,
    record_ids: Mutex<HashMap<(String, String), String>>,
}

impl CloudflareProvider {
    pub fn new(api_token: String, zone_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_token,
            zone_id,
            record_ids: Mutex::new(HashMap::new()),
        }
    }

    async fn find_record_id(&self, fqdn: &str, value: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/zones/{}/dns_records?type=TXT&name={}",
            CF_API_BASE, self.zone_id, fqdn
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let status = resp.status();
        let body: CloudflareResponse<Vec<ListedRecord>> = resp.json().await?;
        if !body.success {
            return Err(api_error(body, status));
        }
        body.result
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.name == fqdn && r.content.trim_matches('"') == value)
            .map(|r| r.id)
            .ok_or_else(|| ProviderError::UnknownRecord(fqdn.to_string()))
    }

    async fn delete_by_id(&self, record_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            CF_API_BASE, self.zone_id, record_id
        );
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            warn!(record_id, status = %resp.status(), "Failed to delete challenge record");
            return Err(ProviderError::Api(format!(
                "delete failed with status {}",
                resp.status()
            )));
        }
        info!(record_id, "Deleted ACME challenge TXT record");
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn create_txt_record(&self, fqdn: &str, value: &str) -> Result<(), ProviderError> {
        let url = format!("{}/zones/{}/dns_records", CF_API_BASE, self.zone_id);

        debug!(fqdn, "Creating ACME challenge TXT record in Cloudflare");

        let request = CreateRecordRequest {
            record_type: "TXT",
            name: fqdn,
            content: value,
            ttl: 60,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        let body: CloudflareResponse<DnsRecord> = resp.json().await?;
        if !body.success {
            return Err(api_error(body, status));
        }

        let record_id = body
            .result
            .ok_or_else(|| ProviderError::Api("no result in create response".into()))?
            .id;

        info!(fqdn, record_id = %record_id, "Created ACME challenge TXT record");
        self.record_ids
            .lock()
            .await
            .insert((fqdn.to_string(), value.to_string()), record_id);
        Ok(())
    }

    async fn delete_txt_record(&self, fqdn: &str, value: &str) -> Result<(), ProviderError> {
        let cached = self
            .record_ids
            .lock()
            .await
            .remove(&(fqdn.to_string(), value.to_string()));

        let record_id = match cached {
            Some(id) => id,
            None => self.find_record_id(fqdn, value).await?,
        };
        self.delete_by_id(&record_id).await
    }
}
