use crate::cloudflare::CloudflareProvider;
use async_trait::async_trait;
use cr_common::config::ProviderConfig;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider API error: {0}")]
    Api(String),

    #[error("no record tracked for {0}")]
    UnknownRecord(String),

    #[error("unsupported provider kind: {0}")]
    UnsupportedKind(String),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

/// A DNS provider plugin: creates and deletes the TXT records used for
/// DNS-01 validation. Implementations must be safe to call concurrently.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_txt_record(&self, fqdn: &str, value: &str) -> Result<(), ProviderError>;

    async fn delete_txt_record(&self, fqdn: &str, value: &str) -> Result<(), ProviderError>;
}

/// Builds provider instances from configuration. Snapshots can add or change
/// provider accounts at runtime, so providers are built per attempt rather
/// than held for the process lifetime.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn DnsProvider>, ProviderError>;
}

/// Factory for the built-in provider kinds.
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn DnsProvider>, ProviderError> {
        match config.kind.as_str() {
            "cloudflare" => {
                if config.api_token.is_empty() || config.zone_id.is_empty() {
                    return Err(ProviderError::Config(format!(
                        "provider {} is missing api_token or zone_id",
                        config.name
                    )));
                }
                Ok(Arc::new(CloudflareProvider::new(
                    config.api_token.clone(),
                    config.zone_id.clone(),
                )))
            }
            other => Err(ProviderError::UnsupportedKind(other.to_string())),
        }
    }
}
