use chrono::{DateTime, Utc};
use cr_dns::ChallengeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Freshly issued certificate material for one lineage. Lives only for the
/// processing pass that produced it; persistence goes through
/// [`crate::LineageStore`].
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub lineage: String,
    pub domains: Vec<String>,
    pub private_key_pem: String,
    pub chain_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-lineage metadata persisted next to the certificate. Renewal decisions
/// on later ticks are derived from this file, not from parsing the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageMetadata {
    pub name: String,
    pub domains: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LineageMetadata {
    /// Whether the certificate is within `threshold_days` of expiry.
    pub fn needs_renewal(&self, threshold_days: u32) -> bool {
        let threshold = chrono::Duration::days(threshold_days as i64);
        self.expires_at - Utc::now() < threshold
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }

    /// True when the configured domain set differs from the one this
    /// certificate was issued for (order-insensitive).
    pub fn domains_changed(&self, configured: &[String]) -> bool {
        let mut a: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        let mut b: Vec<&str> = configured.iter().map(String::as_str).collect();
        a.sort_unstable();
        b.sort_unstable();
        a != b
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME account not initialized")]
    NotInitialized,

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("order validation failed: {0}")]
    OrderFailed(String),

    #[error("timed out waiting for order to become {0}")]
    OrderTimeout(&'static str),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AcmeResult<T> = Result<T, AcmeError>;
