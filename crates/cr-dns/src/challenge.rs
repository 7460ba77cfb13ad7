//! Challenge coordination for one validation attempt.
//!
//! An attempt creates the TXT records for every domain in a lineage
//! (all-or-nothing), verifies propagation with bounded concurrency, and
//! guarantees every record it created receives exactly one best-effort
//! delete before the attempt is over.

use crate::provider::{DnsProvider, ProviderError};
use crate::resolver::TxtResolver;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("TXT record for {domain} not visible after {attempts} polls")]
    PropagationTimeout { domain: String, attempts: u32 },
}

/// One ephemeral DNS-01 challenge record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub domain: String,
    pub fqdn: String,
    pub value: String,
}

impl ChallengeRecord {
    /// Build the record for a domain. Wildcards are validated at the base
    /// name, so `*.example.com` challenges live at
    /// `_acme-challenge.example.com`.
    pub fn for_domain(domain: &str, value: &str) -> Self {
        let base = domain.trim_start_matches("*.");
        Self {
            domain: domain.to_string(),
            fqdn: format!("_acme-challenge.{base}"),
            value: value.to_string(),
        }
    }
}

/// Polling limits for propagation verification.
#[derive(Debug, Clone)]
pub struct PropagationSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub overall_timeout: Duration,
    pub max_workers: usize,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 30,
            overall_timeout: Duration::from_secs(300),
            max_workers: 8,
        }
    }
}

/// State of one validation attempt. Records are tracked as they are created;
/// `cleanup` drains the tracked set, so however the attempt ends, each
/// created record is deleted exactly once.
pub struct ChallengeAttempt {
    provider: Arc<dyn DnsProvider>,
    resolver: Arc<dyn TxtResolver>,
    settings: PropagationSettings,
    created: Vec<ChallengeRecord>,
}

impl ChallengeAttempt {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        resolver: Arc<dyn TxtResolver>,
        settings: PropagationSettings,
    ) -> Self {
        Self {
            provider,
            resolver,
            settings,
            created: Vec::new(),
        }
    }

    /// Records created so far in this attempt.
    pub fn created(&self) -> &[ChallengeRecord] {
        &self.created
    }

    /// Create all records, then verify propagation.
    ///
    /// A creation failure for any domain aborts the whole attempt: records
    /// created before the failure are rolled back immediately. A verification
    /// failure leaves records in place for the caller's unconditional
    /// `cleanup` (the ACME order may still reference them).
    pub async fn present(&mut self, records: &[ChallengeRecord]) -> Result<(), ChallengeError> {
        for record in records {
            match self
                .provider
                .create_txt_record(&record.fqdn, &record.value)
                .await
            {
                Ok(()) => self.created.push(record.clone()),
                Err(e) => {
                    warn!(
                        fqdn = %record.fqdn,
                        error = %e,
                        "TXT record creation failed, aborting attempt"
                    );
                    self.cleanup().await;
                    return Err(e.into());
                }
            }
        }
        self.verify().await
    }

    /// Poll until every created record is observed, bounded by a worker pool
    /// so wall-clock time tracks the slowest domain, not the sum.
    async fn verify(&self) -> Result<(), ChallengeError> {
        if self.created.is_empty() {
            return Ok(());
        }
        let workers = self.settings.max_workers.min(self.created.len()).max(1);
        let pool = Semaphore::new(workers);
        let deadline = Instant::now() + self.settings.overall_timeout;

        futures_util::future::try_join_all(
            self.created
                .iter()
                .map(|record| self.verify_one(record, &pool, deadline)),
        )
        .await?;

        info!(records = self.created.len(), "All challenge records propagated");
        Ok(())
    }

    async fn verify_one(
        &self,
        record: &ChallengeRecord,
        pool: &Semaphore,
        deadline: Instant,
    ) -> Result<(), ChallengeError> {
        let _permit = pool.acquire().await.expect("propagation pool closed");

        for attempt in 1..=self.settings.max_attempts {
            match self.resolver.lookup_txt(&record.fqdn).await {
                Ok(values) if values.iter().any(|v| v == &record.value) => {
                    debug!(fqdn = %record.fqdn, attempt, "Challenge record propagated");
                    return Ok(());
                }
                Ok(_) => {
                    debug!(fqdn = %record.fqdn, attempt, "Challenge record not visible yet");
                }
                Err(e) => {
                    // Transient resolver trouble counts as "not propagated yet"
                    warn!(fqdn = %record.fqdn, attempt, error = %e, "TXT lookup failed");
                }
            }

            if attempt == self.settings.max_attempts || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(
                (Instant::now() + self.settings.poll_interval).min(deadline),
            )
            .await;
        }

        Err(ChallengeError::PropagationTimeout {
            domain: record.domain.clone(),
            attempts: self.settings.max_attempts,
        })
    }

    /// Best-effort deletion of every record created in this attempt.
    ///
    /// Deletion errors are logged, never propagated: cleanup must not mask
    /// the validation result, and a stale leftover record is tolerated.
    pub async fn cleanup(&mut self) {
        for record in self.created.drain(..) {
            if let Err(e) = self
                .provider
                .delete_txt_record(&record.fqdn, &record.value)
                .await
            {
                warn!(fqdn = %record.fqdn, error = %e, "Failed to clean up challenge record");
            }
        }
    }
}
