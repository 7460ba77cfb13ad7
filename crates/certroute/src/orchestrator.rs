//! Fan-out of lineage processing with bounded concurrency.
//!
//! Sweep triggers arrive from the scheduler, the config watcher, or a SIGHUP.
//! Each sweep walks the current snapshot, skips lineages that already have an
//! attempt in flight, and spawns the rest onto a bounded pool. One lineage's
//! failure never touches another.

use crate::watcher::SharedSnapshot;
use cr_lineage::{LineageProcessor, Outcome, ProcessError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a reconciliation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Startup,
    ConfigChanged,
    Scheduled,
    Manual,
}

type LineageHandle = JoinHandle<(String, Result<Outcome, ProcessError>)>;

/// Releases a lineage's in-flight reservation on drop, so a task that
/// panics mid-processing cannot leave its lineage stuck and never retried.
struct InflightGuard {
    inflight: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.name);
    }
}

pub struct Orchestrator {
    processor: Arc<LineageProcessor>,
    snapshot: SharedSnapshot,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(processor: Arc<LineageProcessor>, snapshot: SharedSnapshot) -> Self {
        Self {
            processor,
            snapshot,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume triggers until shutdown. Aggregation of each sweep happens on
    /// its own task so a slow lineage never delays the next trigger.
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<Sweep>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Orchestrator stopping");
                        return;
                    }
                }
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else { return };
                    let handles = self.sweep(trigger).await;
                    if !handles.is_empty() {
                        tokio::spawn(aggregate(trigger, handles));
                    }
                }
            }
        }
    }

    /// Launch processing for every lineage in the current snapshot that is
    /// not already in flight. Returns the per-lineage task handles.
    pub async fn sweep(&self, reason: Sweep) -> Vec<LineageHandle> {
        let snap = self.snapshot.read().await.clone();
        if snap.lineages.is_empty() {
            debug!(reason = ?reason, "No lineages configured, skipping sweep");
            return Vec::new();
        }

        info!(
            reason = ?reason,
            lineages = snap.lineages.len(),
            "Starting reconciliation pass"
        );

        let workers = Arc::new(Semaphore::new(snap.settings.lineage_workers.max(1)));
        let mut handles = Vec::new();

        for lineage in snap.lineages.iter().cloned() {
            // One in-flight attempt per lineage: coalesce, never queue
            if !self.inflight.lock().unwrap().insert(lineage.name.clone()) {
                debug!(lineage = %lineage.name, "Attempt already in flight, coalescing");
                continue;
            }

            let processor = self.processor.clone();
            let snap = snap.clone();
            let workers = workers.clone();
            let guard = InflightGuard {
                inflight: self.inflight.clone(),
                name: lineage.name.clone(),
            };

            handles.push(tokio::spawn(async move {
                let _guard = guard;
                let _permit = workers.acquire_owned().await.expect("worker pool closed");
                let result = processor.process(&lineage, &snap).await;
                (lineage.name, result)
            }));
        }

        handles
    }

    /// Wait up to `grace` for in-flight lineage attempts to finish.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.inflight.lock().unwrap().len();
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Shutdown grace period elapsed with lineages in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Join a sweep's lineage tasks and log the pass summary.
async fn aggregate(reason: Sweep, handles: Vec<LineageHandle>) {
    let mut deployed = 0usize;
    let mut up_to_date = 0usize;
    let mut failed = 0usize;

    for handle in handles {
        match handle.await {
            Ok((name, Ok(Outcome::Deployed { expires_at }))) => {
                deployed += 1;
                info!(lineage = %name, expires_at = %expires_at, "Deployed");
            }
            Ok((_, Ok(Outcome::UpToDate))) => up_to_date += 1,
            Ok((name, Err(e))) => {
                failed += 1;
                error!(
                    lineage = %name,
                    step = ?e.step,
                    error = %e.source,
                    "Lineage failed, will retry next tick"
                );
            }
            Err(join_error) => {
                failed += 1;
                error!(error = %join_error, "Lineage task panicked");
            }
        }
    }

    info!(
        reason = ?reason,
        deployed,
        up_to_date,
        failed,
        "Reconciliation pass complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use cr_acme::{AcmeClient, AcmeError, CertificateBundle, LineageStore};
    use cr_common::config::{
        ConfigSnapshot, GlobalSettings, KeyProfile, Lineage, PermissionPolicy, ProviderConfig,
    };
    use cr_dns::resolver::ResolveError;
    use cr_dns::{
        ChallengeAttempt, DnsProvider, ProviderError, ProviderFactory, TxtResolver,
    };
    use tokio::sync::RwLock;

    struct FlakyAcme {
        fail_lineage: String,
    }

    #[async_trait]
    impl AcmeClient for FlakyAcme {
        async fn request_certificate(
            &self,
            lineage: &Lineage,
            _attempt: &mut ChallengeAttempt,
        ) -> Result<CertificateBundle, AcmeError> {
            if lineage.name == self.fail_lineage {
                return Err(AcmeError::Protocol("unreachable provider".into()));
            }
            let now = Utc::now();
            Ok(CertificateBundle {
                lineage: lineage.name.clone(),
                domains: lineage.domains.clone(),
                private_key_pem: "KEY".into(),
                chain_pem: "CHAIN".into(),
                issued_at: now,
                expires_at: now + chrono::Duration::days(90),
            })
        }
    }

    struct NoopProvider;

    #[async_trait]
    impl DnsProvider for NoopProvider {
        async fn create_txt_record(&self, _: &str, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn delete_txt_record(&self, _: &str, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct NoopFactory;

    impl ProviderFactory for NoopFactory {
        fn build(&self, _: &ProviderConfig) -> Result<Arc<dyn DnsProvider>, ProviderError> {
            Ok(Arc::new(NoopProvider))
        }
    }

    struct EmptyResolver;

    #[async_trait]
    impl TxtResolver for EmptyResolver {
        async fn lookup_txt(&self, _: &str) -> Result<Vec<String>, ResolveError> {
            Ok(Vec::new())
        }
    }

    fn lineage(name: &str) -> Lineage {
        Lineage {
            name: name.to_string(),
            domains: vec![format!("{name}.example.com")],
            provider: "cf".to_string(),
            key_profile: KeyProfile::EcdsaP256,
            deploy_hook: None,
            output_dir: None,
            permissions: PermissionPolicy::default(),
        }
    }

    fn setup(fail_lineage: &str) -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = LineageStore::new(dir.path());
        store.init().unwrap();
        let processor = Arc::new(LineageProcessor::new(
            Arc::new(FlakyAcme {
                fail_lineage: fail_lineage.to_string(),
            }),
            Arc::new(NoopFactory),
            Arc::new(EmptyResolver),
            store,
        ));
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Arc::new(ConfigSnapshot {
            settings: GlobalSettings::default(),
            providers: vec![ProviderConfig {
                name: "cf".into(),
                kind: "cloudflare".into(),
                api_token: "t".into(),
                zone_id: "z".into(),
            }],
            lineages: vec![lineage("good"), lineage("bad")],
        })));
        (dir, Orchestrator::new(processor, snapshot))
    }

    #[tokio::test]
    async fn test_failing_lineage_does_not_block_healthy_one() {
        let (_dir, orch) = setup("bad");

        for _ in 0..2 {
            let handles = orch.sweep(Sweep::Manual).await;
            let mut results = Vec::new();
            for h in handles {
                results.push(h.await.unwrap());
            }

            let good = results.iter().find(|(n, _)| n == "good").unwrap();
            let bad = results.iter().find(|(n, _)| n == "bad").unwrap();
            assert!(good.1.is_ok());
            assert!(bad.1.is_err());
        }

        // After the first sweep the healthy lineage is simply up to date
        let handles = orch.sweep(Sweep::Scheduled).await;
        for h in handles {
            let (name, result) = h.await.unwrap();
            if name == "good" {
                assert_eq!(result.unwrap(), Outcome::UpToDate);
            }
        }
    }

    struct PanickyAcme;

    #[async_trait]
    impl AcmeClient for PanickyAcme {
        async fn request_certificate(
            &self,
            lineage: &Lineage,
            _attempt: &mut ChallengeAttempt,
        ) -> Result<CertificateBundle, AcmeError> {
            panic!("simulated crash while processing {}", lineage.name);
        }
    }

    #[tokio::test]
    async fn test_panicked_lineage_is_retried_on_next_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineageStore::new(dir.path());
        store.init().unwrap();
        let processor = Arc::new(LineageProcessor::new(
            Arc::new(PanickyAcme),
            Arc::new(NoopFactory),
            Arc::new(EmptyResolver),
            store,
        ));
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Arc::new(ConfigSnapshot {
            settings: GlobalSettings::default(),
            providers: vec![ProviderConfig {
                name: "cf".into(),
                kind: "cloudflare".into(),
                api_token: "t".into(),
                zone_id: "z".into(),
            }],
            lineages: vec![lineage("web")],
        })));
        let orch = Orchestrator::new(processor, snapshot);

        let handles = orch.sweep(Sweep::Manual).await;
        assert_eq!(handles.len(), 1);
        for h in handles {
            assert!(h.await.is_err());
        }

        // The in-flight reservation is released even though the task
        // panicked, so the next sweep picks the lineage up again
        assert!(orch.inflight.lock().unwrap().is_empty());
        let handles = orch.sweep(Sweep::Scheduled).await;
        assert_eq!(handles.len(), 1);
        for h in handles {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn test_inflight_lineage_is_coalesced() {
        let (_dir, orch) = setup("none");

        orch.inflight.lock().unwrap().insert("good".to_string());
        orch.inflight.lock().unwrap().insert("bad".to_string());

        let handles = orch.sweep(Sweep::Manual).await;
        assert!(handles.is_empty());

        orch.inflight.lock().unwrap().clear();
        let handles = orch.sweep(Sweep::Manual).await;
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drain_returns_when_idle() {
        let (_dir, orch) = setup("none");
        let started = std::time::Instant::now();
        orch.drain(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
