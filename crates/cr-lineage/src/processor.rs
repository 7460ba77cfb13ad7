use chrono::{DateTime, Utc};
use cr_acme::{AcmeClient, AcmeError, LineageStore};
use cr_common::config::{ConfigSnapshot, GlobalSettings, Lineage};
use cr_common::error::PermissionError;
use cr_common::permissions;
use cr_dns::{ChallengeAttempt, PropagationSettings, ProviderError, ProviderFactory, TxtResolver};
use cr_exec::{ExecError, HookSpec};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What the state evaluation decided for one lineage on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    UpToDate,
    NeedsIssueOrRenew(RenewReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewReason {
    /// No certificate material (or unreadable metadata) on disk
    NoMaterial,
    /// Within the renewal threshold of expiry
    Expiring { days_left: i64 },
    /// Configured domain set differs from the issued certificate
    DomainsChanged,
}

/// Result of a successful processing pass for one lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    UpToDate,
    Deployed { expires_at: DateTime<Utc> },
}

/// Which step of the lineage pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Deploy,
    Permissions,
    Hook,
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// A failure isolated to one lineage. Carries the failing step so the
/// per-lineage status report can say where processing stopped.
#[derive(Error, Debug)]
#[error("lineage {lineage} failed at {step:?}: {source}")]
pub struct ProcessError {
    pub lineage: String,
    pub step: Step,
    pub source: StepError,
}

impl ProcessError {
    fn at(lineage: &Lineage, step: Step, source: impl Into<StepError>) -> Self {
        Self {
            lineage: lineage.name.clone(),
            step,
            source: source.into(),
        }
    }
}

/// Drives one lineage through validate → deploy → permission-fix.
///
/// Holds no per-lineage state between ticks: every decision is re-derived
/// from on-disk metadata, so a restart changes nothing.
pub struct LineageProcessor {
    acme: Arc<dyn AcmeClient>,
    providers: Arc<dyn ProviderFactory>,
    resolver: Arc<dyn TxtResolver>,
    store: LineageStore,
}

impl LineageProcessor {
    pub fn new(
        acme: Arc<dyn AcmeClient>,
        providers: Arc<dyn ProviderFactory>,
        resolver: Arc<dyn TxtResolver>,
        store: LineageStore,
    ) -> Self {
        Self {
            acme,
            providers,
            resolver,
            store,
        }
    }

    pub fn store(&self) -> &LineageStore {
        &self.store
    }

    /// One-shot state decision, derived purely from on-disk metadata.
    pub fn evaluate(&self, lineage: &Lineage, settings: &GlobalSettings) -> Action {
        if !self.store.material_present(lineage) {
            return Action::NeedsIssueOrRenew(RenewReason::NoMaterial);
        }

        let metadata = match self.store.load_metadata(lineage) {
            Ok(Some(m)) => m,
            Ok(None) => return Action::NeedsIssueOrRenew(RenewReason::NoMaterial),
            Err(e) => {
                warn!(lineage = %lineage.name, error = %e, "Unreadable metadata, reissuing");
                return Action::NeedsIssueOrRenew(RenewReason::NoMaterial);
            }
        };

        if metadata.domains_changed(&lineage.domains) {
            return Action::NeedsIssueOrRenew(RenewReason::DomainsChanged);
        }

        if metadata.needs_renewal(settings.renewal_threshold_days) {
            return Action::NeedsIssueOrRenew(RenewReason::Expiring {
                days_left: metadata.days_until_expiry(),
            });
        }

        Action::UpToDate
    }

    /// Process one lineage for this tick. Errors are tagged with the failing
    /// step and never cross this boundary unwrapped.
    pub async fn process(
        &self,
        lineage: &Lineage,
        snapshot: &ConfigSnapshot,
    ) -> Result<Outcome, ProcessError> {
        let action = self.evaluate(lineage, &snapshot.settings);
        let reason = match action {
            Action::UpToDate => {
                debug!(lineage = %lineage.name, "Certificate up to date");
                return Ok(Outcome::UpToDate);
            }
            Action::NeedsIssueOrRenew(reason) => reason,
        };
        info!(lineage = %lineage.name, reason = ?reason, "Issuance needed");

        let bundle = self.validate(lineage, snapshot).await?;

        self.store
            .write_bundle(lineage, &bundle)
            .map_err(|e| ProcessError::at(lineage, Step::Deploy, e))?;

        permissions::reconcile(&self.store.lineage_dir(lineage), &lineage.permissions)
            .map_err(|e| ProcessError::at(lineage, Step::Permissions, e))?;

        if lineage.deploy_hook.is_some() {
            self.run_hook(lineage, &snapshot.settings).await?;
        }

        info!(
            lineage = %lineage.name,
            expires_at = %bundle.expires_at,
            "Lineage deployed"
        );
        Ok(Outcome::Deployed {
            expires_at: bundle.expires_at,
        })
    }

    async fn validate(
        &self,
        lineage: &Lineage,
        snapshot: &ConfigSnapshot,
    ) -> Result<cr_acme::CertificateBundle, ProcessError> {
        let provider_config = snapshot.provider(&lineage.provider).ok_or_else(|| {
            ProcessError::at(
                lineage,
                Step::Validate,
                ProviderError::Config(format!("unknown provider {}", lineage.provider)),
            )
        })?;
        let provider = self
            .providers
            .build(provider_config)
            .map_err(|e| ProcessError::at(lineage, Step::Validate, e))?;

        let settings = &snapshot.settings;
        let mut attempt = ChallengeAttempt::new(
            provider,
            self.resolver.clone(),
            PropagationSettings {
                poll_interval: Duration::from_secs(settings.propagation_poll_secs),
                max_attempts: settings.propagation_max_attempts,
                overall_timeout: Duration::from_secs(settings.propagation_timeout_secs),
                max_workers: settings.propagation_workers,
            },
        );

        self.acme
            .request_certificate(lineage, &mut attempt)
            .await
            .map_err(|e| ProcessError::at(lineage, Step::Validate, e))
    }

    /// Run the deploy hook with lineage metadata in its environment. Never
    /// interpolated into a shell string.
    async fn run_hook(&self, lineage: &Lineage, settings: &GlobalSettings) -> Result<(), ProcessError> {
        let command = lineage.deploy_hook.clone().unwrap_or_default();
        let spec = HookSpec {
            command,
            env: vec![
                ("CERTROUTE_LINEAGE".into(), lineage.name.clone()),
                ("CERTROUTE_DOMAINS".into(), lineage.domains.join(" ")),
                (
                    "CERTROUTE_KEY_PATH".into(),
                    self.store.key_path(lineage).display().to_string(),
                ),
                (
                    "CERTROUTE_CHAIN_PATH".into(),
                    self.store.chain_path(lineage).display().to_string(),
                ),
                (
                    "CERTROUTE_OUTPUT_DIR".into(),
                    self.store.lineage_dir(lineage).display().to_string(),
                ),
            ],
            timeout: Duration::from_secs(settings.hook_timeout_secs),
        };

        let output = cr_exec::run(&spec)
            .await
            .map_err(|e| ProcessError::at(lineage, Step::Hook, e))?;
        if !output.stdout.trim().is_empty() {
            debug!(lineage = %lineage.name, stdout = %output.stdout.trim(), "Deploy hook output");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use cr_acme::CertificateBundle;
    use cr_common::config::{KeyProfile, PermissionPolicy, ProviderConfig};
    use cr_dns::resolver::ResolveError;
    use cr_dns::DnsProvider;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockAcme {
        calls: AtomicU32,
        fail: bool,
        lifetime_days: i64,
    }

    impl MockAcme {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
                lifetime_days: 90,
            }
        }
    }

    #[async_trait]
    impl AcmeClient for MockAcme {
        async fn request_certificate(
            &self,
            lineage: &Lineage,
            _attempt: &mut ChallengeAttempt,
        ) -> Result<CertificateBundle, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AcmeError::Protocol("simulated failure".into()));
            }
            let now = Utc::now();
            Ok(CertificateBundle {
                lineage: lineage.name.clone(),
                domains: lineage.domains.clone(),
                private_key_pem: "KEY".into(),
                chain_pem: "CHAIN".into(),
                issued_at: now,
                expires_at: now + ChronoDuration::days(self.lifetime_days),
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

    struct CountingFactory {
        builds: AtomicU32,
    }

    impl ProviderFactory for CountingFactory {
        fn build(&self, _: &ProviderConfig) -> Result<Arc<dyn DnsProvider>, ProviderError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
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

    fn lineage(name: &str, hook: Option<String>) -> Lineage {
        Lineage {
            name: name.to_string(),
            domains: vec!["example.com".to_string()],
            provider: "cf".to_string(),
            key_profile: KeyProfile::EcdsaP256,
            deploy_hook: hook,
            output_dir: None,
            permissions: PermissionPolicy::default(),
        }
    }

    fn snapshot(lineages: Vec<Lineage>) -> ConfigSnapshot {
        ConfigSnapshot {
            settings: GlobalSettings::default(),
            providers: vec![ProviderConfig {
                name: "cf".into(),
                kind: "cloudflare".into(),
                api_token: "t".into(),
                zone_id: "z".into(),
            }],
            lineages,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        acme: Arc<MockAcme>,
        factory: Arc<CountingFactory>,
        processor: LineageProcessor,
    }

    fn fixture(fail: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LineageStore::new(dir.path());
        store.init().unwrap();
        let acme = Arc::new(MockAcme::new(fail));
        let factory = Arc::new(CountingFactory {
            builds: AtomicU32::new(0),
        });
        let processor = LineageProcessor::new(
            acme.clone(),
            factory.clone(),
            Arc::new(EmptyResolver),
            store,
        );
        Fixture {
            _dir: dir,
            acme,
            factory,
            processor,
        }
    }

    #[tokio::test]
    async fn test_absent_material_issues_and_deploys() {
        let f = fixture(false);
        let web = lineage("web", None);
        let snap = snapshot(vec![web.clone()]);

        assert_eq!(
            f.processor.evaluate(&web, &snap.settings),
            Action::NeedsIssueOrRenew(RenewReason::NoMaterial)
        );

        let outcome = f.processor.process(&web, &snap).await.unwrap();
        assert!(matches!(outcome, Outcome::Deployed { .. }));
        assert_eq!(f.acme.calls.load(Ordering::SeqCst), 1);

        let key_path = f.processor.store().key_path(&web);
        assert!(key_path.exists());
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(f.processor.store().lineage_dir(&web))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777;
        assert_eq!(dir_mode, 0o700);
    }

    #[tokio::test]
    async fn test_fresh_certificate_is_up_to_date() {
        let f = fixture(false);
        let web = lineage("web", None);
        let snap = snapshot(vec![web.clone()]);

        f.processor.process(&web, &snap).await.unwrap();
        let outcome = f.processor.process(&web, &snap).await.unwrap();

        assert_eq!(outcome, Outcome::UpToDate);
        // No second issuance and no provider plugin touched
        assert_eq!(f.acme.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_domain_change_triggers_renewal() {
        let f = fixture(false);
        let mut web = lineage("web", None);
        let snap = snapshot(vec![web.clone()]);
        f.processor.process(&web, &snap).await.unwrap();

        web.domains.push("www.example.com".to_string());
        assert_eq!(
            f.processor.evaluate(&web, &snap.settings),
            Action::NeedsIssueOrRenew(RenewReason::DomainsChanged)
        );
    }

    #[tokio::test]
    async fn test_expiring_certificate_triggers_renewal() {
        let f = fixture(false);
        let web = lineage("web", None);
        let snap = snapshot(vec![web.clone()]);
        f.processor.process(&web, &snap).await.unwrap();

        let mut settings = snap.settings.clone();
        settings.renewal_threshold_days = 120; // expiry (90d out) is inside the window
        match f.processor.evaluate(&web, &settings) {
            Action::NeedsIssueOrRenew(RenewReason::Expiring { days_left }) => {
                assert!(days_left <= 90);
            }
            other => panic!("expected Expiring, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let f = fixture(true);
        let web = lineage("web", None);
        let snap = snapshot(vec![web.clone()]);

        let err = f.processor.process(&web, &snap).await.unwrap_err();
        assert_eq!(err.step, Step::Validate);
        assert_eq!(err.lineage, "web");
        assert!(!f.processor.store().key_path(&web).exists());
    }

    #[tokio::test]
    async fn test_hook_runs_after_deploy() {
        let f = fixture(false);
        let marker = f._dir.path().join("hook-ran");
        let web = lineage("web", Some(format!("touch {}", marker.display())));
        let snap = snapshot(vec![web.clone()]);

        f.processor.process(&web, &snap).await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_hook_failure_keeps_material() {
        let f = fixture(false);
        let web = lineage("web", Some("false".to_string()));
        let snap = snapshot(vec![web.clone()]);

        let err = f.processor.process(&web, &snap).await.unwrap_err();
        assert_eq!(err.step, Step::Hook);
        // Certificate material written before the hook stays on disk
        assert!(f.processor.store().key_path(&web).exists());
    }
}
