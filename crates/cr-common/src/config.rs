use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Process-level configuration loaded from environment variables.
///
/// The declarative lineage configuration lives in the file at `config_path`;
/// everything here is deployment plumbing that does not change at runtime.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Path of the declarative configuration file (lineages, providers, timing)
    pub config_path: PathBuf,
    /// State directory (ACME account, issued certificates, metadata)
    pub state_dir: PathBuf,
    /// ACME directory URL (production or staging)
    pub acme_directory_url: String,
    /// Contact email for the ACME account
    pub acme_email: Option<String>,
    /// Grace period for in-flight lineages on shutdown, seconds
    pub shutdown_grace_secs: u64,
}

const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/certroute/config.json"),
            state_dir: PathBuf::from("/var/lib/certroute"),
            acme_directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            acme_email: None,
            shutdown_grace_secs: 30,
        }
    }
}

impl EnvConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CERTROUTE_CONFIG") {
            config.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CERTROUTE_STATE_DIR") {
            config.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CERTROUTE_ACME_EMAIL") {
            config.acme_email = Some(v);
        }
        if let Ok(v) = std::env::var("CERTROUTE_ACME_STAGING") {
            if v != "0" && v.to_lowercase() != "false" {
                config.acme_directory_url = LETSENCRYPT_STAGING.to_string();
            }
        }
        if let Ok(v) = std::env::var("CERTROUTE_ACME_DIRECTORY") {
            config.acme_directory_url = v;
        }
        if let Ok(v) = std::env::var("CERTROUTE_SHUTDOWN_GRACE") {
            if let Ok(secs) = v.parse() {
                config.shutdown_grace_secs = secs;
            }
        }

        config
    }
}

/// Global timing and concurrency settings from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Days before expiry at which renewal is triggered
    pub renewal_threshold_days: u32,
    /// Seconds between configuration digest polls
    pub config_poll_secs: u64,
    /// 5-field cron expression for the daily renewal sweep
    pub renewal_cron: String,
    /// Upper bound for the random delay added to the renewal sweep, seconds
    pub renewal_jitter_secs: u64,
    /// Seconds between TXT propagation polls for one domain
    pub propagation_poll_secs: u64,
    /// Propagation polls per domain before giving up
    pub propagation_max_attempts: u32,
    /// Overall propagation deadline for one lineage, seconds
    pub propagation_timeout_secs: u64,
    /// Concurrent propagation queries per lineage
    pub propagation_workers: usize,
    /// Concurrent lineage processing tasks
    pub lineage_workers: usize,
    /// Deploy hook timeout, seconds
    pub hook_timeout_secs: u64,
    /// ACME order validation/finalization deadline, seconds
    pub acme_timeout_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            renewal_threshold_days: 30,
            config_poll_secs: 10,
            renewal_cron: "0 3 * * *".to_string(),
            renewal_jitter_secs: 300,
            propagation_poll_secs: 5,
            propagation_max_attempts: 30,
            propagation_timeout_secs: 300,
            propagation_workers: 8,
            lineage_workers: 4,
            hook_timeout_secs: 120,
            acme_timeout_secs: 600,
        }
    }
}

/// Private key profile used when generating the CSR for a lineage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyProfile {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

/// Desired ownership and mode for a lineage's output directory.
///
/// Modes are written in the configuration file as octal strings ("0640").
/// Ownership is numeric; `None` leaves the current owner untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    #[serde(with = "octal_mode")]
    pub file_mode: u32,
    #[serde(with = "octal_mode")]
    pub dir_mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            file_mode: 0o600,
            dir_mode: 0o700,
            uid: None,
            gid: None,
        }
    }
}

/// Serde helper for octal mode strings ("0640" or "640").
mod octal_mode {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04o}", mode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let s = String::deserialize(deserializer)?;
        u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .map_err(|_| serde::de::Error::custom(format!("invalid octal mode: {s}")))
    }
}

/// Reference to a DNS provider account used for challenge records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name lineages refer to this provider by
    pub name: String,
    /// Provider kind ("cloudflare")
    pub kind: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub zone_id: String,
}

/// One named certificate target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    /// Unique identifier within a snapshot
    pub name: String,
    /// Domains covered by the certificate; the first is the common name
    pub domains: Vec<String>,
    /// Name of the DNS provider used for validation
    pub provider: String,
    #[serde(default)]
    pub key_profile: KeyProfile,
    /// Command run after successful issuance, tokenized with shell-word rules
    #[serde(default)]
    pub deploy_hook: Option<String>,
    /// Output directory override; defaults to `<state>/lineages/<name>`
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub permissions: PermissionPolicy,
}

impl Lineage {
    /// Primary (common-name) domain.
    pub fn primary_domain(&self) -> &str {
        &self.domains[0]
    }
}

/// Full declarative configuration: lineages plus global settings.
///
/// Published as an immutable snapshot; replaced wholesale when the
/// configuration file changes, never patched in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub lineages: Vec<Lineage>,
}

impl ConfigSnapshot {
    /// Load and validate a snapshot from a JSON file. A missing file yields
    /// an empty snapshot so a fresh install starts idle instead of crashing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using empty snapshot", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&content)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let providers: HashSet<&str> = self.providers.iter().map(|p| p.name.as_str()).collect();

        for lineage in &self.lineages {
            if lineage.name.is_empty() {
                return Err(ConfigError::Invalid("lineage with empty name".into()));
            }
            if !names.insert(lineage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate lineage name: {}",
                    lineage.name
                )));
            }
            if lineage.domains.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "lineage {} has no domains",
                    lineage.name
                )));
            }
            if !providers.contains(lineage.provider.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "lineage {} references unknown provider {}",
                    lineage.name, lineage.provider
                )));
            }
            if lineage.permissions.file_mode > 0o7777 || lineage.permissions.dir_mode > 0o7777 {
                return Err(ConfigError::Invalid(format!(
                    "lineage {} has out-of-range permission mode",
                    lineage.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a provider definition by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_json(lineages: &str) -> String {
        format!(
            r#"{{
                "providers": [{{"name": "cf", "kind": "cloudflare", "api_token": "t", "zone_id": "z"}}],
                "lineages": {lineages}
            }}"#
        )
    }

    #[test]
    fn test_parse_minimal_lineage() {
        let json = snapshot_json(
            r#"[{"name": "web", "domains": ["example.com", "*.example.com"], "provider": "cf"}]"#,
        );
        let snapshot: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        snapshot.validate().unwrap();
        assert_eq!(snapshot.lineages[0].primary_domain(), "example.com");
        assert_eq!(snapshot.lineages[0].permissions.file_mode, 0o600);
        assert_eq!(snapshot.lineages[0].key_profile, KeyProfile::EcdsaP256);
    }

    #[test]
    fn test_octal_mode_roundtrip() {
        let json = snapshot_json(
            r#"[{"name": "web", "domains": ["example.com"], "provider": "cf",
                 "permissions": {"file_mode": "0640", "dir_mode": "0750"}}]"#,
        );
        let snapshot: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.lineages[0].permissions.file_mode, 0o640);
        assert_eq!(snapshot.lineages[0].permissions.dir_mode, 0o750);
    }

    #[test]
    fn test_duplicate_lineage_rejected() {
        let json = snapshot_json(
            r#"[{"name": "web", "domains": ["a.com"], "provider": "cf"},
                {"name": "web", "domains": ["b.com"], "provider": "cf"}]"#,
        );
        let snapshot: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_empty_domains_rejected() {
        let json = snapshot_json(r#"[{"name": "web", "domains": [], "provider": "cf"}]"#);
        let snapshot: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let json = snapshot_json(r#"[{"name": "web", "domains": ["a.com"], "provider": "route53"}]"#);
        let snapshot: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_empty_snapshot() {
        let snapshot = ConfigSnapshot::load(Path::new("/nonexistent/certroute.json")).unwrap();
        assert!(snapshot.lineages.is_empty());
    }
}
