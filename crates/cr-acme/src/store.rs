use crate::types::{AcmeResult, CertificateBundle, LineageMetadata};
use cr_common::config::Lineage;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const KEY_FILE: &str = "privkey.pem";
const CHAIN_FILE: &str = "fullchain.pem";
const METADATA_FILE: &str = "lineage.json";

/// On-disk layout for certificate material and ACME account state.
///
/// Per lineage: `<dir>/privkey.pem`, `<dir>/fullchain.pem` and
/// `<dir>/lineage.json`, where `<dir>` defaults to
/// `<state>/lineages/<name>` and can be overridden per lineage.
#[derive(Debug, Clone)]
pub struct LineageStore {
    base_path: PathBuf,
}

impl LineageStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the storage directories.
    pub fn init(&self) -> AcmeResult<()> {
        fs::create_dir_all(&self.base_path)?;
        fs::create_dir_all(self.base_path.join("lineages"))?;
        Ok(())
    }

    /// Path of the persisted ACME account credentials.
    pub fn account_path(&self) -> PathBuf {
        self.base_path.join("account.json")
    }

    pub fn has_account(&self) -> bool {
        self.account_path().exists()
    }

    /// Output directory for a lineage, honoring its configured override.
    pub fn lineage_dir(&self, lineage: &Lineage) -> PathBuf {
        lineage
            .output_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("lineages").join(&lineage.name))
    }

    pub fn key_path(&self, lineage: &Lineage) -> PathBuf {
        self.lineage_dir(lineage).join(KEY_FILE)
    }

    pub fn chain_path(&self, lineage: &Lineage) -> PathBuf {
        self.lineage_dir(lineage).join(CHAIN_FILE)
    }

    pub fn metadata_path(&self, lineage: &Lineage) -> PathBuf {
        self.lineage_dir(lineage).join(METADATA_FILE)
    }

    /// Whether key, chain and metadata are all present on disk.
    pub fn material_present(&self, lineage: &Lineage) -> bool {
        self.key_path(lineage).exists()
            && self.chain_path(lineage).exists()
            && self.metadata_path(lineage).exists()
    }

    /// Load the persisted metadata for a lineage, `None` when absent.
    pub fn load_metadata(&self, lineage: &Lineage) -> AcmeResult<Option<LineageMetadata>> {
        let path = self.metadata_path(lineage);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write a freshly issued bundle: key, chain, then metadata last so a
    /// crash mid-write is detected as "material absent" on the next tick.
    pub fn write_bundle(&self, lineage: &Lineage, bundle: &CertificateBundle) -> AcmeResult<()> {
        let dir = self.lineage_dir(lineage);
        fs::create_dir_all(&dir)?;

        // The key must never be world-readable, not even for the moment
        // before permission reconciliation runs
        write_private(&self.key_path(lineage), &bundle.private_key_pem)?;
        fs::write(self.chain_path(lineage), &bundle.chain_pem)?;

        let metadata = LineageMetadata {
            name: bundle.lineage.clone(),
            domains: bundle.domains.clone(),
            issued_at: bundle.issued_at,
            expires_at: bundle.expires_at,
        };
        self.write_json_atomic(&self.metadata_path(lineage), &metadata)
    }

    /// Serialize to a temp file and rename into place.
    fn write_json_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> AcmeResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn read_account(&self) -> AcmeResult<String> {
        Ok(fs::read_to_string(self.account_path())?)
    }

    pub fn write_account(&self, credentials_json: &str) -> AcmeResult<()> {
        write_private(&self.account_path(), credentials_json)?;
        Ok(())
    }
}

/// Write a secret-bearing file, created owner-only.
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}
