//! Configuration watcher.
//!
//! Polls the configuration file's digest and, on first run or any change,
//! parses a fresh snapshot, swaps it in atomically, and triggers a full
//! reconciliation pass. A snapshot that fails to parse keeps the previous
//! one active. Lineages removed from the configuration are not deleted from
//! disk.

use crate::orchestrator::Sweep;
use cr_common::config::ConfigSnapshot;
use cr_common::digest::Digest;
use cr_common::error::ConfigError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info};

/// The published configuration snapshot. Readers clone the inner `Arc` and
/// keep a consistent view for their whole run; the watcher replaces the
/// `Arc` wholesale, never mutating a published snapshot.
pub type SharedSnapshot = Arc<RwLock<Arc<ConfigSnapshot>>>;

pub async fn run(
    config_path: PathBuf,
    snapshot: SharedSnapshot,
    triggers: mpsc::Sender<Sweep>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(path = %config_path.display(), "Config watcher started");
    let mut last_digest: Option<Digest> = None;
    let mut first_run = true;

    loop {
        match poll_once(&config_path, &snapshot, &mut last_digest).await {
            Ok(true) => {
                let sweep = if first_run {
                    Sweep::Startup
                } else {
                    Sweep::ConfigChanged
                };
                if triggers.send(sweep).await.is_err() {
                    return Ok(());
                }
            }
            Ok(false) => {}
            Err(e) => {
                // Previous snapshot stays active; retry on the next change
                error!(error = %e, "Failed to load configuration");
            }
        }
        first_run = false;

        let poll_secs = snapshot.read().await.settings.config_poll_secs;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(poll_secs)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Config watcher stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// One digest poll. Returns `Ok(true)` when a new snapshot was published.
async fn poll_once(
    config_path: &Path,
    snapshot: &SharedSnapshot,
    last_digest: &mut Option<Digest>,
) -> Result<bool, ConfigError> {
    let digest = Digest::of_file(config_path)?;
    if last_digest.as_ref() == Some(&digest) {
        return Ok(false);
    }
    // Mark the digest seen before parsing so a broken file is not re-parsed
    // every tick; the next edit is picked up as a fresh change.
    *last_digest = Some(digest);

    let new_snapshot = ConfigSnapshot::load(config_path)?;
    info!(
        digest = %digest,
        lineages = new_snapshot.lineages.len(),
        "Configuration change detected, snapshot replaced"
    );
    *snapshot.write().await = Arc::new(new_snapshot);
    Ok(true)
}
