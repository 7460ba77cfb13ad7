use crate::config::PermissionPolicy;
use crate::error::PermissionError;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, warn};

/// What a reconciliation run did. `changed == 0` on a second run over an
/// untouched tree is the idempotency contract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub changed: usize,
}

/// Reconcile ownership and mode of a directory tree against `policy`.
///
/// Directories get `dir_mode`, regular files `file_mode`. Entries already
/// matching the policy are left alone, so a drift-free second run performs
/// zero mutating syscalls. Symbolic links are never followed; a dangling link
/// is skipped, not an error.
pub fn reconcile(root: &Path, policy: &PermissionPolicy) -> Result<ReconcileReport, PermissionError> {
    if policy.file_mode > 0o7777 {
        return Err(PermissionError::InvalidMode(policy.file_mode));
    }
    if policy.dir_mode > 0o7777 {
        return Err(PermissionError::InvalidMode(policy.dir_mode));
    }

    let mut report = ReconcileReport::default();
    reconcile_entry(root, policy, &mut report)?;
    debug!(
        root = %root.display(),
        examined = report.examined,
        changed = report.changed,
        "Permission reconciliation complete"
    );
    Ok(report)
}

fn reconcile_entry(
    path: &Path,
    policy: &PermissionPolicy,
    report: &mut ReconcileReport,
) -> Result<(), PermissionError> {
    // symlink_metadata so links are inspected, never traversed
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Entry vanished during reconciliation, skipping");
            return Ok(());
        }
        Err(source) => {
            return Err(PermissionError::Inspect {
                path: path.display().to_string(),
                source,
            });
        }
    };

    if meta.file_type().is_symlink() {
        debug!(path = %path.display(), "Skipping symlink");
        return Ok(());
    }

    report.examined += 1;

    let desired_mode = if meta.is_dir() {
        policy.dir_mode
    } else {
        policy.file_mode
    };

    if meta.permissions().mode() & 0o7777 != desired_mode {
        fs::set_permissions(path, fs::Permissions::from_mode(desired_mode)).map_err(|source| {
            PermissionError::Chmod {
                path: path.display().to_string(),
                source,
            }
        })?;
        report.changed += 1;
    }

    let want_uid = policy.uid.filter(|&uid| uid != meta.uid());
    let want_gid = policy.gid.filter(|&gid| gid != meta.gid());
    if want_uid.is_some() || want_gid.is_some() {
        std::os::unix::fs::chown(path, want_uid, want_gid).map_err(|source| {
            PermissionError::Chown {
                path: path.display().to_string(),
                source,
            }
        })?;
        report.changed += 1;
    }

    if meta.is_dir() {
        let entries = fs::read_dir(path).map_err(|source| PermissionError::Inspect {
            path: path.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| PermissionError::Inspect {
                path: path.display().to_string(),
                source,
            })?;
            reconcile_entry(&entry.path(), policy, report)?;
        }
    }

    Ok(())
}
