//! Timestamped workbook copies and retention.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};

const BACKUP_MARKER: &str = "_backup_";

/// Copies the workbook at `path` to `<dir>/<stem>_backup_<yyyyMMdd_HHmmss>.<ext>`.
#[instrument(level = "info", skip_all, fields(path = %path.display(), dir = %dir.display()))]
pub fn backup_workbook(path: &Path, dir: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(StoreError::NotFound(format!("workbook {}", path.display())));
    }
    fs::create_dir_all(dir).map_err(|err| StoreError::access(dir, err))?;

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workbook".to_string());
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "xlsx".to_string());
    let target = dir.join(format!(
        "{stem}{BACKUP_MARKER}{}.{extension}",
        Local::now().format("%Y%m%d_%H%M%S")
    ));

    fs::copy(path, &target).map_err(|err| StoreError::access(&target, err))?;
    info!(backup = %target.display(), "workbook backed up");
    Ok(target)
}

/// Deletes backup files in `dir` last modified more than `retention_days`
/// ago. Returns how many files were removed.
#[instrument(level = "info", skip_all, fields(dir = %dir.display(), retention_days = retention_days))]
pub fn prune_backups(dir: &Path, retention_days: u32) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(dir).map_err(|err| StoreError::access(dir, err))? {
        let entry = entry.map_err(|err| StoreError::access(dir, err))?;
        let path = entry.path();
        let is_backup = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains(BACKUP_MARKER));
        if !is_backup || !path.is_file() {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map_err(|err| StoreError::access(&path, err))?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(backup = %path.display(), "removed expired backup");
                removed += 1;
            }
            Err(error) => warn!(backup = %path.display(), error = %error, "could not remove backup"),
        }
    }

    if removed > 0 {
        info!(removed, "pruned expired backups");
    }
    Ok(removed)
}
