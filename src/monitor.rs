//! Polling watcher that re-reads a sheet whenever its file changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::io::store;
use crate::model::SheetRow;

/// Modification time and size; `None` while the file is missing.
type Fingerprint = Option<(SystemTime, u64)>;

#[derive(Debug, Clone)]
pub struct Monitor {
    path: PathBuf,
    sheet: String,
    interval: Duration,
}

impl Monitor {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            sheet: sheet.into(),
            interval,
        }
    }

    /// Polls until `shutdown` turns `true` or its sender is dropped. The first
    /// iteration always refreshes; later ones only after the file changed.
    /// Returns the number of refreshes delivered to `on_refresh`.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), sheet = %self.sheet))]
    pub async fn run<F>(&self, mut on_refresh: F, mut shutdown: watch::Receiver<bool>) -> usize
    where
        F: FnMut(Result<Vec<SheetRow>>),
    {
        let mut last: Fingerprint = None;
        let mut dirty = true;
        let mut refreshes = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let current = fingerprint(&self.path);
            if current != last {
                last = current;
                dirty = true;
            }
            if dirty {
                dirty = false;
                refreshes += 1;
                debug!(refresh = refreshes, "sheet changed, re-reading");
                on_refresh(store::read_rows(&self.path, &self.sheet));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        refreshes
    }
}

fn fingerprint(path: &Path) -> Fingerprint {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}
