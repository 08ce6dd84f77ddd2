//! Workspace retention and cleanup

use crate::analysis::workspace::FILE_PREFIX;
use crate::core::errors::TealError;
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long request files are kept on the data root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Files older than this (by modification time) are deleted
    pub max_age: Duration,
    /// Time between sweeps
    pub sweep_interval: Duration,
    /// Whether the background sweep runs at all
    pub enabled: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            enabled: true,
        }
    }
}

impl RetentionPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Report generated after a sweep
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub scanned_files: usize,
    pub deleted_files: usize,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// Deletes expired request files under the data root
///
/// Only `teal_*` files inside shard directories are considered. Shard
/// directories themselves are kept: there are at most 256 of them and
/// removing one could race with a request that is about to write into it.
pub struct WorkspaceJanitor {
    data_root: PathBuf,
    policy: RetentionPolicy,
}

impl WorkspaceJanitor {
    pub fn new(data_root: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            data_root: data_root.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Remove every request file older than the policy's max age
    pub async fn sweep(&self) -> Result<CleanupReport> {
        let max_age = ChronoDuration::from_std(self.policy.max_age)
            .map_err(|e| TealError::Config(format!("retention max age out of range: {}", e)))?;
        self.sweep_older_than(Utc::now() - max_age).await
    }

    async fn sweep_older_than(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        if !fs::try_exists(&self.data_root).await.unwrap_or(false) {
            debug!(root = %self.data_root.display(), "Data root does not exist yet");
            return Ok(report);
        }

        let mut shards = fs::read_dir(&self.data_root)
            .await
            .map_err(|e| TealError::storage(&self.data_root, e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| TealError::storage(&self.data_root, e))?
        {
            let is_dir = shard.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            self.sweep_shard(&shard.path(), cutoff, &mut report).await;
        }

        info!(
            scanned = report.scanned_files,
            deleted = report.deleted_files,
            freed_bytes = report.freed_bytes,
            errors = report.errors.len(),
            "Workspace sweep completed"
        );
        Ok(report)
    }

    async fn sweep_shard(&self, shard: &Path, cutoff: DateTime<Utc>, report: &mut CleanupReport) {
        let mut entries = match fs::read_dir(shard).await {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("{}: {}", shard.display(), e));
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report.errors.push(format!("{}: {}", shard.display(), e));
                    break;
                }
            };

            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(FILE_PREFIX) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    report.errors.push(format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            report.scanned_files += 1;

            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(time) => time.into(),
                Err(e) => {
                    report.errors.push(format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            if modified > cutoff {
                continue;
            }

            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    report.deleted_files += 1;
                    report.freed_bytes += metadata.len();
                    debug!(path = %path.display(), "Removed expired request file");
                }
                Err(e) => {
                    warn!(path = %path.display(), "Failed to remove expired file: {}", e);
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }
    }

    /// Sweep on the policy interval until the task is dropped
    pub async fn run(self) {
        if !self.policy.enabled {
            debug!("Workspace retention is disabled");
            return;
        }

        let mut ticker = interval(self.policy.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_age_secs = self.policy.max_age.as_secs(),
            interval_secs = self.policy.sweep_interval.as_secs(),
            "Starting workspace retention"
        );

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!("Workspace sweep failed: {}", e);
            }
        }
    }
}
