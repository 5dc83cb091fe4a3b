use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media;

/// Global knobs that tune the sync core.
///
/// All fields carry defaults so existing deployments can progressively adopt
/// new behaviour without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Concurrency cap for the admission queue.
    pub queue: QueueConfig,
    /// External sync tool invocation settings.
    pub runner: RunnerConfig,
    /// Remote host and credential material.
    pub remote: RemoteConfig,
    /// Auto-sync batching windows.
    pub auto_sync: AutoSyncConfig,
    /// Dry-run validation settings.
    pub validator: ValidatorConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of sync jobs running at once.
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Path to the external sync tool binary.
    pub tool_path: String,
    /// I/O timeout passed to the tool; a stalled transfer aborts after this.
    pub io_timeout_secs: u64,
    /// Root directory for per-job backups of files the mirror deletes.
    pub backup_root: PathBuf,
}

impl RunnerConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_path: "rsync".to_string(),
            io_timeout_secs: 300,
            backup_root: PathBuf::from("backups"),
        }
    }
}

/// Remote host and credential material. An empty host or a missing key file
/// is a terminal spawn failure, never a retry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub ssh_key_path: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: 22,
            ssh_key_path: PathBuf::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AutoSyncConfig {
    /// Batch wait window; each new event for a key extends the deadline by
    /// this much.
    pub wait_time_secs: u64,
    /// Hard cap on total elapsed time from batch creation to dispatch.
    pub max_wait_time_secs: u64,
}

impl AutoSyncConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_secs)
    }
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            wait_time_secs: 60,
            max_wait_time_secs: 900,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Wall-clock budget for the whole simulation; exceeding it is unsafe.
    pub timeout_secs: u64,
    /// File extensions counted as media on both sides of the comparison.
    pub media_extensions: Vec<String>,
}

impl ValidatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            media_extensions: media::default_media_file_extensions_vec(),
        }
    }
}
