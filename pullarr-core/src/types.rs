use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for sync jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for sync notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states for a sync job.
///
/// `Duplicate` is terminal but, unlike the other terminal states, not
/// restartable: the colliding job owns the destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Duplicate,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "duplicate" => Some(JobStatus::Duplicate),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Duplicate
        )
    }

    /// Restart is only permitted once the previous attempt has fully resolved.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states for a sync notification. Mirrors the linked job where one
/// exists; `ManualSyncRequired` is terminal and reached only through a failed
/// dry-run validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    ReadyForTransfer,
    QueuedSlot,
    QueuedPath,
    Syncing,
    Completed,
    Failed,
    ManualSyncRequired,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::ReadyForTransfer => "ready_for_transfer",
            NotificationStatus::QueuedSlot => "queued_slot",
            NotificationStatus::QueuedPath => "queued_path",
            NotificationStatus::Syncing => "syncing",
            NotificationStatus::Completed => "completed",
            NotificationStatus::Failed => "failed",
            NotificationStatus::ManualSyncRequired => "manual_sync_required",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NotificationStatus::Pending),
            "ready_for_transfer" => Some(NotificationStatus::ReadyForTransfer),
            "queued_slot" => Some(NotificationStatus::QueuedSlot),
            "queued_path" => Some(NotificationStatus::QueuedPath),
            "syncing" => Some(NotificationStatus::Syncing),
            "completed" => Some(NotificationStatus::Completed),
            "failed" => Some(NotificationStatus::Failed),
            "manual_sync_required" => Some(NotificationStatus::ManualSyncRequired),
            "cancelled" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job mirrors: one season folder of a series, or one movie folder.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Series,
    Movie,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Series => "series",
            SyncKind::Movie => "movie",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "series" => Some(SyncKind::Series),
            "movie" => Some(SyncKind::Movie),
            _ => None,
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch identity for auto-sync grouping: one batch per series season.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub series: String,
    pub season: u32,
}

impl BatchKey {
    pub fn new(series: impl Into<String>, season: u32) -> Self {
        Self {
            series: series.into(),
            season,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_S{}", self.series, self.season)
    }
}

/// Durable sync job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub status: JobStatus,
    /// Remote source path, relative to the remote user's sync root.
    pub source: String,
    /// Local destination directory.
    pub destination: String,
    pub kind: SyncKind,
    /// Download-client category the job originated from, when known.
    pub category: Option<String>,
    /// Series title (or movie title) label.
    pub group: Option<String>,
    /// Season label within the group.
    pub subgroup: Option<String>,
    /// OS pid of the external sync process while one is attached.
    pub process_id: Option<u32>,
    /// Append-only output log of the external process.
    pub log: Vec<String>,
    /// Terminal failure message, when the job failed.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(
        id: JobId,
        source: impl Into<String>,
        destination: impl Into<String>,
        kind: SyncKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            source: source.into(),
            destination: destination.into(),
            kind,
            category: None,
            group: None,
            subgroup: None,
            process_id: None,
            log: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable notification record. Episode notifications carry a batch key and
/// coalesce into consolidated jobs; single-item notifications do not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncNotification {
    pub id: NotificationId,
    /// Job this notification is linked to, once one exists.
    pub job_id: Option<JobId>,
    pub status: NotificationStatus,
    pub batch_key: Option<BatchKey>,
    /// Remote source path of the item the event described.
    pub remote_path: String,
    /// Local destination directory the item will land in.
    pub local_path: String,
    /// Result blob of the most recent dry-run validation.
    pub dry_run: Option<DryRunOutcome>,
    /// Scheduled dispatch time while the notification sits in a batch window.
    pub dispatch_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncNotification {
    pub fn new(
        id: NotificationId,
        remote_path: impl Into<String>,
        local_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id: None,
            status: NotificationStatus::Pending,
            batch_key: None,
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            dry_run: None,
            dispatch_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a dry-run safety validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DryRunOutcome {
    pub safe: bool,
    /// Names every violated check when `safe` is false.
    pub reason: Option<String>,
    pub deleted_count: usize,
    pub incoming_count: usize,
    /// Total file count the simulation reported for the remote side.
    pub remote_file_count: u64,
    /// Media files counted directly in the local destination.
    pub local_file_count: u64,
}

impl DryRunOutcome {
    /// Fail-closed outcome used when the simulation itself could not run.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
            deleted_count: 0,
            incoming_count: 0,
            remote_file_count: 0,
            local_file_count: 0,
        }
    }
}
