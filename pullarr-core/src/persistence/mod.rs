//! Persistence contracts for job and notification storage.
//!
//! The core consumes durable state through this narrow interface only; the
//! schema itself belongs to the hosting service. Live admission decisions
//! never read the store; the queue module's in-memory ledger owns them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::types::{
    DryRunOutcome, JobId, JobStatus, NotificationId, NotificationStatus, SyncJob, SyncNotification,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// Repository abstraction for durable job/notification storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_job(&self, job: &SyncJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>>;

    async fn set_job_status(&self, id: JobId, status: JobStatus) -> Result<()>;

    /// Transition a job to running: stamps `started_at` and the process pid.
    async fn mark_job_running(&self, id: JobId, process_id: u32) -> Result<()>;

    /// Transition a job to a terminal state: stamps `finished_at` and the
    /// failure message, if any.
    async fn mark_job_finished(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Prepare a job for restart: back to pending, handle id and timestamps
    /// cleared.
    async fn reset_job(&self, id: JobId) -> Result<()>;

    async fn append_job_log(&self, id: JobId, line: &str) -> Result<()>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<SyncJob>>;

    async fn create_notification(&self, notification: &SyncNotification) -> Result<()>;

    async fn get_notification(&self, id: NotificationId) -> Result<Option<SyncNotification>>;

    async fn set_notification_status(
        &self,
        id: NotificationId,
        status: NotificationStatus,
    ) -> Result<()>;

    /// Bulk status update across every notification linked to `job_id`.
    /// Returns the number of notifications touched.
    async fn set_notification_status_for_job(
        &self,
        job_id: JobId,
        status: NotificationStatus,
    ) -> Result<u64>;

    /// Attach a set of notifications to one consolidated job.
    async fn link_notifications(&self, ids: &[NotificationId], job_id: JobId) -> Result<()>;

    async fn set_notification_dry_run(
        &self,
        id: NotificationId,
        outcome: &DryRunOutcome,
    ) -> Result<()>;

    async fn set_notification_dispatch_at(
        &self,
        id: NotificationId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_notifications_by_job(&self, job_id: JobId) -> Result<Vec<SyncNotification>>;

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<SyncNotification>>;
}
