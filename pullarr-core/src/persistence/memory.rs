//! In-memory record store for tests and embedded deployments.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::Result;
use crate::types::{
    DryRunOutcome, JobId, JobStatus, NotificationId, NotificationStatus, SyncJob, SyncNotification,
};

use super::RecordStore;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, SyncJob>,
    notifications: HashMap<NotificationId, SyncNotification>,
}

/// Record store holding everything in process memory. State does not survive
/// a restart, which makes it useful for exercising the recovery paths too.
#[derive(Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => f
                .debug_struct("InMemoryRecordStore")
                .field("job_count", &inner.jobs.len())
                .field("notification_count", &inner.notifications.len())
                .finish(),
            Err(_) => f
                .debug_struct("InMemoryRecordStore")
                .field("state", &"<locked>")
                .finish(),
        }
    }
}

fn job_not_found(id: JobId) -> SyncError {
    SyncError::NotFound(format!("job {id}"))
}

fn notification_not_found(id: NotificationId) -> SyncError {
    SyncError::NotFound(format!("notification {id}"))
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn set_job_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_job_running(&self, id: JobId, process_id: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        job.status = JobStatus::Running;
        job.process_id = Some(process_id);
        job.started_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_job_finished(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        job.status = status;
        job.error = error.map(str::to_string);
        job.finished_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_job(&self, id: JobId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        job.status = JobStatus::Pending;
        job.process_id = None;
        job.error = None;
        job.started_at = None;
        job.finished_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn append_job_log(&self, id: JobId, line: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        job.log.push(line.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<SyncJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<SyncJob> = inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn create_notification(&self, notification: &SyncNotification) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: NotificationId) -> Result<Option<SyncNotification>> {
        let inner = self.inner.lock().await;
        Ok(inner.notifications.get(&id).cloned())
    }

    async fn set_notification_status(
        &self,
        id: NotificationId,
        status: NotificationStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let notification = inner
            .notifications
            .get_mut(&id)
            .ok_or_else(|| notification_not_found(id))?;
        notification.status = status;
        notification.updated_at = Utc::now();
        Ok(())
    }

    async fn set_notification_status_for_job(
        &self,
        job_id: JobId,
        status: NotificationStatus,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut touched = 0u64;
        for notification in inner.notifications.values_mut() {
            if notification.job_id == Some(job_id) {
                notification.status = status;
                notification.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn link_notifications(&self, ids: &[NotificationId], job_id: JobId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            let notification = inner
                .notifications
                .get_mut(id)
                .ok_or_else(|| notification_not_found(*id))?;
            notification.job_id = Some(job_id);
            notification.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_notification_dry_run(
        &self,
        id: NotificationId,
        outcome: &DryRunOutcome,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let notification = inner
            .notifications
            .get_mut(&id)
            .ok_or_else(|| notification_not_found(id))?;
        notification.dry_run = Some(outcome.clone());
        notification.updated_at = Utc::now();
        Ok(())
    }

    async fn set_notification_dispatch_at(
        &self,
        id: NotificationId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let notification = inner
            .notifications
            .get_mut(&id)
            .ok_or_else(|| notification_not_found(id))?;
        notification.dispatch_at = Some(at);
        notification.updated_at = Utc::now();
        Ok(())
    }

    async fn list_notifications_by_job(&self, job_id: JobId) -> Result<Vec<SyncNotification>> {
        let inner = self.inner.lock().await;
        let mut notifications: Vec<SyncNotification> = inner
            .notifications
            .values()
            .filter(|n| n.job_id == Some(job_id))
            .cloned()
            .collect();
        notifications.sort_by_key(|n| n.created_at);
        Ok(notifications)
    }

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<SyncNotification>> {
        let inner = self.inner.lock().await;
        let mut notifications: Vec<SyncNotification> = inner
            .notifications
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect();
        notifications.sort_by_key(|n| n.created_at);
        Ok(notifications)
    }
}
