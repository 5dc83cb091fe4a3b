//! Postgres-backed record store.
//!
//! Row shapes follow the hosting service's migrations; this module only reads
//! and writes the columns the core contract needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use tracing::info;

use crate::error::SyncError;
use crate::Result;
use crate::types::{
    BatchKey, DryRunOutcome, JobId, JobStatus, NotificationId, NotificationStatus, SyncJob,
    SyncKind, SyncNotification,
};

use super::RecordStore;

#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRecordStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresRecordStore {
    /// Create a new Postgres-backed store and verify database health.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                SyncError::Internal(format!("Record store failed Postgres health check: {e}"))
            })?;
        info!("Record store connected to Postgres");
        Ok(Self { pool })
    }
}

fn job_from_row(row: &PgRow) -> Result<SyncJob> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| SyncError::Internal(format!("Unknown job status in store: {status}")))?;
    let kind: String = row.try_get("kind")?;
    let kind = SyncKind::parse(&kind)
        .ok_or_else(|| SyncError::Internal(format!("Unknown job kind in store: {kind}")))?;
    let process_id: Option<i64> = row.try_get("process_id")?;

    Ok(SyncJob {
        id: JobId(row.try_get("id")?),
        status,
        source: row.try_get("source")?,
        destination: row.try_get("destination")?,
        kind,
        category: row.try_get("category")?,
        group: row.try_get("group_label")?,
        subgroup: row.try_get("subgroup_label")?,
        process_id: process_id.and_then(|pid| u32::try_from(pid).ok()),
        log: row.try_get("log")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<SyncNotification> {
    let status: String = row.try_get("status")?;
    let status = NotificationStatus::parse(&status).ok_or_else(|| {
        SyncError::Internal(format!("Unknown notification status in store: {status}"))
    })?;
    let series: Option<String> = row.try_get("series")?;
    let season: Option<i32> = row.try_get("season")?;
    let batch_key = match (series, season) {
        (Some(series), Some(season)) => Some(BatchKey::new(series, season as u32)),
        _ => None,
    };
    let dry_run: Option<serde_json::Value> = row.try_get("dry_run")?;
    let dry_run = dry_run
        .map(serde_json::from_value::<DryRunOutcome>)
        .transpose()?;

    Ok(SyncNotification {
        id: NotificationId(row.try_get("id")?),
        job_id: row.try_get::<Option<uuid::Uuid>, _>("job_id")?.map(JobId),
        status,
        batch_key,
        remote_path: row.try_get("remote_path")?,
        local_path: row.try_get("local_path")?,
        dry_run,
        dispatch_at: row.try_get("dispatch_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const JOB_COLUMNS: &str = "id, status, source, destination, kind, category, group_label, \
                           subgroup_label, process_id, log, error, started_at, finished_at, \
                           created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, job_id, status, series, season, remote_path, local_path, \
                                    dry_run, dispatch_at, created_at, updated_at";

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, status, source, destination, kind, category, \
             group_label, subgroup_label, process_id, log, error, started_at, finished_at, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(&job.source)
        .bind(&job.destination)
        .bind(job.kind.as_str())
        .bind(&job.category)
        .bind(&job.group)
        .bind(&job.subgroup)
        .bind(job.process_id.map(i64::from))
        .bind(&job.log)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn set_job_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE sync_jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_job_running(&self, id: JobId, process_id: u32) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'running', process_id = $2, started_at = NOW(), \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(i64::from(process_id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_finished(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = $2, error = $3, finished_at = NOW(), \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_job(&self, id: JobId) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'pending', process_id = NULL, error = NULL, \
             started_at = NULL, finished_at = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_job_log(&self, id: JobId, line: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET log = array_append(log, $2), updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(line)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = $1 ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn create_notification(&self, notification: &SyncNotification) -> Result<()> {
        let dry_run = notification
            .dry_run
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "INSERT INTO sync_notifications (id, job_id, status, series, season, remote_path, \
             local_path, dry_run, dispatch_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(notification.id.0)
        .bind(notification.job_id.map(|id| id.0))
        .bind(notification.status.as_str())
        .bind(notification.batch_key.as_ref().map(|key| key.series.clone()))
        .bind(notification.batch_key.as_ref().map(|key| key.season as i32))
        .bind(&notification.remote_path)
        .bind(&notification.local_path)
        .bind(dry_run)
        .bind(notification.dispatch_at)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_notification(&self, id: NotificationId) -> Result<Option<SyncNotification>> {
        let row = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM sync_notifications WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn set_notification_status(
        &self,
        id: NotificationId,
        status: NotificationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE sync_notifications SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_notification_status_for_job(
        &self,
        job_id: JobId,
        status: NotificationStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_notifications SET status = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id.0)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn link_notifications(&self, ids: &[NotificationId], job_id: JobId) -> Result<()> {
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query(
            "UPDATE sync_notifications SET job_id = $2, updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(&ids)
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_notification_dry_run(
        &self,
        id: NotificationId,
        outcome: &DryRunOutcome,
    ) -> Result<()> {
        sqlx::query("UPDATE sync_notifications SET dry_run = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(serde_json::to_value(outcome)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_notification_dispatch_at(
        &self,
        id: NotificationId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_notifications SET dispatch_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications_by_job(&self, job_id: JobId) -> Result<Vec<SyncNotification>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM sync_notifications WHERE job_id = $1 \
             ORDER BY created_at"
        ))
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<SyncNotification>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM sync_notifications WHERE status = $1 \
             ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }
}
