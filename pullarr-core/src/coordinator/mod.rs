//! Coordinator glue binding jobs, notifications, queue, and runner together.
//!
//! Job state flows one way: a job transition releases the queue, then updates
//! every notification linked to the job id. Notifications never change a job,
//! and nothing outside this module writes a notification status on a job's
//! behalf.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::autosync::{AutoSyncScheduler, BatchDispatcher};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::media;
use crate::persistence::RecordStore;
use crate::queue::{Admission, Promotion, QueueManager, QueueSnapshot, ReleaseOutcome};
use crate::runner::{CompletionReceiver, JobRunner};
use crate::types::{
    BatchKey, DryRunOutcome, JobId, JobStatus, NotificationId, NotificationStatus, SyncJob,
    SyncKind,
};
use crate::validator::{DryRunValidator, SafetyValidator};

/// Owns the queue, runner, scheduler, and validator, and exposes the
/// operations the API surface calls.
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    queue: QueueManager,
    runner: JobRunner,
    scheduler: AutoSyncScheduler,
    validator: Arc<dyn SafetyValidator>,
    events: EventBus,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("queue", &self.queue)
            .field("runner", &self.runner)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// The scheduler outlives nothing: it dispatches through a weak handle so the
/// coordinator's `Arc` cycle breaks cleanly on shutdown.
struct WeakDispatcher {
    inner: Weak<SyncCoordinator>,
}

#[async_trait]
impl BatchDispatcher for WeakDispatcher {
    async fn dispatch_batch(
        &self,
        key: &BatchKey,
        notifications: &[NotificationId],
        source: &str,
        destination: &str,
    ) -> Result<JobId> {
        let coordinator = self
            .inner
            .upgrade()
            .ok_or_else(|| SyncError::Internal("coordinator has shut down".to_string()))?;
        coordinator
            .dispatch_consolidated(key, notifications, source, destination)
            .await
    }
}

impl SyncCoordinator {
    /// Build the full coordinator with the real dry-run validator.
    pub fn new(config: SyncConfig, store: Arc<dyn RecordStore>, events: EventBus) -> Arc<Self> {
        let validator: Arc<dyn SafetyValidator> = Arc::new(DryRunValidator::new(
            &config.runner,
            config.remote.clone(),
            config.validator.clone(),
        ));
        Self::with_validator(config, store, validator, events)
    }

    /// Build with an explicit validator implementation.
    pub fn with_validator(
        config: SyncConfig,
        store: Arc<dyn RecordStore>,
        validator: Arc<dyn SafetyValidator>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SyncCoordinator>| {
            let queue = QueueManager::new(config.queue.max_concurrent);
            let runner = JobRunner::new(
                config.runner.clone(),
                config.remote.clone(),
                Arc::clone(&store),
                events.clone(),
            );
            let dispatcher = Arc::new(WeakDispatcher {
                inner: weak.clone(),
            });
            let scheduler = AutoSyncScheduler::new(
                config.auto_sync,
                Arc::clone(&store),
                Arc::clone(&validator),
                dispatcher,
                events.clone(),
            );
            Self {
                config,
                store,
                queue,
                runner,
                scheduler,
                validator,
                events,
            }
        })
    }

    /// Rebuild the admission ledger from durable records and reconcile
    /// running jobs against live OS processes. Call once, before accepting
    /// new work; the ledger is never derived from the store again.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        // Running records first, so their destinations win any reservation
        // collision left behind by a crash.
        for job in self.store.list_jobs_by_status(JobStatus::Running).await? {
            match self.runner.adopt(&job).await? {
                Some(completion) => {
                    self.queue.restore_running(job.id, &job.destination).await;
                    self.watch_completion(job.id, completion);
                }
                None => {
                    // Orphan: adopt already resolved the job to failed.
                    self.propagate_to_notifications(job.id, NotificationStatus::Failed)
                        .await;
                }
            }
        }

        // Queued and pending records re-enter admission; a destination
        // collision queues them as path-waiters instead of rejecting jobs
        // that were already admitted once.
        for status in [JobStatus::Queued, JobStatus::Pending] {
            for job in self.store.list_jobs_by_status(status).await? {
                match self.queue.readmit(job.id, &job.destination).await {
                    Admission::Running => self.launch(job).await,
                    Admission::QueuedSlot => {
                        self.store.set_job_status(job.id, JobStatus::Queued).await?;
                        self.propagate_to_notifications(job.id, NotificationStatus::QueuedSlot)
                            .await;
                    }
                    Admission::QueuedPath => {
                        self.store.set_job_status(job.id, JobStatus::Queued).await?;
                        self.propagate_to_notifications(job.id, NotificationStatus::QueuedPath)
                            .await;
                    }
                    // readmit never rejects.
                    Admission::Duplicate { .. } => {}
                }
            }
        }

        info!("recovery complete");
        Ok(())
    }

    /// Create and admit a job. Returns whether it was accepted (running or
    /// queued); a duplicate destination is the one deterministic rejection.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_job(
        self: &Arc<Self>,
        id: JobId,
        source: &str,
        destination: &str,
        kind: SyncKind,
        category: Option<String>,
        group: Option<String>,
        subgroup: Option<String>,
    ) -> Result<bool> {
        let mut job = SyncJob::new(id, source, destination, kind);
        job.category = category;
        job.group = group;
        job.subgroup = subgroup;
        self.store.create_job(&job).await?;
        self.admit(job).await
    }

    /// Cancel a job in any non-terminal state. Queued jobs flip directly to
    /// cancelled; running jobs get the terminate signal and resolve through
    /// their monitor.
    pub async fn cancel_job(self: &Arc<Self>, id: JobId) -> Result<bool> {
        if self.queue.is_queued(id).await {
            let outcome = self.queue.unregister(id).await;
            self.store
                .mark_job_finished(id, JobStatus::Cancelled, None)
                .await?;
            self.propagate_to_notifications(id, NotificationStatus::Cancelled)
                .await;
            info!(job_id = %id, "queued job cancelled");
            self.events.publish(SyncEvent::JobFinished {
                job_id: id,
                status: JobStatus::Cancelled,
            });
            self.handle_release_outcome(outcome).await;
            return Ok(true);
        }

        self.runner.cancel(id).await
    }

    /// Restart a resolved job from scratch: record reset, fresh admission.
    pub async fn restart_job(self: &Arc<Self>, id: JobId) -> Result<bool> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("job {id}")))?;
        self.runner.prepare_restart(&job).await?;
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("job {id}")))?;
        info!(job_id = %id, "restarting job");
        self.admit(job).await
    }

    /// Point-in-time queue view.
    pub async fn queue_status(&self) -> QueueSnapshot {
        self.queue.snapshot().await
    }

    /// Feed an auto-sync event into the batch scheduler.
    pub async fn schedule_auto_sync(
        &self,
        notification_id: NotificationId,
        batch_key: BatchKey,
        category: Option<&str>,
    ) -> Result<()> {
        debug!(notification_id = %notification_id, key = %batch_key, ?category, "auto-sync event");
        self.scheduler.schedule(notification_id, batch_key).await
    }

    /// Run a dry-run validation for one notification and persist the result
    /// blob on it.
    pub async fn validate_dry_run(&self, notification_id: NotificationId) -> Result<DryRunOutcome> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("notification {notification_id}")))?;
        let outcome = self
            .validator
            .validate(
                &notification.remote_path,
                Path::new(&notification.local_path),
            )
            .await;
        self.store
            .set_notification_dry_run(notification_id, &outcome)
            .await?;
        Ok(outcome)
    }

    /// Subscribe to the progress/completion event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// One consolidated job for a validated batch; all notification ids are
    /// linked to it before admission so every status change reaches them.
    async fn dispatch_consolidated(
        self: &Arc<Self>,
        key: &BatchKey,
        notifications: &[NotificationId],
        source: &str,
        destination: &str,
    ) -> Result<JobId> {
        let id = JobId::new();
        let mut job = SyncJob::new(id, source, destination, SyncKind::Series);
        job.group = Some(key.series.clone());
        job.subgroup = Some(format!("S{:02}", key.season));
        self.store.create_job(&job).await?;
        self.store.link_notifications(notifications, id).await?;
        self.admit(job).await?;
        Ok(id)
    }

    /// Run the admission decision for a created job and apply the fixed
    /// admission → notification status mapping.
    async fn admit(self: &Arc<Self>, job: SyncJob) -> Result<bool> {
        match self.queue.register(job.id, &job.destination).await {
            Admission::Running => {
                self.launch(job).await;
                Ok(true)
            }
            Admission::QueuedSlot => {
                self.store.set_job_status(job.id, JobStatus::Queued).await?;
                self.propagate_to_notifications(job.id, NotificationStatus::QueuedSlot)
                    .await;
                info!(job_id = %job.id, "job queued for a slot");
                self.events.publish(SyncEvent::JobQueued {
                    job_id: job.id,
                    path_wait: false,
                });
                Ok(true)
            }
            Admission::QueuedPath => {
                self.store.set_job_status(job.id, JobStatus::Queued).await?;
                self.propagate_to_notifications(job.id, NotificationStatus::QueuedPath)
                    .await;
                info!(job_id = %job.id, "job queued for its destination");
                self.events.publish(SyncEvent::JobQueued {
                    job_id: job.id,
                    path_wait: true,
                });
                Ok(true)
            }
            Admission::Duplicate { holder } => {
                warn!(job_id = %job.id, %holder, "duplicate destination rejected");
                self.store
                    .mark_job_finished(
                        job.id,
                        JobStatus::Duplicate,
                        Some(&format!("destination already held by job {holder}")),
                    )
                    .await?;
                self.propagate_to_notifications(job.id, NotificationStatus::Failed)
                    .await;
                self.events.publish(SyncEvent::JobRejected {
                    job_id: job.id,
                    holder,
                });
                Ok(false)
            }
        }
    }

    /// Start the external process for a job that holds a running slot.
    /// A spawn failure resolves the attempt to failed and releases the slot;
    /// there is no automatic retry.
    async fn launch(self: &Arc<Self>, job: SyncJob) {
        let backup_dir = self.config.runner.backup_root.join(job.id.to_string());
        match self.runner.start(&job, &backup_dir).await {
            Ok(completion) => {
                // Only now that a process exists may notifications say so.
                self.propagate_to_notifications(job.id, NotificationStatus::Syncing)
                    .await;
                self.watch_completion(job.id, completion);
            }
            Err(err) => {
                error!(job_id = %job.id, "failed to start sync: {err}");
                let message = err.to_string();
                if let Err(store_err) = self
                    .store
                    .mark_job_finished(job.id, JobStatus::Failed, Some(&message))
                    .await
                {
                    error!(job_id = %job.id, "failed to persist spawn failure: {store_err}");
                }
                self.events.publish(SyncEvent::JobFinished {
                    job_id: job.id,
                    status: JobStatus::Failed,
                });
                self.on_job_terminal(job.id, JobStatus::Failed).await;
            }
        }
    }

    /// Await a job's terminal status on its completion channel, then run the
    /// completion pipeline.
    fn watch_completion(self: &Arc<Self>, job_id: JobId, mut completion: CompletionReceiver) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let status = loop {
                if let Some(status) = *completion.borrow() {
                    break status;
                }
                if completion.changed().await.is_err() {
                    // Monitor died without reporting; treat as failed.
                    break (*completion.borrow()).unwrap_or(JobStatus::Failed);
                }
            };
            coordinator.on_job_terminal(job_id, status).await;
        });
    }

    /// Completion pipeline: release the queue (promoting at most one waiter)
    /// and propagate the terminal status to linked notifications. The job
    /// record itself was already resolved by whoever observed the exit.
    async fn on_job_terminal(self: &Arc<Self>, job_id: JobId, status: JobStatus) {
        let outcome = self.queue.unregister(job_id).await;

        let notification_status = match status {
            JobStatus::Completed => NotificationStatus::Completed,
            JobStatus::Cancelled => NotificationStatus::Cancelled,
            _ => NotificationStatus::Failed,
        };
        let touched = match self
            .store
            .set_notification_status_for_job(job_id, notification_status)
            .await
        {
            Ok(touched) => touched,
            Err(err) => {
                error!(%job_id, "failed to propagate terminal status to notifications: {err}");
                0
            }
        };
        if touched == 0 && status == JobStatus::Completed {
            self.legacy_fallback_mark(job_id).await;
        }

        self.handle_release_outcome(outcome).await;
    }

    /// Apply a queue release: re-classified waiters get their notification
    /// status corrected, and a promoted job launches on its own task.
    async fn handle_release_outcome(self: &Arc<Self>, outcome: ReleaseOutcome) {
        for converted in outcome.converted_to_path_wait {
            self.propagate_to_notifications(converted, NotificationStatus::QueuedPath)
                .await;
        }
        if let Some(promotion) = outcome.promoted {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.promote(promotion).await;
            });
        }
    }

    // Boxed to give the future a concrete `Send` type: `handle_release_outcome`
    // spawns `promote`, and `promote` awaits `handle_release_outcome`, so an
    // `async fn` here would leave the two auto-trait evaluations mutually
    // dependent and the compiler cannot prove either `Send`.
    fn promote(
        self: &Arc<Self>,
        promotion: Promotion,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            info!(job_id = %promotion.job_id, destination = %promotion.destination, "promoting queued job");
            self.events.publish(SyncEvent::JobPromoted {
                job_id: promotion.job_id,
            });
            match self.store.get_job(promotion.job_id).await {
                Ok(Some(job)) => self.launch(job).await,
                Ok(None) => {
                    error!(job_id = %promotion.job_id, "promoted job has no record, releasing slot");
                    let outcome = self.queue.unregister(promotion.job_id).await;
                    self.handle_release_outcome(outcome).await;
                }
                Err(err) => {
                    error!(job_id = %promotion.job_id, "failed to load promoted job: {err}");
                    let outcome = self.queue.unregister(promotion.job_id).await;
                    self.handle_release_outcome(outcome).await;
                }
            }
        })
    }

    /// Bulk notification update strictly by job-id linkage.
    async fn propagate_to_notifications(&self, job_id: JobId, status: NotificationStatus) {
        if let Err(err) = self
            .store
            .set_notification_status_for_job(job_id, status)
            .await
        {
            warn!(%job_id, "failed to update linked notifications: {err}");
        }
    }

    /// Best-effort fallback for manually-triggered jobs with no linked
    /// notifications: mark pending notifications whose parsed series/season
    /// matches the job's destination as completed. The heuristic is
    /// explicitly not a contract; linkage-based propagation is the rule.
    async fn legacy_fallback_mark(&self, job_id: JobId) {
        let Ok(Some(job)) = self.store.get_job(job_id).await else {
            return;
        };
        let Some(key) = media::parse_batch_key(Path::new(&job.destination)) else {
            return;
        };
        let Ok(pending) = self
            .store
            .list_notifications_by_status(NotificationStatus::Pending)
            .await
        else {
            return;
        };
        for notification in pending {
            if notification.batch_key.as_ref() == Some(&key) {
                debug!(notification_id = %notification.id, %job_id, "legacy series/season fallback match");
                if let Err(err) = self
                    .store
                    .set_notification_status(notification.id, NotificationStatus::Completed)
                    .await
                {
                    warn!(notification_id = %notification.id, "legacy fallback update failed: {err}");
                }
            }
        }
    }
}
