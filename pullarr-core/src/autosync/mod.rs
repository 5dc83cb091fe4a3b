//! Auto-sync event batching.
//!
//! Episode events for the same series season arrive in bursts; each batch
//! accumulates them behind an extendable deadline and dispatches exactly one
//! validated, consolidated job. One timer task per active batch key; the
//! batch map has its own mutex.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::AutoSyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::persistence::RecordStore;
use crate::types::{BatchKey, JobId, NotificationId, NotificationStatus};
use crate::validator::SafetyValidator;

/// Seam through which a validated batch becomes one consolidated job. The
/// coordinator implements this; tests stub it.
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    /// Create, link, and admit one consolidated job covering the batch.
    async fn dispatch_batch(
        &self,
        key: &BatchKey,
        notifications: &[NotificationId],
        source: &str,
        destination: &str,
    ) -> Result<JobId>;
}

struct BatchEntry {
    notifications: Vec<NotificationId>,
    created: Instant,
    deadline: Instant,
    worker: JoinHandle<()>,
}

/// Batches incoming auto-sync events and triggers validated jobs.
pub struct AutoSyncScheduler {
    config: AutoSyncConfig,
    store: Arc<dyn RecordStore>,
    validator: Arc<dyn SafetyValidator>,
    dispatcher: Arc<dyn BatchDispatcher>,
    events: EventBus,
    batches: Arc<Mutex<HashMap<BatchKey, BatchEntry>>>,
}

impl fmt::Debug for AutoSyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("AutoSyncScheduler");
        debug.field("wait_time_secs", &self.config.wait_time_secs);
        match self.batches.try_lock() {
            Ok(batches) => {
                debug.field("active_batches", &batches.len());
            }
            Err(_) => {
                debug.field("active_batches", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Deadline after an extension: pushed out by the wait window, but never past
/// the hard cap measured from batch creation.
fn extended_deadline(
    created: Instant,
    now: Instant,
    wait_time: Duration,
    max_wait_time: Duration,
) -> Instant {
    (created + max_wait_time).min(now + wait_time)
}

impl AutoSyncScheduler {
    pub fn new(
        config: AutoSyncConfig,
        store: Arc<dyn RecordStore>,
        validator: Arc<dyn SafetyValidator>,
        dispatcher: Arc<dyn BatchDispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            validator,
            dispatcher,
            events,
            batches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record an incoming event: join the key's active batch (extending its
    /// deadline) or open a new one with a dedicated timer worker.
    pub async fn schedule(&self, notification_id: NotificationId, key: BatchKey) -> Result<()> {
        let now = Instant::now();
        let mut batches = self.batches.lock().await;

        if let Some(entry) = batches.get_mut(&key) {
            entry.notifications.push(notification_id);
            entry.deadline = extended_deadline(
                entry.created,
                now,
                self.config.wait_time(),
                self.config.max_wait_time(),
            );
            let pending = entry.notifications.len();
            let dispatch_at = dispatch_timestamp(entry.deadline, now);
            drop(batches);

            debug!(%key, pending, "batch extended");
            self.events
                .publish(SyncEvent::BatchExtended { key, pending });
            self.store
                .set_notification_dispatch_at(notification_id, dispatch_at)
                .await?;
            return Ok(());
        }

        let deadline = now + self.config.wait_time();
        let worker = self.spawn_timer(key.clone());
        batches.insert(
            key.clone(),
            BatchEntry {
                notifications: vec![notification_id],
                created: now,
                deadline,
                worker,
            },
        );
        let dispatch_at = dispatch_timestamp(deadline, now);
        drop(batches);

        info!(%key, "batch opened");
        self.events.publish(SyncEvent::BatchScheduled {
            key,
            pending: 1,
        });
        self.store
            .set_notification_dispatch_at(notification_id, dispatch_at)
            .await?;
        Ok(())
    }

    /// Number of batches currently accumulating.
    pub async fn active_batches(&self) -> usize {
        self.batches.lock().await.len()
    }

    /// Abort all timer workers. Pending batches are dropped, not dispatched.
    pub async fn shutdown(&self) {
        let mut batches = self.batches.lock().await;
        for (_, entry) in batches.drain() {
            entry.worker.abort();
        }
    }

    fn spawn_timer(&self, key: BatchKey) -> JoinHandle<()> {
        let batches = Arc::clone(&self.batches);
        let store = Arc::clone(&self.store);
        let validator = Arc::clone(&self.validator);
        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events.clone();

        tokio::spawn(async move {
            // Sleep-then-recheck: the deadline may move while we sleep.
            loop {
                let deadline = {
                    let batches = batches.lock().await;
                    match batches.get(&key) {
                        Some(entry) => entry.deadline,
                        None => return,
                    }
                };
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(deadline - now).await;
            }

            // Take ownership of the batch so this fires exactly once; a later
            // event for the same key starts a fresh batch.
            let notifications = {
                let mut batches = batches.lock().await;
                match batches.remove(&key) {
                    Some(mut entry) => std::mem::take(&mut entry.notifications),
                    None => return,
                }
            };

            run_batch(key, notifications, store, validator, dispatcher, events).await;
        })
    }
}

fn dispatch_timestamp(deadline: Instant, now: Instant) -> chrono::DateTime<chrono::Utc> {
    let remaining = deadline.saturating_duration_since(now);
    chrono::Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Validate once and transition every notification in the batch together.
async fn run_batch(
    key: BatchKey,
    notifications: Vec<NotificationId>,
    store: Arc<dyn RecordStore>,
    validator: Arc<dyn SafetyValidator>,
    dispatcher: Arc<dyn BatchDispatcher>,
    events: EventBus,
) {
    let representative = match store.get_notification(notifications[0]).await {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            warn!(%key, "batch representative notification is missing");
            mark_all(
                &store,
                &notifications,
                NotificationStatus::ManualSyncRequired,
            )
            .await;
            events.publish(SyncEvent::BatchRejected {
                key,
                reason: "notification record missing".to_string(),
            });
            return;
        }
        Err(err) => {
            error!(%key, "failed to load batch representative: {err}");
            mark_all(
                &store,
                &notifications,
                NotificationStatus::ManualSyncRequired,
            )
            .await;
            events.publish(SyncEvent::BatchRejected {
                key,
                reason: format!("record store unavailable: {err}"),
            });
            return;
        }
    };

    let outcome = validator
        .validate(
            &representative.remote_path,
            Path::new(&representative.local_path),
        )
        .await;

    for id in &notifications {
        if let Err(err) = store.set_notification_dry_run(*id, &outcome).await {
            warn!(notification_id = %id, "failed to store dry-run outcome: {err}");
        }
    }

    if !outcome.safe {
        let reason = outcome
            .reason
            .unwrap_or_else(|| "dry-run rejected".to_string());
        warn!(%key, %reason, "batch rejected by dry-run validation");
        mark_all(
            &store,
            &notifications,
            NotificationStatus::ManualSyncRequired,
        )
        .await;
        // Exactly one external alert for the whole batch.
        events.publish(SyncEvent::BatchRejected { key, reason });
        return;
    }

    mark_all(&store, &notifications, NotificationStatus::ReadyForTransfer).await;

    match dispatcher
        .dispatch_batch(
            &key,
            &notifications,
            &representative.remote_path,
            &representative.local_path,
        )
        .await
    {
        Ok(job_id) => {
            info!(%key, %job_id, count = notifications.len(), "batch dispatched");
            events.publish(SyncEvent::BatchDispatched { key, job_id });
        }
        Err(err) => {
            error!(%key, "batch dispatch failed: {err}");
            mark_all(
                &store,
                &notifications,
                NotificationStatus::ManualSyncRequired,
            )
            .await;
            events.publish(SyncEvent::BatchRejected {
                key,
                reason: format!("dispatch failed: {err}"),
            });
        }
    }
}

async fn mark_all(
    store: &Arc<dyn RecordStore>,
    notifications: &[NotificationId],
    status: NotificationStatus,
) {
    for id in notifications {
        if let Err(err) = store.set_notification_status(*id, status).await {
            warn!(notification_id = %id, "failed to update notification status: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryRecordStore;
    use crate::types::{DryRunOutcome, SyncNotification};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct StubValidator {
        calls: AtomicUsize,
        outcome: DryRunOutcome,
    }

    impl StubValidator {
        fn safe() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: DryRunOutcome {
                    safe: true,
                    reason: None,
                    deleted_count: 0,
                    incoming_count: 3,
                    remote_file_count: 10,
                    local_file_count: 7,
                },
            }
        }

        fn unsafe_with_reason(reason: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: DryRunOutcome::rejected(reason),
            }
        }
    }

    #[async_trait]
    impl SafetyValidator for StubValidator {
        async fn validate(&self, _source: &str, _destination: &Path) -> DryRunOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct StubDispatcher {
        dispatched: AsyncMutex<Vec<(BatchKey, Vec<NotificationId>)>>,
    }

    #[async_trait]
    impl BatchDispatcher for StubDispatcher {
        async fn dispatch_batch(
            &self,
            key: &BatchKey,
            notifications: &[NotificationId],
            _source: &str,
            _destination: &str,
        ) -> Result<JobId> {
            self.dispatched
                .lock()
                .await
                .push((key.clone(), notifications.to_vec()));
            Ok(JobId::new())
        }
    }

    async fn seed_notification(store: &InMemoryRecordStore, key: &BatchKey) -> NotificationId {
        let mut notification = SyncNotification::new(
            NotificationId::new(),
            format!("tv/{}/Season {:02}", key.series, key.season),
            format!("/library/tv/{}/Season {:02}", key.series, key.season),
        );
        notification.batch_key = Some(key.clone());
        store
            .create_notification(&notification)
            .await
            .expect("create notification");
        notification.id
    }

    fn scheduler(
        store: Arc<InMemoryRecordStore>,
        validator: Arc<StubValidator>,
        dispatcher: Arc<StubDispatcher>,
        events: EventBus,
    ) -> AutoSyncScheduler {
        AutoSyncScheduler::new(
            AutoSyncConfig {
                wait_time_secs: 60,
                max_wait_time_secs: 900,
            },
            store,
            validator,
            dispatcher,
            events,
        )
    }

    #[test]
    fn extension_is_capped_from_batch_creation() {
        let created = Instant::now();
        let wait = Duration::from_secs(60);
        let max_wait = Duration::from_secs(900);

        // Second event at t=30 pushes the deadline to t=90.
        let deadline = extended_deadline(created, created + Duration::from_secs(30), wait, max_wait);
        assert_eq!(deadline, created + Duration::from_secs(90));

        // An event at t=870 would push to t=930, but the cap holds it at 900.
        let deadline =
            extended_deadline(created, created + Duration::from_secs(870), wait, max_wait);
        assert_eq!(deadline, created + Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_yields_one_validation_and_one_dispatch() {
        let store = Arc::new(InMemoryRecordStore::new());
        let validator = Arc::new(StubValidator::safe());
        let dispatcher = Arc::new(StubDispatcher::default());
        let scheduler = scheduler(
            Arc::clone(&store),
            Arc::clone(&validator),
            Arc::clone(&dispatcher),
            EventBus::default(),
        );

        let key = BatchKey::new("ShowX", 2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = seed_notification(&store, &key).await;
            scheduler.schedule(id, key.clone()).await.expect("schedule");
            ids.push(id);
        }
        assert_eq!(scheduler.active_batches().await, 1);

        // Let the (extended) window elapse.
        tokio::time::sleep(Duration::from_secs(130)).await;

        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        let dispatched = dispatcher.dispatched.lock().await;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].1, ids);
        assert_eq!(scheduler.active_batches().await, 0);

        for id in &ids {
            let notification = store
                .get_notification(*id)
                .await
                .expect("get")
                .expect("some");
            assert_eq!(notification.status, NotificationStatus::ReadyForTransfer);
            assert!(notification.dry_run.as_ref().is_some_and(|o| o.safe));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_batch_independently() {
        let store = Arc::new(InMemoryRecordStore::new());
        let validator = Arc::new(StubValidator::safe());
        let dispatcher = Arc::new(StubDispatcher::default());
        let scheduler = scheduler(
            Arc::clone(&store),
            Arc::clone(&validator),
            Arc::clone(&dispatcher),
            EventBus::default(),
        );

        let key_a = BatchKey::new("ShowX", 1);
        let key_b = BatchKey::new("ShowX", 2);
        let id_a = seed_notification(&store, &key_a).await;
        let id_b = seed_notification(&store, &key_b).await;
        scheduler.schedule(id_a, key_a).await.expect("schedule");
        scheduler.schedule(id_b, key_b).await.expect("schedule");
        assert_eq!(scheduler.active_batches().await, 2);

        tokio::time::sleep(Duration::from_secs(70)).await;

        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.dispatched.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_marks_manual_and_raises_one_alert() {
        let store = Arc::new(InMemoryRecordStore::new());
        let validator = Arc::new(StubValidator::unsafe_with_reason(
            "deleted exceeds incoming (5 > 2)",
        ));
        let dispatcher = Arc::new(StubDispatcher::default());
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let scheduler = scheduler(
            Arc::clone(&store),
            Arc::clone(&validator),
            Arc::clone(&dispatcher),
            events,
        );

        let key = BatchKey::new("ShowY", 3);
        let ids = vec![
            seed_notification(&store, &key).await,
            seed_notification(&store, &key).await,
        ];
        for id in &ids {
            scheduler.schedule(*id, key.clone()).await.expect("schedule");
        }

        tokio::time::sleep(Duration::from_secs(130)).await;

        assert!(dispatcher.dispatched.lock().await.is_empty());
        for id in &ids {
            let notification = store
                .get_notification(*id)
                .await
                .expect("get")
                .expect("some");
            assert_eq!(
                notification.status,
                NotificationStatus::ManualSyncRequired
            );
        }

        // Exactly one alert for the whole batch.
        let mut rejections = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::BatchRejected { .. }) {
                rejections += 1;
            }
        }
        assert_eq!(rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_event_after_dispatch_opens_a_fresh_batch() {
        let store = Arc::new(InMemoryRecordStore::new());
        let validator = Arc::new(StubValidator::safe());
        let dispatcher = Arc::new(StubDispatcher::default());
        let scheduler = scheduler(
            Arc::clone(&store),
            Arc::clone(&validator),
            Arc::clone(&dispatcher),
            EventBus::default(),
        );

        let key = BatchKey::new("ShowZ", 1);
        let first = seed_notification(&store, &key).await;
        scheduler.schedule(first, key.clone()).await.expect("schedule");
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(dispatcher.dispatched.lock().await.len(), 1);

        let second = seed_notification(&store, &key).await;
        scheduler
            .schedule(second, key.clone())
            .await
            .expect("schedule");
        assert_eq!(scheduler.active_batches().await, 1);
        tokio::time::sleep(Duration::from_secs(70)).await;

        let dispatched = dispatcher.dispatched.lock().await;
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[1].1, vec![second]);
    }
}
