use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{BatchKey, JobId, JobStatus};

/// Events published on the progress/completion broadcast bus.
///
/// Consumers (WebSocket fan-out, chat notifiers) subscribe independently;
/// there is no delivery guarantee and publishing never blocks.
#[derive(Clone, Debug, Serialize)]
pub enum SyncEvent {
    JobQueued {
        job_id: JobId,
        /// True when the job waits for its destination path rather than a
        /// concurrency slot.
        path_wait: bool,
    },
    JobStarted {
        job_id: JobId,
        process_id: u32,
    },
    JobProgress {
        job_id: JobId,
        line: String,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
    },
    JobPromoted {
        job_id: JobId,
    },
    JobRejected {
        job_id: JobId,
        holder: JobId,
    },
    BatchScheduled {
        key: BatchKey,
        pending: usize,
    },
    BatchExtended {
        key: BatchKey,
        pending: usize,
    },
    BatchDispatched {
        key: BatchKey,
        job_id: JobId,
    },
    /// The single external alert raised for a rejected batch.
    BatchRejected {
        key: BatchKey,
        reason: String,
    },
}

/// Fire-and-forget broadcast bus. Slow receivers lag and drop; nothing is
/// awaited on the publishing side.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::default();
        bus.publish(SyncEvent::JobPromoted { job_id: JobId::new() });
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        bus.publish(SyncEvent::JobStarted {
            job_id,
            process_id: 42,
        });
        match rx.recv().await.expect("event should arrive") {
            SyncEvent::JobStarted {
                job_id: got,
                process_id,
            } => {
                assert_eq!(got, job_id);
                assert_eq!(process_id, 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
