//! Admission-control queue for sync jobs.
//!
//! The ledger answers one question: who may run against which destination.
//! It lives entirely in memory behind one mutex and is rebuilt from durable
//! records at startup; the record store plays no role in live admission
//! decisions.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::JobId;

/// Why a queued job is waiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueReason {
    /// Waiting for any concurrency slot.
    Slot,
    /// Waiting specifically for its destination to be released.
    Path,
}

/// Result of an admission request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// The job may run immediately; it occupies a slot and its destination.
    Running,
    /// The job waits for a slot; its destination is reserved.
    QueuedSlot,
    /// The job waits for its destination, currently held by another job.
    QueuedPath,
    /// Another job already holds this destination.
    Duplicate { holder: JobId },
}

impl Admission {
    pub fn accepted(&self) -> bool {
        !matches!(self, Admission::Duplicate { .. })
    }
}

/// A job promoted out of the queue by a release.
#[derive(Clone, Debug)]
pub struct Promotion {
    pub job_id: JobId,
    pub destination: String,
}

/// Everything a release did to the queue: at most one promotion, plus any
/// slot-waiters that were re-classified as path-waiters along the way.
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    pub promoted: Option<Promotion>,
    pub converted_to_path_wait: Vec<JobId>,
}

/// Point-in-time view of the ledger.
#[derive(Clone, Debug, Serialize)]
pub struct QueueSnapshot {
    pub max_concurrent: usize,
    pub running_count: usize,
    pub queued_count: usize,
    pub running_ids: Vec<JobId>,
    pub queued_ids: Vec<JobId>,
}

struct QueuedEntry {
    job_id: JobId,
    destination: String,
    reason: QueueReason,
}

#[derive(Default)]
struct LedgerState {
    /// Normalized destination → holder (running or reserved-queued).
    active_destinations: HashMap<String, JobId>,
    /// Running job → its destination.
    running: HashMap<JobId, String>,
    /// Waiting jobs, oldest first.
    queued: Vec<QueuedEntry>,
}

/// Admission ledger guarding destination exclusivity and the concurrency cap.
pub struct QueueManager {
    max_concurrent: usize,
    state: Mutex<LedgerState>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("QueueManager");
        debug.field("max_concurrent", &self.max_concurrent);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("running", &state.running.len())
                    .field("queued", &state.queued.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Normalize a destination for ledger identity: component-wise rebuild (drops
/// `.` segments, resolves `..`, strips trailing separators) plus case folding
/// on case-insensitive filesystems.
pub fn normalize_destination(raw: &str) -> String {
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    let normalized = normalized.to_string_lossy().to_string();
    if cfg!(windows) {
        normalized.to_lowercase()
    } else {
        normalized
    }
}

impl QueueManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Request admission for a job targeting `destination`.
    pub async fn register(&self, job_id: JobId, destination: &str) -> Admission {
        let dest = normalize_destination(destination);
        let mut state = self.state.lock().await;

        if let Some(&holder) = state.active_destinations.get(&dest) {
            if holder != job_id {
                debug!(%job_id, %holder, destination = %dest, "destination collision, rejecting as duplicate");
                return Admission::Duplicate { holder };
            }
        }

        if state.running.len() < self.max_concurrent {
            state.active_destinations.insert(dest.clone(), job_id);
            state.running.insert(job_id, dest);
            Admission::Running
        } else {
            state.active_destinations.insert(dest.clone(), job_id);
            state.queued.push(QueuedEntry {
                job_id,
                destination: dest,
                reason: QueueReason::Slot,
            });
            Admission::QueuedSlot
        }
    }

    /// Re-admission during startup reconciliation. A job that was already
    /// admitted before the restart must not be duplicate-rejected; a
    /// destination collision re-enters the ledger as a path-queued waiter.
    pub async fn readmit(&self, job_id: JobId, destination: &str) -> Admission {
        let dest = normalize_destination(destination);
        let mut state = self.state.lock().await;

        let held_by_other = state
            .active_destinations
            .get(&dest)
            .is_some_and(|holder| *holder != job_id);
        if held_by_other {
            state.queued.push(QueuedEntry {
                job_id,
                destination: dest,
                reason: QueueReason::Path,
            });
            return Admission::QueuedPath;
        }

        if state.running.len() < self.max_concurrent {
            state.active_destinations.insert(dest.clone(), job_id);
            state.running.insert(job_id, dest);
            Admission::Running
        } else {
            state.active_destinations.insert(dest.clone(), job_id);
            state.queued.push(QueuedEntry {
                job_id,
                destination: dest,
                reason: QueueReason::Slot,
            });
            Admission::QueuedSlot
        }
    }

    /// Restore a job that is verifiably still running from before a restart.
    /// Bypasses the concurrency cap (the process already exists) and takes
    /// over the destination reservation if a queued record reserved it first.
    pub async fn restore_running(&self, job_id: JobId, destination: &str) {
        let dest = normalize_destination(destination);
        let mut state = self.state.lock().await;
        if let Some(previous) = state.active_destinations.insert(dest.clone(), job_id) {
            if previous != job_id {
                warn!(%job_id, %previous, destination = %dest, "running job takes over destination reservation at recovery");
            }
        }
        state.running.insert(job_id, dest);
    }

    /// Release a job (running or queued) and run the two promotion phases.
    /// At most one job is promoted per call.
    pub async fn unregister(&self, job_id: JobId) -> ReleaseOutcome {
        let mut state = self.state.lock().await;
        let mut outcome = ReleaseOutcome::default();

        let freed_dest = if let Some(dest) = state.running.remove(&job_id) {
            Some(dest)
        } else if let Some(pos) = state.queued.iter().position(|e| e.job_id == job_id) {
            Some(state.queued.remove(pos).destination)
        } else {
            None
        };

        let Some(freed_dest) = freed_dest else {
            return outcome;
        };
        if state.active_destinations.get(&freed_dest) == Some(&job_id) {
            state.active_destinations.remove(&freed_dest);
        }

        if state.running.len() >= self.max_concurrent {
            return outcome;
        }

        // Phase (a): the freed destination's oldest path-queued waiter wins
        // over any slot-queued job, regardless of age.
        if let Some(pos) = state
            .queued
            .iter()
            .position(|e| e.reason == QueueReason::Path && e.destination == freed_dest)
        {
            outcome.promoted = Some(promote_at(&mut state, pos));
            return outcome;
        }

        // Phase (b): oldest queued job whose destination is available. A
        // slot-waiter whose destination is meanwhile held by someone else is
        // re-classified as a path-waiter instead of being promoted into a
        // duplicate rejection.
        let mut idx = 0;
        while idx < state.queued.len() {
            let entry = &state.queued[idx];
            let held_by_other = state
                .active_destinations
                .get(&entry.destination)
                .is_some_and(|holder| *holder != entry.job_id);
            if held_by_other {
                if entry.reason == QueueReason::Slot {
                    let job_id = entry.job_id;
                    state.queued[idx].reason = QueueReason::Path;
                    debug!(%job_id, "slot-waiter re-classified as path-waiter");
                    outcome.converted_to_path_wait.push(job_id);
                }
                idx += 1;
            } else {
                outcome.promoted = Some(promote_at(&mut state, idx));
                return outcome;
            }
        }

        outcome
    }

    /// Whether the job currently sits in the wait queue.
    pub async fn is_queued(&self, job_id: JobId) -> bool {
        let state = self.state.lock().await;
        state.queued.iter().any(|e| e.job_id == job_id)
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            max_concurrent: self.max_concurrent,
            running_count: state.running.len(),
            queued_count: state.queued.len(),
            running_ids: state.running.keys().copied().collect(),
            queued_ids: state.queued.iter().map(|e| e.job_id).collect(),
        }
    }
}

fn promote_at(state: &mut LedgerState, idx: usize) -> Promotion {
    let entry = state.queued.remove(idx);
    state
        .active_destinations
        .insert(entry.destination.clone(), entry.job_id);
    state.running.insert(entry.job_id, entry.destination.clone());
    Promotion {
        job_id: entry.job_id,
        destination: entry.destination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_job_runs_and_same_destination_is_duplicate() {
        let queue = QueueManager::new(3);
        let a = JobId::new();
        let b = JobId::new();

        assert_eq!(queue.register(a, "/library/x").await, Admission::Running);
        assert_eq!(
            queue.register(b, "/library/x").await,
            Admission::Duplicate { holder: a }
        );
    }

    #[tokio::test]
    async fn normalization_catches_trailing_separator_collisions() {
        let queue = QueueManager::new(3);
        let a = JobId::new();
        let b = JobId::new();

        assert_eq!(queue.register(a, "/library/x/").await, Admission::Running);
        assert_eq!(
            queue.register(b, "/library/./x").await,
            Admission::Duplicate { holder: a }
        );
    }

    #[tokio::test]
    async fn full_queue_waits_for_slot_and_release_promotes_oldest() {
        let queue = QueueManager::new(3);
        let (a, b, c, d) = (JobId::new(), JobId::new(), JobId::new(), JobId::new());

        assert_eq!(queue.register(a, "/a").await, Admission::Running);
        assert_eq!(queue.register(b, "/b").await, Admission::Running);
        assert_eq!(queue.register(c, "/c").await, Admission::Running);
        assert_eq!(queue.register(d, "/y").await, Admission::QueuedSlot);

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.running_count, 3);
        assert_eq!(snapshot.queued_count, 1);

        let outcome = queue.unregister(a).await;
        let promoted = outcome.promoted.expect("a waiter should be promoted");
        assert_eq!(promoted.job_id, d);

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.running_count, 3);
        assert_eq!(snapshot.queued_count, 0);
        assert!(snapshot.running_ids.contains(&d));
    }

    #[tokio::test]
    async fn running_count_never_exceeds_cap() {
        let queue = QueueManager::new(2);
        for i in 0..5 {
            let admission = queue.register(JobId::new(), &format!("/dest/{i}")).await;
            let snapshot = queue.snapshot().await;
            assert!(snapshot.running_count <= 2, "cap violated: {admission:?}");
        }
        assert_eq!(queue.snapshot().await.queued_count, 3);
    }

    #[tokio::test]
    async fn queued_job_reserves_destination_against_later_arrivals() {
        let queue = QueueManager::new(1);
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());

        assert_eq!(queue.register(a, "/a").await, Admission::Running);
        assert_eq!(queue.register(b, "/y").await, Admission::QueuedSlot);
        assert_eq!(
            queue.register(c, "/y").await,
            Admission::Duplicate { holder: b }
        );
    }

    #[tokio::test]
    async fn path_waiter_beats_older_slot_waiter_for_its_destination() {
        let queue = QueueManager::new(2);
        let (a, b, slot_waiter, path_waiter) =
            (JobId::new(), JobId::new(), JobId::new(), JobId::new());

        assert_eq!(queue.register(a, "/x").await, Admission::Running);
        assert_eq!(queue.register(b, "/b").await, Admission::Running);
        // Older slot-waiter on its own destination.
        assert_eq!(queue.register(slot_waiter, "/z").await, Admission::QueuedSlot);
        // Younger path-waiter on /x, re-entering through recovery.
        assert_eq!(queue.readmit(path_waiter, "/x").await, Admission::QueuedPath);

        // Freeing /x promotes the path-waiter even though the slot-waiter is
        // older.
        let outcome = queue.unregister(a).await;
        assert_eq!(
            outcome.promoted.expect("promotion expected").job_id,
            path_waiter
        );
        assert!(queue.is_queued(slot_waiter).await);

        // The next release promotes the remaining slot-waiter.
        let outcome = queue.unregister(b).await;
        assert_eq!(
            outcome.promoted.expect("promotion expected").job_id,
            slot_waiter
        );
    }

    #[tokio::test]
    async fn cancelling_queued_job_frees_reservation_without_promotion() {
        let queue = QueueManager::new(1);
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());

        assert_eq!(queue.register(a, "/a").await, Admission::Running);
        assert_eq!(queue.register(b, "/y").await, Admission::QueuedSlot);

        // Cancel the queued job: no slot was freed, so nothing is promoted,
        // but /y becomes available again.
        let outcome = queue.unregister(b).await;
        assert!(outcome.promoted.is_none());
        assert_eq!(queue.register(c, "/y").await, Admission::QueuedSlot);
    }

    #[tokio::test]
    async fn blocked_slot_waiter_is_reclassified_not_falsely_promoted() {
        let queue = QueueManager::new(2);
        let (r1, r2, r3, q) = (JobId::new(), JobId::new(), JobId::new(), JobId::new());

        // Recovery: two running jobs fill the cap, a queued record reserves
        // /y, then a running record for /y takes the reservation over.
        queue.restore_running(r1, "/a").await;
        queue.restore_running(r2, "/b").await;
        assert_eq!(queue.readmit(q, "/y").await, Admission::QueuedSlot);
        queue.restore_running(r3, "/y").await;

        // Freeing capacity reaches q, whose destination is held by r3: it is
        // converted to a path-waiter rather than promoted into a collision.
        let outcome = queue.unregister(r1).await;
        let outcome2 = queue.unregister(r2).await;
        let converted: Vec<_> = outcome
            .converted_to_path_wait
            .iter()
            .chain(outcome2.converted_to_path_wait.iter())
            .copied()
            .collect();
        assert!(converted.contains(&q));
        assert!(outcome2.promoted.is_none());

        // Once /y itself frees, phase (a) promotes q.
        let outcome = queue.unregister(r3).await;
        assert_eq!(outcome.promoted.expect("promotion expected").job_id, q);
    }

    #[tokio::test]
    async fn destination_held_by_at_most_one_job_at_any_instant() {
        let queue = QueueManager::new(2);
        let ids: Vec<JobId> = (0..6).map(|_| JobId::new()).collect();
        let dests = ["/x", "/x", "/y", "/y", "/x", "/z"];

        let mut holders = 0;
        for (id, dest) in ids.iter().zip(dests) {
            if queue.register(*id, dest).await.accepted() {
                holders += 1;
            }
        }
        // /x and /y each admit exactly one holder; /z admits one.
        assert_eq!(holders, 3);
    }
}
