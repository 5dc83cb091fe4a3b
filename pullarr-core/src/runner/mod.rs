//! External sync process supervision.
//!
//! One monitor task per running process: output lines stream into the job log
//! and onto the event bus, the exit code resolves the terminal status, and a
//! per-job watch channel tells the coordinator when to run its completion
//! pipeline. Failures inside a monitor never propagate to the caller; they
//! end up in the job's own log and a failed status.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::{RemoteConfig, RunnerConfig};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::persistence::RecordStore;
use crate::types::{JobId, JobStatus, SyncJob};

pub mod invocation;

/// Receiver side of a job's completion channel; resolves to the terminal
/// status exactly once.
pub type CompletionReceiver = watch::Receiver<Option<JobStatus>>;

struct RunningJob {
    process_id: u32,
    cancelled: Arc<AtomicBool>,
}

/// Spawns, monitors, cancels, and re-adopts external sync processes.
pub struct JobRunner {
    config: RunnerConfig,
    remote: RemoteConfig,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JobRunner");
        debug.field("tool_path", &self.config.tool_path);
        match self.running.try_lock() {
            Ok(running) => {
                debug.field("running", &running.len());
            }
            Err(_) => {
                debug.field("running", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl JobRunner {
    pub fn new(
        config: RunnerConfig,
        remote: RemoteConfig,
        store: Arc<dyn RecordStore>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            remote,
            store,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the external sync process for an admitted job and supervise it.
    ///
    /// Spawn failures (credentials, launch) are terminal for the attempt and
    /// returned to the caller; everything after a successful spawn resolves
    /// through the returned completion channel instead.
    pub async fn start(&self, job: &SyncJob, backup_dir: &Path) -> Result<CompletionReceiver> {
        tokio::fs::create_dir_all(&job.destination).await?;

        let mut command = invocation::sync_command(
            &self.config,
            &self.remote,
            &job.source,
            Path::new(&job.destination),
            backup_dir,
        )?;
        debug!(job_id = %job.id, ?command, "spawning sync process");

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SyncError::Spawn(format!("failed to spawn {}: {e}", self.config.tool_path))
            })?;
        let process_id = child.id().ok_or_else(|| {
            SyncError::Spawn("sync process exited before a pid could be read".to_string())
        })?;

        self.store.mark_job_running(job.id, process_id).await?;
        info!(job_id = %job.id, process_id, destination = %job.destination, "sync started");
        self.events.publish(SyncEvent::JobStarted {
            job_id: job.id,
            process_id,
        });

        let cancelled = Arc::new(AtomicBool::new(false));
        let (completion_tx, completion_rx) = watch::channel::<Option<JobStatus>>(None);
        self.running.lock().await.insert(
            job.id,
            RunningJob {
                process_id,
                cancelled: Arc::clone(&cancelled),
            },
        );

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let job_id = job.id;
        tokio::spawn(async move {
            let status = monitor(child, job_id, store, events, cancelled).await;
            running.lock().await.remove(&job_id);
            let _ = completion_tx.send(Some(status));
        });

        Ok(completion_rx)
    }

    /// Signal a running job's process to terminate. Returns false when no
    /// process is attached (queued jobs are the coordinator's concern).
    ///
    /// The monitor resolves the job to cancelled once the process exits;
    /// escalation guarantees it does.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let handle = {
            let running = self.running.lock().await;
            running
                .get(&job_id)
                .map(|job| (job.process_id, Arc::clone(&job.cancelled)))
        };
        let Some((process_id, cancelled)) = handle else {
            return Ok(false);
        };
        cancelled.store(true, Ordering::SeqCst);
        info!(%job_id, process_id, "cancelling running sync");
        terminate(process_id).await?;
        Ok(true)
    }

    /// Reconcile one durable running job against live OS state after a
    /// restart. Live processes are re-adopted with a liveness-polling
    /// monitor; dead ones become failed with reason "process interrupted".
    pub async fn adopt(&self, job: &SyncJob) -> Result<Option<CompletionReceiver>> {
        let mut live_pid = None;
        if let Some(pid) = job.process_id {
            if process_alive(pid).await {
                live_pid = Some(pid);
            }
        }

        let Some(process_id) = live_pid else {
            warn!(job_id = %job.id, "running job has no live process, marking failed");
            self.store
                .mark_job_finished(job.id, JobStatus::Failed, Some("process interrupted"))
                .await?;
            self.events.publish(SyncEvent::JobFinished {
                job_id: job.id,
                status: JobStatus::Failed,
            });
            return Ok(None);
        };

        info!(job_id = %job.id, process_id, "re-adopting live sync process");
        let cancelled = Arc::new(AtomicBool::new(false));
        let (completion_tx, completion_rx) = watch::channel::<Option<JobStatus>>(None);
        self.running.lock().await.insert(
            job.id,
            RunningJob {
                process_id,
                cancelled: Arc::clone(&cancelled),
            },
        );

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let job_id = job.id;
        tokio::spawn(async move {
            // An adopted process exposes neither its output streams nor its
            // exit code; liveness polling is the only observation left.
            while process_alive(process_id).await {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let status = if cancelled.load(Ordering::SeqCst) {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            };
            let note = "sync process finished while unsupervised; exit status unknown";
            if let Err(err) = store.append_job_log(job_id, note).await {
                warn!(%job_id, "failed to append job log line: {err}");
            }
            if let Err(err) = store.mark_job_finished(job_id, status, None).await {
                error!(%job_id, "failed to persist terminal status: {err}");
            }
            events.publish(SyncEvent::JobFinished { job_id, status });
            running.lock().await.remove(&job_id);
            let _ = completion_tx.send(Some(status));
        });

        Ok(Some(completion_rx))
    }

    /// Validate restartability and reset the durable record; the coordinator
    /// re-admits and relaunches afterwards.
    pub async fn prepare_restart(&self, job: &SyncJob) -> Result<()> {
        if !job.status.is_restartable() {
            return Err(SyncError::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        self.store.reset_job(job.id).await
    }
}

/// Supervise one child process until it exits; returns the terminal status
/// after persisting it. All errors are absorbed into the job's log.
async fn monitor(
    mut child: Child,
    job_id: JobId,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    cancelled: Arc<AtomicBool>,
) -> JobStatus {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);

    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    while let Some(line) = line_rx.recv().await {
        if let Err(err) = store.append_job_log(job_id, &line).await {
            warn!(%job_id, "failed to append job log line: {err}");
        }
        events.publish(SyncEvent::JobProgress { job_id, line });
    }

    let (status, error_msg) = match child.wait().await {
        Ok(_) if cancelled.load(Ordering::SeqCst) => (JobStatus::Cancelled, None),
        Ok(exit) if exit.success() => (JobStatus::Completed, None),
        Ok(exit) => (
            JobStatus::Failed,
            Some(format!("sync process exited with {exit}")),
        ),
        Err(err) => (
            JobStatus::Failed,
            Some(format!("failed to collect sync process exit: {err}")),
        ),
    };

    if let Some(msg) = &error_msg {
        if let Err(err) = store.append_job_log(job_id, msg).await {
            warn!(%job_id, "failed to append job log line: {err}");
        }
    }
    if let Err(err) = store
        .mark_job_finished(job_id, status, error_msg.as_deref())
        .await
    {
        error!(%job_id, "failed to persist terminal status: {err}");
    }
    info!(%job_id, %status, "sync finished");
    events.publish(SyncEvent::JobFinished { job_id, status });
    status
}

/// Process-liveness check by pid.
pub(crate) async fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Terminate a process: TERM first, then escalate to KILL if it is still
/// alive after a short grace window.
async fn terminate(pid: u32) -> Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .await?;
    if !status.success() {
        // Racing a natural exit is not a failure.
        if !process_alive(pid).await {
            return Ok(());
        }
        return Err(SyncError::Internal(format!(
            "kill -TERM {pid} exited with {status}"
        )));
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        if !process_alive(pid).await {
            return Ok(());
        }
        if attempts >= 3 {
            let _ = Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .status()
                .await;
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
