//! Shared fixtures for integration tests: a fake sync tool and a config
//! pointing at it, so process supervision is exercised without rsync or a
//! remote host.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pullarr_core::config::{
    AutoSyncConfig, QueueConfig, RemoteConfig, RunnerConfig, SyncConfig, ValidatorConfig,
};
use pullarr_core::persistence::{InMemoryRecordStore, RecordStore};
use pullarr_core::types::{JobId, JobStatus};

/// Write an executable shell script standing in for the sync tool.
pub fn write_fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake tool");
    let mut perms = std::fs::metadata(&path).expect("stat fake tool").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake tool");
    path
}

/// Config wired to a fake tool and a scratch key file.
pub fn test_config(dir: &Path, tool_path: &Path, max_concurrent: usize) -> SyncConfig {
    let key_path = dir.join("id_ed25519");
    std::fs::write(&key_path, "test key material").expect("write key");
    SyncConfig {
        queue: QueueConfig { max_concurrent },
        runner: RunnerConfig {
            tool_path: tool_path.to_string_lossy().into_owned(),
            io_timeout_secs: 30,
            backup_root: dir.join("backups"),
        },
        remote: RemoteConfig {
            host: "seedbox.example".to_string(),
            user: "sync".to_string(),
            port: 22,
            ssh_key_path: key_path,
        },
        auto_sync: AutoSyncConfig {
            wait_time_secs: 1,
            max_wait_time_secs: 5,
        },
        validator: ValidatorConfig::default(),
    }
}

/// Poll the store until the job reaches a terminal status.
pub async fn wait_terminal(store: &Arc<InMemoryRecordStore>, id: JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let job = store
                .get_job(id)
                .await
                .expect("get job")
                .expect("job exists");
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job did not reach a terminal status in time")
}

/// Poll the store until the job reaches the given status.
pub async fn wait_status(store: &Arc<InMemoryRecordStore>, id: JobId, wanted: JobStatus) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let job = store
                .get_job(id)
                .await
                .expect("get job")
                .expect("job exists");
            if job.status == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {wanted}"));
}
