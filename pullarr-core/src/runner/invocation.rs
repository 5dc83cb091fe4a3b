//! Construction of external sync tool invocations.
//!
//! Both the real mirror and the dry-run simulation share one argument base so
//! the simulation predicts exactly what the mirror would do.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::{RemoteConfig, RunnerConfig};
use crate::error::SyncError;
use crate::Result;

/// Credential material checked before any process is spawned. Missing pieces
/// are terminal for the attempt.
#[derive(Clone, Debug)]
pub(crate) struct RemoteCredentials {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
}

pub(crate) fn resolve_credentials(remote: &RemoteConfig) -> Result<RemoteCredentials> {
    if remote.host.trim().is_empty() {
        return Err(SyncError::Credentials(
            "remote host is not configured".to_string(),
        ));
    }
    if remote.user.trim().is_empty() {
        return Err(SyncError::Credentials(
            "remote user is not configured".to_string(),
        ));
    }
    if remote.ssh_key_path.as_os_str().is_empty() {
        return Err(SyncError::Credentials(
            "ssh key path is not configured".to_string(),
        ));
    }
    if !remote.ssh_key_path.is_file() {
        return Err(SyncError::Credentials(format!(
            "ssh key {} does not exist",
            remote.ssh_key_path.display()
        )));
    }
    Ok(RemoteCredentials {
        user: remote.user.clone(),
        host: remote.host.clone(),
        port: remote.port,
        key_path: remote.ssh_key_path.clone(),
    })
}

fn ssh_transport(credentials: &RemoteCredentials) -> String {
    format!(
        "ssh -i {} -p {} -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
        credentials.key_path.display(),
        credentials.port
    )
}

fn remote_source(credentials: &RemoteCredentials, source: &str) -> String {
    // A trailing slash mirrors the directory's contents rather than nesting
    // the directory itself inside the destination.
    let source = source.trim_end_matches('/');
    format!("{}@{}:{}/", credentials.user, credentials.host, source)
}

fn base_args(cmd: &mut Command, io_timeout_secs: u64) {
    cmd.arg("--recursive")
        .arg("--links")
        .arg("--times")
        .arg("--size-only")
        .arg("--partial")
        .arg("--delete")
        .arg("--itemize-changes")
        .arg(format!("--timeout={io_timeout_secs}"));
}

/// Real mirror invocation: deletes locally what the remote no longer has,
/// backing each deleted item into `backup_dir` first.
pub(crate) fn sync_command(
    config: &RunnerConfig,
    remote: &RemoteConfig,
    source: &str,
    destination: &Path,
    backup_dir: &Path,
) -> Result<Command> {
    let credentials = resolve_credentials(remote)?;
    let mut cmd = Command::new(&config.tool_path);
    base_args(&mut cmd, config.io_timeout_secs);
    cmd.arg("--backup")
        .arg(format!("--backup-dir={}", backup_dir.display()))
        .arg("-e")
        .arg(ssh_transport(&credentials))
        .arg(remote_source(&credentials, source))
        .arg(destination);
    Ok(cmd)
}

/// Non-mutating simulation of the same mirror, with per-file itemization and
/// the stats summary the validator reads the remote file count from.
pub(crate) fn dry_run_command(
    tool_path: &str,
    io_timeout_secs: u64,
    remote: &RemoteConfig,
    source: &str,
    destination: &Path,
) -> Result<Command> {
    let credentials = resolve_credentials(remote)?;
    let mut cmd = Command::new(tool_path);
    base_args(&mut cmd, io_timeout_secs);
    cmd.arg("--dry-run")
        .arg("--stats")
        .arg("-e")
        .arg(ssh_transport(&credentials))
        .arg(remote_source(&credentials, source))
        .arg(destination);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_with_key(key_path: PathBuf) -> RemoteConfig {
        RemoteConfig {
            host: "seedbox.example".to_string(),
            user: "sync".to_string(),
            port: 2222,
            ssh_key_path: key_path,
        }
    }

    #[test]
    fn missing_host_is_a_credentials_error() {
        let remote = RemoteConfig::default();
        match resolve_credentials(&remote) {
            Err(SyncError::Credentials(msg)) => assert!(msg.contains("host")),
            other => panic!("expected credentials error, got {other:?}"),
        }
    }

    #[test]
    fn missing_key_file_is_a_credentials_error() {
        let remote = remote_with_key(PathBuf::from("/nonexistent/id_ed25519"));
        match resolve_credentials(&remote) {
            Err(SyncError::Credentials(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("expected credentials error, got {other:?}"),
        }
    }

    #[test]
    fn remote_source_mirrors_directory_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "key material").expect("write key");
        let credentials =
            resolve_credentials(&remote_with_key(key)).expect("credentials resolve");
        assert_eq!(
            remote_source(&credentials, "tv/Show/Season 01"),
            "sync@seedbox.example:tv/Show/Season 01/"
        );
    }
}
