//! Pre-flight dry-run safety validation.
//!
//! The sole gate between an automated trigger and a destructive mirror: the
//! external tool simulates the sync, and the judgment below refuses any plan
//! that looks like a regressed remote library (empty or partial folder,
//! failed remote write) about to mass-delete local media. Anything that
//! prevents the simulation from completing is unsafe by default.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{RemoteConfig, RunnerConfig, ValidatorConfig};
use crate::media::is_media_file;
use crate::runner::invocation;
use crate::types::DryRunOutcome;

/// Seam through which the scheduler asks whether a sync is safe to trigger.
#[async_trait]
pub trait SafetyValidator: Send + Sync {
    async fn validate(&self, source: &str, destination: &Path) -> DryRunOutcome;
}

/// Parsed itemization of a simulated mirror, restricted to media files.
#[derive(Clone, Debug, Default)]
pub struct ItemizedPlan {
    pub deleted: Vec<String>,
    pub incoming: Vec<String>,
    /// Total file count the tool reported for the remote side, when present.
    pub remote_file_count: Option<u64>,
}

/// Stateless dry-run validator.
pub struct DryRunValidator {
    tool_path: String,
    io_timeout_secs: u64,
    remote: RemoteConfig,
    config: ValidatorConfig,
}

impl fmt::Debug for DryRunValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DryRunValidator")
            .field("tool_path", &self.tool_path)
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

impl DryRunValidator {
    pub fn new(runner: &RunnerConfig, remote: RemoteConfig, config: ValidatorConfig) -> Self {
        Self {
            tool_path: runner.tool_path.clone(),
            io_timeout_secs: runner.io_timeout_secs,
            remote,
            config,
        }
    }

    /// Simulate the mirror of `source` onto `destination` and judge safety.
    ///
    /// Never returns an error: execution failures and timeouts resolve to an
    /// unsafe outcome (fail-closed) with the cause as the reason.
    pub async fn validate(&self, source: &str, destination: &Path) -> DryRunOutcome {
        let command = invocation::dry_run_command(
            &self.tool_path,
            self.io_timeout_secs,
            &self.remote,
            source,
            destination,
        );
        let mut command = match command {
            Ok(command) => command,
            Err(err) => {
                warn!(source, "dry-run could not be constructed: {err}");
                return DryRunOutcome::rejected(format!("dry-run could not start: {err}"));
            }
        };

        let output = match timeout(self.config.timeout(), command.output()).await {
            Err(_) => {
                warn!(source, "dry-run timed out");
                return DryRunOutcome::rejected(format!(
                    "dry-run timed out after {}s",
                    self.config.timeout_secs
                ));
            }
            Ok(Err(err)) => {
                warn!(source, "dry-run failed to execute: {err}");
                return DryRunOutcome::rejected(format!("dry-run failed to execute: {err}"));
            }
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(source, status = %output.status, "dry-run exited abnormally");
            return DryRunOutcome::rejected(format!(
                "dry-run exited with {}: {}",
                output.status,
                stderr.lines().next().unwrap_or("")
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let plan = parse_itemized(&stdout, &self.config.media_extensions);

        // The destination walk is ground truth; the simulation is not trusted
        // for the local side.
        let local_file_count =
            match count_local_media(destination, &self.config.media_extensions).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(destination = %destination.display(), "failed to inspect destination: {err}");
                    return DryRunOutcome::rejected(format!(
                        "failed to inspect destination: {err}"
                    ));
                }
            };

        let outcome = judge(&plan, local_file_count);
        debug!(
            source,
            safe = outcome.safe,
            deleted = outcome.deleted_count,
            incoming = outcome.incoming_count,
            "dry-run judged"
        );
        outcome
    }
}

#[async_trait]
impl SafetyValidator for DryRunValidator {
    async fn validate(&self, source: &str, destination: &Path) -> DryRunOutcome {
        DryRunValidator::validate(self, source, destination).await
    }
}

/// Parse `--itemize-changes --stats` output, keeping only media files.
pub fn parse_itemized(output: &str, extensions: &[String]) -> ItemizedPlan {
    let mut plan = ItemizedPlan::default();
    for line in output.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("*deleting") {
            let path = rest.trim();
            if is_media_file(Path::new(path), extensions) {
                plan.deleted.push(path.to_string());
            }
        } else if line.starts_with(">f") {
            // A received regular file: ">f+++++++++ tv/show/ep.mkv".
            if let Some((_, path)) = line.split_once(char::is_whitespace) {
                let path = path.trim();
                if is_media_file(Path::new(path), extensions) {
                    plan.incoming.push(path.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("Number of files:") {
            // "Number of files: 1,205 (reg: 1,110, dir: 95)"
            let digits: String = rest
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == ',')
                .filter(char::is_ascii_digit)
                .collect();
            plan.remote_file_count = digits.parse().ok();
        }
    }
    plan
}

/// Apply both safety rules. The reason names every violated check.
pub fn judge(plan: &ItemizedPlan, local_file_count: u64) -> DryRunOutcome {
    let remote_file_count = plan.remote_file_count.unwrap_or(0);
    let mut violations = Vec::new();

    if remote_file_count > 0 && local_file_count > 0 && remote_file_count < local_file_count {
        violations.push(format!(
            "remote file count {remote_file_count} is below local media count {local_file_count}"
        ));
    }
    if plan.deleted.len() > plan.incoming.len() {
        violations.push(format!(
            "deleted exceeds incoming ({} > {})",
            plan.deleted.len(),
            plan.incoming.len()
        ));
    }

    DryRunOutcome {
        safe: violations.is_empty(),
        reason: if violations.is_empty() {
            None
        } else {
            Some(violations.join("; "))
        },
        deleted_count: plan.deleted.len(),
        incoming_count: plan.incoming.len(),
        remote_file_count,
        local_file_count,
    }
}

/// Count media files under `root`. A missing destination counts as empty;
/// the mirror will create it.
async fn count_local_media(root: &Path, extensions: &[String]) -> Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut count = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if is_media_file(&entry.path(), extensions) {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::default_media_file_extensions_vec;

    fn plan(deleted: usize, incoming: usize, remote: u64) -> ItemizedPlan {
        ItemizedPlan {
            deleted: (0..deleted).map(|i| format!("del{i}.mkv")).collect(),
            incoming: (0..incoming).map(|i| format!("in{i}.mkv")).collect(),
            remote_file_count: Some(remote),
        }
    }

    #[test]
    fn parses_itemized_output_with_stats() {
        let output = "\
receiving incremental file list
*deleting   tv/Show/Season 02/old-episode.mkv
*deleting   tv/Show/Season 02/sample.txt
>f+++++++++ tv/Show/Season 02/Show.S02E05.mkv
>f.st...... tv/Show/Season 02/Show.S02E06.mkv
cd+++++++++ tv/Show/Season 02/
>f+++++++++ tv/Show/Season 02/episode.nfo

Number of files: 1,205 (reg: 1,110, dir: 95)
Number of created files: 2
Total file size: 10,737,418,240 bytes
";
        let extensions = default_media_file_extensions_vec();
        let plan = parse_itemized(output, &extensions);
        // Non-media lines (sample.txt, episode.nfo, the directory) are ignored.
        assert_eq!(plan.deleted, vec!["tv/Show/Season 02/old-episode.mkv"]);
        assert_eq!(plan.incoming.len(), 2);
        assert_eq!(plan.remote_file_count, Some(1205));
    }

    #[test]
    fn deletions_exceeding_incoming_are_unsafe_regardless_of_counts() {
        // Remote has more files than local, so the count rule passes, but the
        // plan still deletes more than it brings in.
        let outcome = judge(&plan(5, 2, 10), 8);
        assert!(!outcome.safe);
        let reason = outcome.reason.expect("reason expected");
        assert!(reason.contains("deleted exceeds incoming"));
        assert_eq!(outcome.deleted_count, 5);
        assert_eq!(outcome.incoming_count, 2);
        assert_eq!(outcome.remote_file_count, 10);
        assert_eq!(outcome.local_file_count, 8);
    }

    #[test]
    fn regressed_remote_library_is_unsafe() {
        let outcome = judge(&plan(0, 1, 3), 120);
        assert!(!outcome.safe);
        assert!(
            outcome
                .reason
                .expect("reason expected")
                .contains("below local media count")
        );
    }

    #[test]
    fn both_violations_are_named_together() {
        let outcome = judge(&plan(4, 1, 2), 50);
        let reason = outcome.reason.expect("reason expected");
        assert!(reason.contains("below local media count"));
        assert!(reason.contains("deleted exceeds incoming"));
    }

    #[test]
    fn count_rule_only_applies_when_both_sides_are_nonzero() {
        // Fresh destination: local count is zero, nothing to protect yet.
        let outcome = judge(&plan(0, 10, 10), 0);
        assert!(outcome.safe);
        // Tool reported no stats line: remote count unknown, fall back to the
        // deletion rule alone.
        let mut no_stats = plan(1, 3, 0);
        no_stats.remote_file_count = None;
        let outcome = judge(&no_stats, 40);
        assert!(outcome.safe);
    }

    #[test]
    fn balanced_plan_is_safe() {
        let outcome = judge(&plan(2, 2, 100), 90);
        assert!(outcome.safe);
        assert!(outcome.reason.is_none());
    }

    #[tokio::test]
    async fn local_media_count_walks_nested_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let season = dir.path().join("Season 01");
        std::fs::create_dir_all(&season).expect("mkdir");
        std::fs::write(season.join("e1.mkv"), b"x").expect("write");
        std::fs::write(season.join("e2.mp4"), b"x").expect("write");
        std::fs::write(season.join("notes.txt"), b"x").expect("write");
        std::fs::write(dir.path().join("poster.jpg"), b"x").expect("write");

        let extensions = default_media_file_extensions_vec();
        let count = count_local_media(dir.path(), &extensions)
            .await
            .expect("walk");
        assert_eq!(count, 2);

        let missing = dir.path().join("does-not-exist");
        assert_eq!(
            count_local_media(&missing, &extensions).await.expect("walk"),
            0
        );
    }
}
