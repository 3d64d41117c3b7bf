//! Caching task datasets before submission.
//!
//! Compute nodes may not have network access, so each task's datasets are
//! downloaded on the submitting host first. A failure here only means the job
//! may have to download the data itself, so it is never fatal.

use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PrefetchConfig;

/// Runs a dataset download command once per task.
#[derive(Debug, Clone, Default)]
pub struct DatasetPrefetcher {
    /// The command line; the task name is appended.
    command: Option<Vec<String>>,
}

impl DatasetPrefetcher {
    /// Creates a prefetcher running the given command line.
    ///
    /// An empty command line disables pre-fetching.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command: (!command.is_empty()).then_some(command),
        }
    }

    /// Creates a prefetcher from configuration.
    pub fn from_config(config: &PrefetchConfig) -> Self {
        Self::new(config.command.clone().unwrap_or_default())
    }

    /// Pre-fetches the datasets of every task.
    ///
    /// Returns the tasks whose datasets failed to download.
    pub async fn prefetch<'a>(&self, tasks: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            debug!("no dataset pre-fetch command is configured");
            return Vec::new();
        };

        let mut failed = Vec::new();
        for task in tasks {
            info!(task, "pre-fetching task datasets");
            let result = Command::new(program).args(args).arg(task).output().await;
            let reason = match result {
                Ok(output) if output.status.success() => continue,
                Ok(output) => format!(
                    "`{program}` failed with {status}: {stderr}",
                    status = output.status,
                    stderr = String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => format!("failed to run `{program}`: {e}"),
            };

            warn!(
                task,
                "failed to pre-fetch datasets; the job will try to download them itself: {reason}"
            );
            failed.push(task.to_string());
        }

        failed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn unconfigured() {
        let failed = DatasetPrefetcher::default().prefetch(["t1"]).await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn runs_per_task() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("tasks");
        let prefetcher = DatasetPrefetcher::new(vec![
            "sh".into(),
            "-c".into(),
            format!(r#"echo "$1" >> '{}'"#, out.display()),
            "prefetch".into(),
        ]);

        let failed = prefetcher.prefetch(["t1", "t2"]).await;
        assert!(failed.is_empty());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "t1\nt2\n");
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let prefetcher = DatasetPrefetcher::new(vec![
            "sh".into(),
            "-c".into(),
            r#"test "$1" != bad"#.into(),
            "prefetch".into(),
        ]);

        assert_eq!(prefetcher.prefetch(["good", "bad"]).await, ["bad"]);
        assert_eq!(
            DatasetPrefetcher::new(vec!["evalsched-test-missing-prefetch".into()])
                .prefetch(["t1"])
                .await,
            ["t1"]
        );
    }
}
