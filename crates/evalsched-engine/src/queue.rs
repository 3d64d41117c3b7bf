//! Reading the caller's current load on the batch scheduler.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::config::QueueConfig;

/// A point-in-time count of the caller's pending and running queue entries.
///
/// Snapshots are never cached; take one as late as possible before deciding
/// whether to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    /// The number of occupied queue entries.
    pub occupied: u64,
}

/// Queries the batch scheduler for the caller's queue load.
///
/// The query is a shell command line whose output is a single integer. Any
/// failure to run it, or to parse its output, is treated as an empty queue.
#[derive(Debug, Clone)]
pub struct QueueMonitor {
    /// The shell command line to run.
    command: String,
}

impl QueueMonitor {
    /// Creates a queue monitor running the given shell command line.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Creates a queue monitor from configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.command.clone())
    }

    /// Takes a snapshot of the current queue load.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match whoami::username() {
            Ok(user) => {
                command.env("USER", user);
            }
            Err(e) => warn!("failed to determine the current user name: {e}"),
        }

        debug!(command = self.command, "querying queue load");
        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    command = self.command,
                    "failed to run queue query; assuming the queue is empty: {e}"
                );
                return QueueSnapshot::default();
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(
                command = self.command,
                "queue query reported: {stderr}",
                stderr = stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_occupied(&stdout) {
            Some(occupied) => {
                debug!(occupied, "read queue load");
                QueueSnapshot { occupied }
            }
            None => {
                warn!(
                    command = self.command,
                    "could not parse queue query output `{stdout}`; assuming the queue is empty",
                    stdout = stdout.trim()
                );
                QueueSnapshot::default()
            }
        }
    }
}

/// Parses the occupied count from query output.
fn parse_occupied(output: &str) -> Option<u64> {
    output.trim().parse().ok()
}
