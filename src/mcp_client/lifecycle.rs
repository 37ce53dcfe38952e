//! Worker process lifecycle.
//!
//! Spawning a worker as an OS process wired over stdio, and the
//! failure-isolating shutdown fan-out used by `close_all`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};

use super::errors::HostError;
use super::transport::{StdioTransport, Transport, TransportConnector};
use super::types::ConnectionConfig;

/// Longest stderr line forwarded to the log.
const MAX_STDERR_LINE: usize = 2000;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Launches workers as child processes and talks to them over stdio.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    shutdown_timeout: Duration,
}

impl ProcessConnector {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self { shutdown_timeout }
    }
}

#[async_trait]
impl TransportConnector for ProcessConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, HostError> {
        let name = config.name.as_str();

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        // Merged over the inherited environment.
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| HostError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| HostError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| HostError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name.to_string(), stderr));
        }

        tracing::info!(
            connection = name,
            command = %config.command,
            pid = ?child.id(),
            "worker spawned"
        );

        let transport =
            StdioTransport::new(name, stdout, stdin).with_child(child, self.shutdown_timeout);
        Ok(Box::new(transport))
    }
}

/// Forward a worker's stderr to the debug log, line by line, until it closes.
async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                if line.len() > MAX_STDERR_LINE {
                    let mut cut = MAX_STDERR_LINE;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("...(truncated)");
                }
                tracing::debug!(connection = %name, stderr = %line, "worker stderr");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(connection = %name, error = %e, "worker stderr unreadable");
                break;
            }
        }
    }
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

/// Outcome of closing several connections at once.
#[derive(Debug, Default, Serialize)]
pub struct CloseReport {
    /// Connections that closed cleanly.
    pub closed: Vec<String>,
    /// Connections whose close failed, with the error.
    #[serde(serialize_with = "serialize_failures")]
    pub failed: Vec<(String, HostError)>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.closed.len() + self.failed.len()
    }
}

fn serialize_failures<S>(failed: &[(String, HostError)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(failed.len()))?;
    for (name, err) in failed {
        map.serialize_entry(name, &err.to_string())?;
    }
    map.end()
}

/// Run `close_one` for every name concurrently and collect a report.
///
/// Every close runs to completion regardless of how its siblings fare; a
/// failure is recorded against its name and never aborts the rest.
pub(crate) async fn close_isolated<F, Fut>(names: Vec<String>, close_one: F) -> CloseReport
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = (String, Result<(), HostError>)>,
{
    let outcomes = join_all(names.into_iter().map(close_one)).await;

    let mut report = CloseReport::default();
    for (name, result) in outcomes {
        match result {
            Ok(()) => report.closed.push(name),
            Err(e) => {
                tracing::warn!(connection = %name, error = %e, "close failed");
                report.failed.push((name, e));
            }
        }
    }
    report.closed.sort();
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));
    report
}

// ─── Tests ───────────────────────────────────────────────────────────────────
