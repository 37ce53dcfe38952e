//! mcp-host: orchestrates named MCP worker processes over stdio.
//!
//! The core lives in [`mcp_client`]: a registry of connections, per-worker
//! operations, failure-isolating fan-out, notification dispatch and
//! concurrent shutdown. This crate root only adds logging setup shared by
//! the `mcp-host` binary.

pub mod mcp_client;

use std::path::Path;

pub use mcp_client::{HostError, HostSettings, McpHost};

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "mcp_host=info,warn";

/// Rotated log files kept next to the active one.
const LOG_FILES_KEPT: u32 = 3;

/// Initialize the tracing subscriber.
///
/// Logs go to stderr (stdout is reserved for command output) unless
/// `log_file` is given, in which case existing logs are rotated and a fresh
/// file is opened with a line-flushing writer. `json` switches to one JSON
/// object per line.
pub fn init_tracing(json: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let writer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, LOG_FILES_KEPT);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(FlushingWriter::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_file.is_none())
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log_file = ?log_file.map(|p| p.display().to_string()),
        "mcp-host starting"
    );
    Ok(())
}

/// Rotate log files: `host.log` → `host.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so log lines survive a
/// crash or a kill from the supervising process.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_log_file_shifts_chain() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("host.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(tmp.path().join("host.log.1"), "older").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let one = std::fs::read_to_string(tmp.path().join("host.log.1")).unwrap();
        let two = std::fs::read_to_string(tmp.path().join("host.log.2")).unwrap();
        assert_eq!(one, "current");
        assert_eq!(two, "older");
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("host.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
