//! MCP host error types.

use thiserror::Error;

/// Errors that can occur while orchestrating MCP client connections.
#[derive(Debug, Error)]
pub enum HostError {
    /// `add` was called with a name that is already registered.
    #[error("client '{name}' already exists")]
    DuplicateName { name: String },

    /// The named connection is unknown or no longer connected.
    #[error("client '{name}' not found or not connected")]
    NotFound { name: String },

    /// The worker process could not be started.
    #[error("failed to spawn worker '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The transport opened but the initialize handshake failed.
    #[error("capability negotiation with '{name}' failed: {reason}")]
    Negotiation { name: String, reason: String },

    /// The worker answered a request with a JSON-RPC error.
    #[error("worker '{name}' returned error [{code}]: {message}")]
    Remote {
        name: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The byte stream broke mid-request (I/O error, EOF, malformed frame).
    #[error("transport error for '{name}': {reason}")]
    Transport { name: String, reason: String },

    /// A request did not complete within its deadline.
    #[error("'{method}' on '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        name: String,
        method: String,
        timeout_ms: u64,
    },

    /// Host configuration could not be loaded or is invalid.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl HostError {
    /// Name of the connection this error refers to, if any.
    pub fn connection_name(&self) -> Option<&str> {
        match self {
            HostError::DuplicateName { name }
            | HostError::NotFound { name }
            | HostError::SpawnFailed { name, .. }
            | HostError::Negotiation { name, .. }
            | HostError::Remote { name, .. }
            | HostError::Transport { name, .. }
            | HostError::Timeout { name, .. } => Some(name),
            HostError::Config { .. } => None,
        }
    }

    /// Whether a fan-out operation absorbs this error for a single
    /// connection instead of failing as a whole.
    ///
    /// Registry misuse (`DuplicateName`, `Config`) is a caller bug and is
    /// never absorbed.
    pub fn is_isolatable(&self) -> bool {
        matches!(
            self,
            HostError::NotFound { .. }
                | HostError::Remote { .. }
                | HostError::Transport { .. }
                | HostError::Timeout { .. }
                | HostError::Negotiation { .. }
                | HostError::SpawnFailed { .. }
        )
    }

    pub(crate) fn transport(name: &str, reason: impl Into<String>) -> Self {
        HostError::Transport {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        HostError::NotFound {
            name: name.to_string(),
        }
    }
}
