//! Worker → host notifications.
//!
//! Each connection gets at most one dispatcher task. The task drains the
//! transport's notification stream in arrival order and hands each event to
//! a [`NotificationHandler`]. Handlers run on the dispatcher task, so they
//! must return quickly and push any follow-up work (re-fetching a list, for
//! instance) onto another task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::transport::InboundNotification;

/// List-changed events a worker can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ResourceListChanged,
    ToolListChanged,
    PromptListChanged,
}

impl NotificationKind {
    /// Map an MCP notification method to its kind.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "notifications/resources/list_changed" => Some(Self::ResourceListChanged),
            "notifications/tools/list_changed" => Some(Self::ToolListChanged),
            "notifications/prompts/list_changed" => Some(Self::PromptListChanged),
            _ => None,
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            Self::ResourceListChanged => "notifications/resources/list_changed",
            Self::ToolListChanged => "notifications/tools/list_changed",
            Self::PromptListChanged => "notifications/prompts/list_changed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ResourceListChanged => "resource list changed",
            Self::ToolListChanged => "tool list changed",
            Self::PromptListChanged => "prompt list changed",
        };
        f.write_str(label)
    }
}

/// Receives list-changed events for one connection.
///
/// Called on the dispatcher task. Must not block.
pub trait NotificationHandler: Send + Sync {
    fn on_resource_list_changed(&self, connection: &str);

    fn on_tool_list_changed(&self, connection: &str);

    fn on_prompt_list_changed(&self, connection: &str);

    /// Route an event to the matching callback.
    fn dispatch(&self, connection: &str, kind: NotificationKind) {
        match kind {
            NotificationKind::ResourceListChanged => self.on_resource_list_changed(connection),
            NotificationKind::ToolListChanged => self.on_tool_list_changed(connection),
            NotificationKind::PromptListChanged => self.on_prompt_list_changed(connection),
        }
    }
}

/// Logs every event and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl NotificationHandler for LoggingHandler {
    fn on_resource_list_changed(&self, connection: &str) {
        tracing::info!(connection, "resource list changed");
    }

    fn on_tool_list_changed(&self, connection: &str) {
        tracing::info!(connection, "tool list changed");
    }

    fn on_prompt_list_changed(&self, connection: &str) {
        tracing::info!(connection, "prompt list changed");
    }
}

/// Forwards `(connection, kind)` pairs to a channel so the receiver can
/// re-query from its own task.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<(String, NotificationKind)>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, NotificationKind)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, connection: &str, kind: NotificationKind) {
        if self.tx.send((connection.to_string(), kind)).is_err() {
            tracing::debug!(connection, %kind, "notification receiver dropped");
        }
    }
}

impl NotificationHandler for ChannelHandler {
    fn on_resource_list_changed(&self, connection: &str) {
        self.forward(connection, NotificationKind::ResourceListChanged);
    }

    fn on_tool_list_changed(&self, connection: &str) {
        self.forward(connection, NotificationKind::ToolListChanged);
    }

    fn on_prompt_list_changed(&self, connection: &str) {
        self.forward(connection, NotificationKind::PromptListChanged);
    }
}

/// Drain `rx` on a background task, dispatching each known event to
/// `handler`. The task ends when the transport's stream closes.
pub fn spawn_dispatcher(
    connection: String,
    mut rx: mpsc::UnboundedReceiver<InboundNotification>,
    handler: Arc<dyn NotificationHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            match NotificationKind::from_method(&notification.method) {
                Some(kind) => handler.dispatch(&connection, kind),
                None => tracing::debug!(
                    connection = %connection,
                    method = %notification.method,
                    "ignoring unhandled notification"
                ),
            }
        }
        tracing::debug!(connection = %connection, "notification stream ended");
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
