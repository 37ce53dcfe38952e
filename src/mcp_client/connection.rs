//! One worker session.
//!
//! A [`Connection`] owns its transport exclusively, performs the initialize
//! handshake, and moves forward through
//! `Connecting → Connected → Closing → Closed | Failed`. No state is ever
//! revisited.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::errors::HostError;
use super::notifications::{spawn_dispatcher, NotificationHandler};
use super::transport::{extract_result, Transport};
use super::types::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, ConnectionConfig,
    InitializeParams, InitializeResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    Resource, ServerCapabilities, ServerInfo, Tool, PROTOCOL_VERSION,
};

/// Upper bound on cursor pages followed for one listing.
const MAX_LIST_PAGES: usize = 64;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
    /// Terminal; carries the recorded error.
    Failed(String),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    fn can_move_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed(_))
                | (Connected, Closing)
                | (Closing, Closed)
                | (Closing, Failed(_))
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What the worker told us during negotiation.
#[derive(Debug, Clone)]
struct Session {
    protocol_version: String,
    capabilities: ServerCapabilities,
    server_info: Option<ServerInfo>,
    instructions: Option<String>,
    connected_at: DateTime<Utc>,
}

/// Point-in-time view of a connection, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub command: String,
    pub state: String,
    pub protocol_version: Option<String>,
    pub server_info: Option<ServerInfo>,
    pub capabilities: Option<ServerCapabilities>,
    pub instructions: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub subscribed: bool,
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// Host-side session with one worker process.
pub struct Connection {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    session: OnceLock<Session>,
    request_timeout: Duration,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a freshly opened transport. The connection starts in
    /// `Connecting` and is unusable until [`Connection::negotiate`] succeeds.
    pub(crate) fn new(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            config,
            transport,
            state,
            session: OnceLock::new(),
            request_timeout,
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Whether the worker's byte stream is still open.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Capabilities the worker advertised, once negotiated.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.session.get().map(|s| &s.capabilities)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.session.get().and_then(|s| s.server_info.as_ref())
    }

    pub fn is_subscribed(&self) -> bool {
        self.dispatcher
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn info(&self) -> ConnectionInfo {
        let session = self.session.get();
        ConnectionInfo {
            name: self.config.name.clone(),
            command: self.config.command.clone(),
            state: self.state().to_string(),
            protocol_version: session.map(|s| s.protocol_version.clone()),
            server_info: session.and_then(|s| s.server_info.clone()),
            capabilities: session.map(|s| s.capabilities.clone()),
            instructions: session.and_then(|s| s.instructions.clone()),
            connected_at: session.map(|s| s.connected_at),
            subscribed: self.is_subscribed(),
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    fn transition(&self, next: ConnectionState) -> bool {
        let name = self.config.name.as_str();
        self.state.send_if_modified(|current| {
            if !current.can_move_to(&next) {
                return false;
            }
            tracing::debug!(connection = name, from = %current, to = %next, "state change");
            *current = next;
            true
        })
    }

    // ─── Negotiation ─────────────────────────────────────────────────────

    /// Run the initialize handshake and move to `Connected`.
    ///
    /// On failure the connection is `Failed` and the error is
    /// [`HostError::Negotiation`].
    pub(crate) async fn negotiate(
        &self,
        client_info: &ClientInfo,
        capabilities: &ClientCapabilities,
        init_timeout: Duration,
    ) -> Result<(), HostError> {
        let outcome =
            match tokio::time::timeout(init_timeout, self.initialize(client_info, capabilities))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "initialization timed out after {}ms",
                    init_timeout.as_millis()
                )),
            };

        match outcome {
            Ok(session) => {
                tracing::info!(
                    connection = %self.config.name,
                    protocol = %session.protocol_version,
                    server = ?session.server_info.as_ref().map(|s| s.name.as_str()),
                    resources = session.capabilities.supports_resources(),
                    tools = session.capabilities.supports_tools(),
                    prompts = session.capabilities.supports_prompts(),
                    "capabilities negotiated"
                );
                let _ = self.session.set(session);
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(reason) => {
                self.transition(ConnectionState::Failed(reason.clone()));
                Err(HostError::Negotiation {
                    name: self.config.name.clone(),
                    reason,
                })
            }
        }
    }

    async fn initialize(
        &self,
        client_info: &ClientInfo,
        capabilities: &ClientCapabilities,
    ) -> Result<Session, String> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: capabilities.clone(),
            client_info: client_info.clone(),
        };
        let params = serde_json::to_value(params).map_err(|e| e.to_string())?;

        let response = self
            .transport
            .request("initialize", Some(params))
            .await
            .map_err(|e| e.to_string())?;
        let result = extract_result(&self.config.name, response).map_err(|e| e.to_string())?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| format!("failed to parse initialize response: {e}"))?;

        self.transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Session {
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
            server_info: init.server_info,
            instructions: init.instructions,
            connected_at: Utc::now(),
        })
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send one request bounded by the request timeout and unwrap its result.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, HostError> {
        let response = tokio::time::timeout(
            self.request_timeout,
            self.transport.request(method, params),
        )
        .await
        .map_err(|_| HostError::Timeout {
            name: self.config.name.clone(),
            method: method.to_string(),
            timeout_ms: self.request_timeout.as_millis() as u64,
        })??;

        extract_result(&self.config.name, response)
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        value: Value,
    ) -> Result<T, HostError> {
        serde_json::from_value(value).map_err(|e| {
            HostError::transport(
                &self.config.name,
                format!("malformed '{method}' response: {e}"),
            )
        })
    }

    fn cursor_params(cursor: Option<String>) -> Option<Value> {
        cursor.map(|c| serde_json::json!({ "cursor": c }))
    }

    /// Every resource the worker advertises, pages concatenated in order.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, HostError> {
        let mut resources = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let value = self
                .call("resources/list", Self::cursor_params(cursor.take()))
                .await?;
            let page: ListResourcesResult = self.decode("resources/list", value)?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
        tracing::warn!(
            connection = %self.config.name,
            pages = MAX_LIST_PAGES,
            "resource listing truncated"
        );
        Ok(resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, HostError> {
        let value = self
            .call("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await?;
        self.decode("resources/read", value)
    }

    /// Every tool the worker advertises, pages concatenated in order.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, HostError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let value = self
                .call("tools/list", Self::cursor_params(cursor.take()))
                .await?;
            let page: ListToolsResult = self.decode("tools/list", value)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        tracing::warn!(
            connection = %self.config.name,
            pages = MAX_LIST_PAGES,
            "tool listing truncated"
        );
        Ok(tools)
    }

    /// Invoke a tool. `arguments` are forwarded untouched.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, HostError> {
        let params = CallToolParams {
            name: tool.to_string(),
            arguments,
        };
        let params = serde_json::to_value(params).map_err(|e| {
            HostError::transport(&self.config.name, format!("failed to encode arguments: {e}"))
        })?;
        let value = self.call("tools/call", Some(params)).await?;
        self.decode("tools/call", value)
    }

    // ─── Notifications ───────────────────────────────────────────────────

    /// Register `handler` for this connection's notifications. Returns
    /// `false` (and changes nothing) if a handler is already registered.
    pub fn subscribe(&self, handler: Arc<dyn NotificationHandler>) -> bool {
        let Ok(mut slot) = self.dispatcher.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        let Some(rx) = self.transport.take_notifications() else {
            tracing::warn!(
                connection = %self.config.name,
                "notification stream unavailable"
            );
            return false;
        };
        *slot = Some(spawn_dispatcher(self.config.name.clone(), rx, handler));
        true
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Claim the connection for shutdown. Only the first caller wins; the
    /// connection is hidden from lookups from here on.
    pub(crate) fn begin_closing(&self) -> bool {
        self.transition(ConnectionState::Closing)
    }

    /// Close the transport within `deadline` and settle in `Closed` or
    /// `Failed`. A close that overruns counts as failed.
    pub(crate) async fn close(&self, deadline: Duration) -> Result<(), HostError> {
        let result = match tokio::time::timeout(deadline, self.transport.close()).await {
            Ok(result) => result,
            Err(_) => Err(HostError::Timeout {
                name: self.config.name.clone(),
                method: "close".to_string(),
                timeout_ms: deadline.as_millis() as u64,
            }),
        };
        match result {
            Ok(()) => {
                self.transition(ConnectionState::Closed);
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Release the transport of a connection that never got connected.
    pub(crate) async fn abandon(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(
                connection = %self.config.name,
                error = %e,
                "error releasing worker after failed negotiation"
            );
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.config.name)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
