//! Scripted in-memory workers for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::errors::HostError;
use super::notifications::NotificationKind;
use super::transport::{InboundNotification, Transport, TransportConnector};
use super::types::{error_codes, ConnectionConfig, JsonRpcResponse, PROTOCOL_VERSION};

type NotifySlot = Arc<Mutex<Option<mpsc::UnboundedSender<InboundNotification>>>>;

/// Behaviour of one fake worker. Clones share notification and close
/// bookkeeping, so a test can keep a clone to drive the worker after
/// handing it to a connector.
#[derive(Clone, Default)]
pub struct MockWorker {
    resources: Vec<(String, String)>,
    tools: Vec<String>,
    page_size: Option<usize>,
    fail_requests: bool,
    fail_initialize: bool,
    fail_close: bool,
    close_hang: Option<Duration>,
    delay: Option<Duration>,
    stall: Option<Duration>,
    notifier: NotifySlot,
    close_count: Arc<AtomicUsize>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, uri: &str, text: &str) -> Self {
        self.resources.push((uri.to_string(), text.to_string()));
        self
    }

    /// A tool that returns its arguments as structured content.
    pub fn with_echo_tool(mut self, name: &str) -> Self {
        self.tools.push(name.to_string());
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handshake normally, then sleep before answering anything else.
    pub fn stalling(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }

    /// Every request after initialize answers with a JSON-RPC error.
    pub fn failing_requests(mut self) -> Self {
        self.fail_requests = true;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// `close` reports the process as already gone.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// `close` sleeps this long before returning.
    pub fn hanging_close(mut self, hang: Duration) -> Self {
        self.close_hang = Some(hang);
        self
    }

    /// Push a list-changed notification to the host.
    pub fn notify(&self, kind: NotificationKind) {
        let slot = self.notifier.lock().unwrap();
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(InboundNotification {
                method: kind.method().to_string(),
                params: None,
            });
        }
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn respond(&self, method: &str, params: Option<Value>) -> Result<Value, (i64, String)> {
        if method == "initialize" {
            if self.fail_initialize {
                return Err((error_codes::INTERNAL_ERROR, "initialize rejected".into()));
            }
            return Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "resources": {"listChanged": true},
                    "tools": {"listChanged": true}
                },
                "serverInfo": {"name": "mock-worker", "version": "0.0.1"}
            }));
        }
        if self.fail_requests {
            return Err((error_codes::INTERNAL_ERROR, "worker failure".into()));
        }

        let params = params.unwrap_or(Value::Null);
        match method {
            "resources/list" => Ok(self.list_resources(&params)),
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                self.resources
                    .iter()
                    .find(|(u, _)| u == uri)
                    .map(|(u, text)| {
                        json!({"contents": [{"uri": u, "mimeType": "text/plain", "text": text}]})
                    })
                    .ok_or((
                        error_codes::RESOURCE_NOT_FOUND,
                        format!("resource not found: {uri}"),
                    ))
            }
            "tools/list" => Ok(json!({
                "tools": self.tools.iter().map(|t| json!({
                    "name": t,
                    "description": "echo arguments",
                    "inputSchema": {"type": "object"}
                })).collect::<Vec<_>>()
            })),
            "tools/call" => {
                let tool = params["name"].as_str().unwrap_or_default();
                if self.tools.iter().any(|t| t == tool) {
                    Ok(json!({
                        "content": [{"type": "text", "text": format!("called {tool}")}],
                        "structuredContent": params["arguments"].clone()
                    }))
                } else {
                    Err((error_codes::INVALID_PARAMS, format!("unknown tool: {tool}")))
                }
            }
            other => Err((
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    fn list_resources(&self, params: &Value) -> Value {
        let start: usize = params["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(self.resources.len());
        let page: Vec<Value> = self.resources[start..end]
            .iter()
            .map(|(uri, _)| {
                let name = uri.rsplit('/').next().unwrap_or(uri);
                json!({"uri": uri, "name": name, "mimeType": "text/plain"})
            })
            .collect();
        if end < self.resources.len() {
            json!({"resources": page, "nextCursor": end.to_string()})
        } else {
            json!({"resources": page})
        }
    }
}

/// [`Transport`] backed by a [`MockWorker`].
pub struct MockTransport {
    worker: MockWorker,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<InboundNotification>>>,
    alive: AtomicBool,
}

impl MockTransport {
    pub fn new(_name: &str, worker: MockWorker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        *worker.notifier.lock().unwrap() = Some(tx);
        Self {
            worker,
            notifications: Mutex::new(Some(rx)),
            alive: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, HostError> {
        if let Some(delay) = self.worker.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(stall) = self.worker.stall.filter(|_| method != "initialize") {
            tokio::time::sleep(stall).await;
        }
        Ok(match self.worker.respond(method, params) {
            Ok(result) => JsonRpcResponse::success(json!(1), result),
            Err((code, message)) => JsonRpcResponse::failure(json!(1), code, message),
        })
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), HostError> {
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<InboundNotification>> {
        self.notifications.lock().unwrap().take()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), HostError> {
        self.worker.close_count.fetch_add(1, Ordering::SeqCst);
        if let Some(hang) = self.worker.close_hang {
            tokio::time::sleep(hang).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        // Ends the notification stream like a closed pipe would.
        self.worker.notifier.lock().unwrap().take();
        if self.worker.fail_close {
            return Err(HostError::Transport {
                name: "mock".into(),
                reason: "process already exited".into(),
            });
        }
        Ok(())
    }
}

/// Hands out [`MockTransport`]s keyed by the config's `command`.
#[derive(Clone, Default)]
pub struct MockConnector {
    workers: Arc<Mutex<HashMap<String, MockWorker>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(self, command: &str, worker: MockWorker) -> Self {
        self.workers
            .lock()
            .unwrap()
            .insert(command.to_string(), worker);
        self
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, HostError> {
        let worker = self
            .workers
            .lock()
            .unwrap()
            .get(&config.command)
            .cloned()
            .ok_or_else(|| HostError::SpawnFailed {
                name: config.name.clone(),
                reason: format!("no such command: {}", config.command),
            })?;
        Ok(Box::new(MockTransport::new(&config.name, worker)))
    }
}
