//! JSON-RPC transport over a byte stream.
//!
//! Defines the [`Transport`] seam the host talks through and the
//! [`StdioTransport`] implementation used for spawned workers:
//! - One JSON object per line in both directions
//! - A writer task owns the outbound half
//! - A reader task routes responses to pending requests by id, forwards
//!   notifications in arrival order, and answers worker-initiated requests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::HostError;
use super::types::{
    error_codes, ConnectionConfig, IncomingMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};

/// Outbound line queue depth before writers wait.
const WRITE_QUEUE_DEPTH: usize = 64;

// ─── Seams ───────────────────────────────────────────────────────────────────

/// A notification pushed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// Framed request/response/notification channel to one worker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response with the same id.
    async fn request(&self, method: &str, params: Option<Value>)
        -> Result<JsonRpcResponse, HostError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), HostError>;

    /// Take the inbound notification stream. Only the first call gets it.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<InboundNotification>>;

    /// Whether the underlying stream is still open.
    fn is_alive(&self) -> bool;

    /// Close the stream and release the worker.
    async fn close(&self) -> Result<(), HostError>;
}

/// Opens a [`Transport`] for a connection config.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, HostError>;
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's pending entry however the request future ends,
/// including when a caller's timeout drops it.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

/// Bi-directional JSON-RPC transport over a worker's stdio (or any pair of
/// async byte streams).
pub struct StdioTransport {
    name: String,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    writer_tx: Mutex<Option<mpsc::Sender<String>>>,
    notifications: std::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundNotification>>>,
    child: Mutex<Option<Child>>,
    shutdown_timeout: Duration,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Start the reader and writer tasks over the given streams.
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_loop(name.to_string(), writer, writer_rx));
        let reader_task = tokio::spawn(read_loop(
            name.to_string(),
            BufReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&closed),
            notify_tx,
            writer_tx.downgrade(),
        ));

        Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            closed,
            writer_tx: Mutex::new(Some(writer_tx)),
            notifications: std::sync::Mutex::new(Some(notify_rx)),
            child: Mutex::new(None),
            shutdown_timeout: Duration::from_secs(5),
            reader_task,
            writer_task,
        }
    }

    /// Attach the worker process so `close` can reap it.
    pub fn with_child(mut self, child: Child, shutdown_timeout: Duration) -> Self {
        self.child = Mutex::new(Some(child));
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    async fn send_line(&self, mut line: String) -> Result<(), HostError> {
        line.push('\n');
        let sender = self
            .writer_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| HostError::transport(&self.name, "transport closed"))?;
        sender
            .send(line)
            .await
            .map_err(|_| HostError::transport(&self.name, "worker stdin closed"))
    }

    /// Reap the worker after stdin has been closed.
    async fn reap_child(&self) -> Result<(), HostError> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(connection = %self.name, %status, "worker exited");
                Ok(())
            }
            Ok(Err(e)) => Err(HostError::transport(
                &self.name,
                format!("failed to wait for worker: {e}"),
            )),
            Err(_) => {
                tracing::warn!(
                    connection = %self.name,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "worker did not exit after stdin closed, killing"
                );
                child.kill().await.map_err(|e| {
                    HostError::transport(&self.name, format!("failed to kill worker: {e}"))
                })
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req).map_err(|e| {
            HostError::transport(&self.name, format!("failed to serialize request: {e}"))
        })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        // The reader may have hit EOF between our insert and now.
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::transport(
                &self.name,
                "worker stdout closed (process may have exited)",
            ));
        }

        self.send_line(json).await?;

        rx.await.map_err(|_| {
            HostError::transport(&self.name, "worker stdout closed (process may have exited)")
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), HostError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            HostError::transport(&self.name, format!("failed to serialize notification: {e}"))
        })?;
        self.send_line(json).await
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<InboundNotification>> {
        self.notifications.lock().ok()?.take()
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), HostError> {
        // A worker that died on its own cannot be closed cleanly.
        let exited_early = {
            let mut guard = self.child.lock().await;
            match guard.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => Some(status),
                _ => None,
            }
        };

        // Dropping the last sender ends the writer task, which closes stdin.
        self.writer_tx.lock().await.take();

        let result = match exited_early {
            Some(status) => Err(HostError::transport(
                &self.name,
                format!("process already exited ({status})"),
            )),
            None => self.reap_child().await,
        };

        self.reader_task.abort();
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every request still waiting.
        lock_pending(&self.pending).clear();
        result
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn write_loop<W>(name: String, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(connection = %name, error = %e, "failed to write to worker");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    name: String,
    mut reader: BufReader<R>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    notify_tx: mpsc::UnboundedSender<InboundNotification>,
    writer: mpsc::WeakSender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(connection = %name, error = %e, "failed to read from worker");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match IncomingMessage::parse(trimmed) {
            Some(IncomingMessage::Response(resp)) => {
                let Some(id) = resp.id.as_u64() else {
                    tracing::debug!(connection = %name, "response with non-numeric id dropped");
                    continue;
                };
                let waiter = lock_pending(&pending).remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(resp);
                }
            }
            Some(IncomingMessage::Notification { method, params }) => {
                // Receiver may be gone if nobody subscribed; that's fine.
                let _ = notify_tx.send(InboundNotification { method, params });
            }
            Some(IncomingMessage::Request { id, method, .. }) => {
                let reply = answer_worker_request(id, &method);
                if let (Some(tx), Ok(json)) = (writer.upgrade(), serde_json::to_string(&reply)) {
                    // Never block routing on a full write queue.
                    if tx.try_send(json + "\n").is_err() {
                        tracing::warn!(
                            connection = %name,
                            method = %method,
                            "reply to worker request dropped"
                        );
                    }
                }
            }
            None => {
                tracing::trace!(connection = %name, line = trimmed, "non JSON-RPC output from worker");
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every in-flight request.
    lock_pending(&pending).clear();
    tracing::debug!(connection = %name, "worker stdout closed");
}

/// Reply to a request the worker sent us.
fn answer_worker_request(id: Value, method: &str) -> JsonRpcResponse {
    match method {
        "ping" => JsonRpcResponse::success(id, Value::Object(Default::default())),
        other => JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("method not supported by host: {other}"),
        ),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to
/// [`HostError::Remote`].
pub fn extract_result(name: &str, response: JsonRpcResponse) -> Result<Value, HostError> {
    if let Some(err) = response.error {
        return Err(HostError::Remote {
            name: name.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| HostError::Remote {
        name: name.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
