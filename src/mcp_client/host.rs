//! The MCP host: one object that owns every worker connection.
//!
//! Single-connection operations look the name up, fail fast with
//! `NotFound`, and propagate the worker's errors unchanged. Fan-out
//! operations (`aggregate_*`, `close_all`, `connect_all`) isolate each
//! connection: a failing worker is logged and degrades to an empty or
//! failed entry, never to a failed call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};

use super::config::HostSettings;
use super::connection::{Connection, ConnectionInfo};
use super::errors::HostError;
use super::lifecycle::{close_isolated, CloseReport, ProcessConnector};
use super::notifications::NotificationHandler;
use super::registry::ClientRegistry;
use super::transport::TransportConnector;
use super::types::{CallToolResult, ConnectionConfig, ReadResourceResult, Resource, Tool};

/// Orchestrates a set of named MCP worker connections.
pub struct McpHost {
    registry: ClientRegistry,
    connector: Arc<dyn TransportConnector>,
}

impl McpHost {
    pub fn new(settings: HostSettings, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            registry: ClientRegistry::new(settings),
            connector,
        }
    }

    /// A host that launches workers as local child processes.
    pub fn with_process_connector(settings: HostSettings) -> Self {
        let connector = Arc::new(ProcessConnector::new(settings.shutdown_timeout));
        Self::new(settings, connector)
    }

    pub fn settings(&self) -> &HostSettings {
        self.registry.settings()
    }

    /// Run `f` against a fresh host, then close every connection it opened,
    /// whatever `f` returned.
    pub async fn scoped<F, Fut, T>(
        settings: HostSettings,
        connector: Arc<dyn TransportConnector>,
        f: F,
    ) -> T
    where
        F: FnOnce(Arc<McpHost>) -> Fut,
        Fut: Future<Output = T>,
    {
        let host = Arc::new(Self::new(settings, connector));
        let output = f(Arc::clone(&host)).await;
        let report = host.close_all().await;
        if !report.is_clean() {
            tracing::warn!(failed = report.failed.len(), "scoped host shut down with errors");
        }
        output
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Spawn, negotiate with, and register a worker.
    pub async fn add_client(&self, config: ConnectionConfig) -> Result<Arc<Connection>, HostError> {
        self.registry.add(config, self.connector.as_ref()).await
    }

    /// Add several workers concurrently. Returns the ones that failed; the
    /// rest stay connected.
    pub async fn connect_all(&self, configs: Vec<ConnectionConfig>) -> Vec<(String, HostError)> {
        let outcomes = join_all(configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            (name, self.add_client(config).await)
        }))
        .await;

        let mut failures = Vec::new();
        for (name, result) in outcomes {
            if let Err(e) = result {
                if e.is_isolatable() {
                    tracing::warn!(connection = %name, error = %e, "failed to start worker");
                } else {
                    tracing::error!(connection = %name, error = %e, "invalid worker entry");
                }
                failures.push((name, e));
            }
        }
        failures
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<Connection>> {
        self.registry.get(name)
    }

    /// Names of all connected workers, sorted.
    pub fn list_clients(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn connection_info(&self, name: &str) -> Result<ConnectionInfo, HostError> {
        Ok(self.registry.require(name)?.info())
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.registry
            .connections()
            .iter()
            .map(|conn| conn.info())
            .collect()
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// The worker's resources, exactly as it listed them.
    pub async fn list_resources(&self, name: &str) -> Result<Vec<Resource>, HostError> {
        self.registry.require(name)?.list_resources().await
    }

    pub async fn read_resource(
        &self,
        name: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, HostError> {
        self.registry.require(name)?.read_resource(uri).await
    }

    /// Invoke `tool` on the named worker. A result flagged `is_error` is
    /// still `Ok`; only JSON-RPC level failures become `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, HostError> {
        self.registry.require(name)?.call_tool(tool, arguments).await
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<Tool>, HostError> {
        self.registry.require(name)?.list_tools().await
    }

    // ─── Aggregation ─────────────────────────────────────────────────────

    /// Resources of every connected worker, keyed by connection name.
    ///
    /// Exactly one entry per connection that was connected when the call
    /// started. A worker that fails, times out or is removed mid-call maps
    /// to an empty list.
    pub async fn aggregate_resources(&self) -> BTreeMap<String, Vec<Resource>> {
        let conns = self.registry.connections();
        let outcomes = join_all(conns.iter().map(|conn| conn.list_resources())).await;
        collect_isolated("resources/list", &conns, outcomes)
    }

    /// Tools of every connected worker, with the same isolation as
    /// [`McpHost::aggregate_resources`].
    pub async fn aggregate_tools(&self) -> BTreeMap<String, Vec<Tool>> {
        let conns = self.registry.connections();
        let outcomes = join_all(conns.iter().map(|conn| conn.list_tools())).await;
        collect_isolated("tools/list", &conns, outcomes)
    }

    // ─── Notifications ───────────────────────────────────────────────────

    /// Route the named worker's list-changed notifications to `handler`.
    ///
    /// Returns `Ok(false)` if a handler was already registered; the first
    /// one stays in place.
    pub fn subscribe(
        &self,
        name: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<bool, HostError> {
        let conn = self.registry.require(name)?;
        let registered = conn.subscribe(handler);
        if registered {
            tracing::debug!(connection = name, "subscribed to notifications");
        }
        Ok(registered)
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Close one worker and drop it from the registry.
    pub async fn close_client(&self, name: &str) -> Result<(), HostError> {
        self.registry.remove(name).await
    }

    /// Close every connected worker concurrently.
    ///
    /// Never fails as a whole; each connection's outcome is in the report.
    /// A name whose `add_client` is still negotiating is not yet registered
    /// as connected and is left to that caller: it is neither closed nor
    /// reported, and stays usable once its add completes.
    pub async fn close_all(&self) -> CloseReport {
        let names = self.registry.list();
        if names.is_empty() {
            return CloseReport::default();
        }
        tracing::info!(count = names.len(), "closing all workers");

        let registry = &self.registry;
        let report = close_isolated(names, |name| async move {
            let result = registry.remove(&name).await;
            (name, result)
        })
        .await;

        tracing::info!(
            closed = report.closed.len(),
            failed = report.failed.len(),
            "all workers closed"
        );
        report
    }
}

impl std::fmt::Debug for McpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpHost")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Fold per-connection results into a name-keyed map, logging failures and
/// substituting an empty list.
fn collect_isolated<T>(
    method: &str,
    conns: &[Arc<Connection>],
    outcomes: Vec<Result<Vec<T>, HostError>>,
) -> BTreeMap<String, Vec<T>> {
    conns
        .iter()
        .zip(outcomes)
        .map(|(conn, outcome)| {
            let items = outcome.unwrap_or_else(|e| {
                tracing::warn!(
                    connection = conn.name(),
                    method,
                    error = %e,
                    "aggregation skipped failing worker"
                );
                Vec::new()
            });
            (conn.name().to_string(), items)
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::connection::ConnectionState;
    use crate::mcp_client::notifications::{ChannelHandler, NotificationKind};
    use crate::mcp_client::testing::{MockConnector, MockWorker};
    use crate::mcp_client::types::error_codes;
    use serde_json::json;
    use std::time::Duration;

    fn settings() -> HostSettings {
        let mut settings = HostSettings::default().with_request_timeout(Duration::from_millis(150));
        settings.init_timeout = Duration::from_millis(150);
        settings.shutdown_timeout = Duration::from_millis(150);
        settings
    }

    fn host(connector: MockConnector) -> McpHost {
        McpHost::new(settings(), Arc::new(connector))
    }

    fn fs_worker() -> MockWorker {
        MockWorker::new()
            .with_resource("file:///notes/todo.md", "- buy milk")
            .with_resource("file:///notes/ideas.md", "- write a host")
            .with_echo_tool("echo")
    }

    #[tokio::test]
    async fn test_end_to_end_single_worker() {
        let host = host(MockConnector::new().with_worker("fs-worker", fs_worker()));
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();

        let resources = host.list_resources("fs").await.unwrap();
        let uris: Vec<_> = resources.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris, vec!["file:///notes/todo.md", "file:///notes/ideas.md"]);

        let read = host.read_resource("fs", &resources[0].uri).await.unwrap();
        assert_eq!(read.contents[0].text.as_deref(), Some("- buy milk"));

        host.close_client("fs").await.unwrap();
        assert!(host.get_client("fs").is_none());
        assert!(matches!(
            host.list_resources("fs").await,
            Err(HostError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_close_all() {
        let connector = MockConnector::new()
            .with_worker("a-worker", MockWorker::new())
            .with_worker("b-worker", MockWorker::new());
        let host = host(connector);
        host.add_client(ConnectionConfig::new("a", "a-worker"))
            .await
            .unwrap();
        host.add_client(ConnectionConfig::new("b", "b-worker"))
            .await
            .unwrap();

        let mut clients = host.list_clients();
        clients.sort();
        assert_eq!(clients, vec!["a", "b"]);

        let report = host.close_all().await;
        assert_eq!(report.closed, vec!["a", "b"]);
        assert!(report.is_clean());
        assert!(host.list_clients().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_existing() {
        let host = host(MockConnector::new().with_worker("fs-worker", fs_worker()));
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();
        let err = host
            .add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateName { .. }));
        assert_eq!(host.list_resources("fs").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_client_twice() {
        let host = host(MockConnector::new().with_worker("fs-worker", fs_worker()));
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();
        host.close_client("fs").await.unwrap();
        assert!(matches!(
            host.close_client("fs").await,
            Err(HostError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_isolates_failing_worker() {
        let connector = MockConnector::new()
            .with_worker("good", fs_worker())
            .with_worker("bad", MockWorker::new().failing_requests());
        let host = host(connector);
        host.add_client(ConnectionConfig::new("a", "good"))
            .await
            .unwrap();
        host.add_client(ConnectionConfig::new("b", "bad"))
            .await
            .unwrap();

        let all = host.aggregate_resources().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].len(), 2);
        assert!(all["b"].is_empty());

        // The façade surfaces the same failure directly.
        assert!(matches!(
            host.list_resources("b").await,
            Err(HostError::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_times_out_slow_worker() {
        let connector = MockConnector::new()
            .with_worker("good", fs_worker())
            .with_worker(
                "stuck",
                MockWorker::new()
                    .with_resource("file:///x", "x")
                    .stalling(Duration::from_secs(5)),
            );
        let host = host(connector);
        host.add_client(ConnectionConfig::new("a", "good"))
            .await
            .unwrap();
        host.add_client(ConnectionConfig::new("s", "stuck"))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let all = host.aggregate_resources().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(all["a"].len(), 2);
        assert!(all["s"].is_empty());

        assert!(matches!(
            host.list_resources("s").await,
            Err(HostError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_tools_and_list_tools() {
        let connector = MockConnector::new()
            .with_worker("fs-worker", fs_worker())
            .with_worker("bad", MockWorker::new().failing_requests());
        let host = host(connector);
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();
        host.add_client(ConnectionConfig::new("b", "bad"))
            .await
            .unwrap();

        let tools = host.list_tools("fs").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let all = host.aggregate_tools().await;
        assert_eq!(all["fs"], tools);
        assert!(all["b"].is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_keeps_entry_for_worker_removed_mid_call() {
        let connector = MockConnector::new()
            .with_worker("good", fs_worker())
            .with_worker(
                "lagging",
                MockWorker::new()
                    .with_resource("file:///late", "late")
                    .with_delay(Duration::from_millis(60)),
            );
        let host = Arc::new(host(connector));
        host.add_client(ConnectionConfig::new("a", "good"))
            .await
            .unwrap();
        host.add_client(ConnectionConfig::new("l", "lagging"))
            .await
            .unwrap();

        let aggregate = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.aggregate_resources().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        host.close_client("l").await.unwrap();

        let all = aggregate.await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].len(), 2);
        assert!(all.contains_key("l"));
    }

    #[tokio::test]
    async fn test_close_all_isolates_failures() {
        let ok_a = MockWorker::new();
        let dead = MockWorker::new().failing_close();
        let ok_c = MockWorker::new();
        let connector = MockConnector::new()
            .with_worker("ok-a", ok_a.clone())
            .with_worker("dead", dead.clone())
            .with_worker("ok-c", ok_c.clone());
        let host = host(connector);
        for (name, command) in [("a", "ok-a"), ("b", "dead"), ("c", "ok-c")] {
            host.add_client(ConnectionConfig::new(name, command))
                .await
                .unwrap();
        }

        let report = host.close_all().await;
        assert_eq!(report.closed, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(host.list_clients().is_empty());

        assert_eq!(ok_a.close_count(), 1);
        assert_eq!(dead.close_count(), 1);
        assert_eq!(ok_c.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_bounds_hanging_close() {
        let ok_a = MockWorker::new();
        let stuck = MockWorker::new().hanging_close(Duration::from_secs(30));
        let ok_c = MockWorker::new();
        let connector = MockConnector::new()
            .with_worker("ok-a", ok_a.clone())
            .with_worker("stuck", stuck.clone())
            .with_worker("ok-c", ok_c.clone());
        let host = host(connector);
        for (name, command) in [("a", "ok-a"), ("b", "stuck"), ("c", "ok-c")] {
            host.add_client(ConnectionConfig::new(name, command))
                .await
                .unwrap();
        }

        let started = std::time::Instant::now();
        let report = host.close_all().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= host.settings().close_timeout());
        assert!(elapsed < Duration::from_secs(5), "close_all took {elapsed:?}");
        assert_eq!(report.closed, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        match &report.failed[0].1 {
            HostError::Timeout { method, .. } => assert_eq!(method, "close"),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(host.list_clients().is_empty());
        assert!(host.get_client("b").is_none());
        assert_eq!(stuck.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_skips_add_in_progress() {
        let slow = MockWorker::new().with_delay(Duration::from_millis(100));
        let host = host(MockConnector::new().with_worker("slow-worker", slow.clone()));

        let (added, report) = tokio::join!(
            host.add_client(ConnectionConfig::new("slow", "slow-worker")),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                host.close_all().await
            }
        );

        assert_eq!(report.total(), 0);
        assert!(added.is_ok());
        assert_eq!(host.list_clients(), vec!["slow"]);
        assert_eq!(slow.close_count(), 0);

        let report = host.close_all().await;
        assert_eq!(report.closed, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_close_all_on_empty_host() {
        let host = host(MockConnector::new());
        let report = host.close_all().await;
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn test_call_tool_passes_remote_errors_through() {
        let host = host(MockConnector::new().with_worker("fs-worker", fs_worker()));
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();

        let mut args = Map::new();
        args.insert("x".into(), json!(1));
        let ok = host.call_tool("fs", "echo", args.clone()).await.unwrap();
        assert_eq!(ok.structured_content, Some(Value::Object(args.clone())));

        match host.call_tool("fs", "missing", args).await {
            Err(HostError::Remote { code, message, .. }) => {
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert!(message.contains("missing"));
            }
            other => panic!("expected Remote, got {other:?}"),
        }

        match host.read_resource("fs", "file:///nope").await {
            Err(HostError::Remote { code, .. }) => {
                assert_eq!(code, error_codes::RESOURCE_NOT_FOUND)
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let host = host(MockConnector::new());
        assert!(matches!(
            host.read_resource("ghost", "file:///x").await,
            Err(HostError::NotFound { .. })
        ));
        assert!(matches!(
            host.call_tool("ghost", "echo", Map::new()).await,
            Err(HostError::NotFound { .. })
        ));
        assert!(matches!(
            host.connection_info("ghost"),
            Err(HostError::NotFound { .. })
        ));
        assert!(matches!(
            host.subscribe("ghost", Arc::new(ChannelHandler::new().0)),
            Err(HostError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_in_order_and_is_idempotent() {
        let worker = fs_worker();
        let host = host(MockConnector::new().with_worker("fs-worker", worker.clone()));
        host.add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();

        let (handler, mut events) = ChannelHandler::new();
        assert!(host.subscribe("fs", Arc::new(handler)).unwrap());

        let (second, mut second_events) = ChannelHandler::new();
        assert!(!host.subscribe("fs", Arc::new(second)).unwrap());
        assert!(host.connection_info("fs").unwrap().subscribed);

        worker.notify(NotificationKind::ToolListChanged);
        worker.notify(NotificationKind::ResourceListChanged);
        worker.notify(NotificationKind::PromptListChanged);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event.1);
        }
        assert_eq!(
            seen,
            vec![
                NotificationKind::ToolListChanged,
                NotificationKind::ResourceListChanged,
                NotificationKind::PromptListChanged,
            ]
        );
        assert!(second_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_all_allows_partial_startup() {
        let connector = MockConnector::new()
            .with_worker("fs-worker", fs_worker())
            .with_worker("broken", MockWorker::new().failing_initialize());
        let host = host(connector);

        let failures = host
            .connect_all(vec![
                ConnectionConfig::new("fs", "fs-worker"),
                ConnectionConfig::new("bad", "broken"),
                ConnectionConfig::new("ghost", "missing"),
            ])
            .await;

        let mut failed: Vec<_> = failures.iter().map(|(name, _)| name.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["bad", "ghost"]);
        assert_eq!(host.list_clients(), vec!["fs"]);
    }

    #[tokio::test]
    async fn test_connection_info_reports_session() {
        let host = host(MockConnector::new().with_worker("fs-worker", fs_worker()));
        let conn = host
            .add_client(ConnectionConfig::new("fs", "fs-worker"))
            .await
            .unwrap();
        let info = host.connection_info("fs").unwrap();
        assert_eq!(info.state, "connected");
        assert_eq!(info.server_info.unwrap().name, "mock-worker");
        assert!(!info.subscribed);
        assert_eq!(host.connection_infos().len(), 1);

        host.close_client("fs").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_process_host_reports_spawn_failure() {
        let host = McpHost::with_process_connector(settings());
        let err = host
            .add_client(ConnectionConfig::new("ghost", "/nonexistent/mcp-worker-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::SpawnFailed { .. }));
        assert!(host.list_clients().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_closes_everything() {
        let worker = fs_worker();
        let connector = Arc::new(MockConnector::new().with_worker("fs-worker", worker.clone()));

        let count = McpHost::scoped(settings(), connector, |host| async move {
            host.add_client(ConnectionConfig::new("fs", "fs-worker"))
                .await
                .unwrap();
            host.list_resources("fs").await.unwrap().len()
        })
        .await;

        assert_eq!(count, 2);
        assert_eq!(worker.close_count(), 1);
    }
}
