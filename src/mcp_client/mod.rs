//! MCP host: JSON-RPC over stdio to a set of named worker processes.
//!
//! This module handles:
//! - Spawning worker processes and wiring their stdio as a JSON-RPC transport
//! - Capability negotiation (the `initialize` handshake)
//! - A registry of named connections with strict name uniqueness
//! - Per-worker resource and tool operations
//! - Fan-out across every worker with per-worker failure isolation
//! - List-changed notification dispatch
//! - Concurrent shutdown that never lets one failure strand the rest
//!
//! [`McpHost`] is the entry point; everything else is reachable from it.

pub mod config;
pub mod connection;
pub mod errors;
pub mod host;
pub mod lifecycle;
pub mod notifications;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{find_config_path, load_host_config, HostConfig, HostSettings};
pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use errors::HostError;
pub use host::McpHost;
pub use lifecycle::{CloseReport, ProcessConnector};
pub use notifications::{ChannelHandler, LoggingHandler, NotificationHandler, NotificationKind};
pub use registry::ClientRegistry;
pub use transport::{StdioTransport, Transport, TransportConnector};
pub use types::{
    CallToolResult, ConnectionConfig, ReadResourceResult, Resource, ResourceContents,
    ServerCapabilities, Tool,
};
