use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};

use mcp_host::mcp_client::{
    find_config_path, load_host_config, ChannelHandler, McpHost, NotificationKind,
    ProcessConnector,
};

#[derive(Parser, Debug)]
#[command(name = "mcp-host")]
#[command(about = "Run a set of MCP workers and query them")]
#[command(version)]
struct Cli {
    /// Server config file (JSON or YAML). Defaults to $MCP_HOST_CONFIG,
    /// then ./mcp-servers.json, then the user config dir.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Write logs to this file (rotated) instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show connected workers and what they negotiated
    List,

    /// List resources of one worker, or of all of them
    Resources {
        /// Worker name
        name: Option<String>,
    },

    /// List tools of one worker, or of all of them
    Tools {
        /// Worker name
        name: Option<String>,
    },

    /// Read one resource
    Read {
        /// Worker name
        name: String,
        /// Resource URI as listed by the worker
        uri: String,
    },

    /// Invoke a tool
    Call {
        /// Worker name
        name: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        args: Option<String>,
    },

    /// Print list-changed notifications until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mcp_host::init_tracing(cli.log_json, cli.log_file.as_deref())?;

    let path = find_config_path(cli.config.as_deref())?;
    let config = load_host_config(&path)?;
    let mut settings = config.settings();
    if let Some(ms) = cli.timeout_ms {
        settings.request_timeout = Duration::from_millis(ms);
    }
    let connector = Arc::new(ProcessConnector::new(settings.shutdown_timeout));
    let configs = config.connection_configs();
    let command = cli.command;

    McpHost::scoped(settings, connector, |host| async move {
        let failures = host.connect_all(configs).await;
        if !failures.is_empty() {
            tracing::warn!(
                failed = failures.len(),
                connected = host.list_clients().len(),
                "some workers did not start"
            );
        }
        run(&host, command).await
    })
    .await
}

async fn run(host: &McpHost, command: Commands) -> Result<()> {
    match command {
        Commands::List => print_json(&host.connection_infos()),
        Commands::Resources { name: Some(name) } => print_json(&host.list_resources(&name).await?),
        Commands::Resources { name: None } => print_json(&host.aggregate_resources().await),
        Commands::Tools { name: Some(name) } => print_json(&host.list_tools(&name).await?),
        Commands::Tools { name: None } => print_json(&host.aggregate_tools().await),
        Commands::Read { name, uri } => print_json(&host.read_resource(&name, &uri).await?),
        Commands::Call { name, tool, args } => {
            let arguments: Map<String, Value> = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .context("tool arguments must be a JSON object")?,
                None => Map::new(),
            };
            let result = host.call_tool(&name, &tool, arguments).await?;
            print_json(&result)?;
            if result.is_error {
                anyhow::bail!("tool '{tool}' on '{name}' reported an error");
            }
            Ok(())
        }
        Commands::Watch => watch(host).await,
    }
}

/// Subscribe to every worker and print events as they arrive. A resource
/// change triggers a re-list so the new count shows up next to the event.
async fn watch(host: &McpHost) -> Result<()> {
    let (handler, mut events) = ChannelHandler::new();
    for name in host.list_clients() {
        host.subscribe(&name, Arc::new(handler.clone()))?;
    }
    drop(handler);
    tracing::info!(workers = host.list_clients().len(), "watching for notifications");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
            event = events.recv() => {
                let Some((connection, kind)) = event else {
                    tracing::info!("all notification streams ended");
                    return Ok(());
                };
                let mut line = serde_json::json!({
                    "connection": connection,
                    "event": kind.method(),
                });
                if kind == NotificationKind::ResourceListChanged {
                    match host.list_resources(&connection).await {
                        Ok(resources) => line["resources"] = resources.len().into(),
                        Err(e) => tracing::warn!(connection = %connection, error = %e, "re-list failed"),
                    }
                }
                println!("{line}");
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
