//! Host settings and server configuration loading.
//!
//! The orchestrator itself is configured programmatically through
//! [`HostSettings`] and [`ConnectionConfig`]. This module adds the file
//! layer used by the binary: `mcp-servers.json` (or `.yaml`) with
//! `${VAR}` / `${VAR:-default}` interpolation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::HostError;
use super::types::{ClientCapabilities, ClientInfo, ConnectionConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_HOST_CONFIG";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Generous to accommodate workers that load large runtimes at startup.
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── HostSettings ────────────────────────────────────────────────────────────

/// Runtime knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Deadline for one request round trip.
    pub request_timeout: Duration,
    /// Deadline for the initialize handshake.
    pub init_timeout: Duration,
    /// How long a worker gets to exit after its stdin closes.
    pub shutdown_timeout: Duration,
    pub client_info: ClientInfo,
    pub capabilities: ClientCapabilities,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            client_info: ClientInfo::default(),
            capabilities: ClientCapabilities::default(),
        }
    }
}

impl HostSettings {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Budget for closing one connection: the worker's exit grace period
    /// plus one request round trip for the transport to wind down.
    pub fn close_timeout(&self) -> Duration {
        self.shutdown_timeout + self.request_timeout
    }
}

// ─── File Config ─────────────────────────────────────────────────────────────

/// One server entry in the config file. The map key is its name.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Skip this server without deleting its entry.
    #[serde(default)]
    pub disabled: bool,
}

/// Top-level `mcp-servers.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, ServerEntry>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub init_timeout_ms: Option<u64>,
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

impl HostConfig {
    /// Enabled servers as connection configs, sorted by name.
    pub fn connection_configs(&self) -> Vec<ConnectionConfig> {
        let mut configs: Vec<ConnectionConfig> = self
            .servers
            .iter()
            .filter(|(_, entry)| !entry.disabled)
            .map(|(name, entry)| ConnectionConfig {
                name: name.clone(),
                command: expand_tilde(&entry.command),
                args: entry.args.clone(),
                env: entry.env.clone(),
                cwd: entry.cwd.as_deref().map(expand_tilde),
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Default settings with any timeouts from the file applied.
    pub fn settings(&self) -> HostSettings {
        let mut settings = HostSettings::default();
        if let Some(ms) = self.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.init_timeout_ms {
            settings.init_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            settings.shutdown_timeout = Duration::from_millis(ms);
        }
        settings
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Resolution order:
/// 1. `explicit` (must exist)
/// 2. `$MCP_HOST_CONFIG`
/// 3. `mcp-servers.json` / `.yaml` / `.yml` in the current directory
/// 4. `<config dir>/mcp-host/mcp-servers.json`
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, HostError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(HostError::Config {
            reason: format!("config file not found: {}", path.display()),
        });
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    for name in ["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"] {
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("mcp-host").join("mcp-servers.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(HostError::Config {
        reason: "could not find mcp-servers.json".into(),
    })
}

/// Load and parse a config file. YAML is chosen by extension, JSON otherwise.
pub fn load_host_config(path: &Path) -> Result<HostConfig, HostError> {
    let raw = std::fs::read_to_string(path).map_err(|e| HostError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let config: HostConfig = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| HostError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| HostError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    for name in config.servers.keys() {
        if name.trim().is_empty() {
            return Err(HostError::Config {
                reason: format!("{}: server names must not be empty", path.display()),
            });
        }
    }

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded host config"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
