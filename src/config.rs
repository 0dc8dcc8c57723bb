//! Gateway configuration.
//!
//! Loaded once at bootstrap from a JSON file (default location under the
//! user's home directory) plus `.env` for credentials. Upstream server
//! configs are immutable for the process lifetime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use url::Url;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

fn default_allow_all() -> Vec<String> {
    vec!["*".to_string()]
}

/// Transport kind, used for health reporting and retry policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Stdio,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Stdio => "stdio",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a stdio child's stderr stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrMode {
    /// Child stderr is forwarded line-by-line into tracing at debug level.
    #[default]
    Log,
    /// Child inherits the gateway's stderr.
    Inherit,
    /// Child stderr is discarded.
    Null,
}

/// Tagged transport descriptor for an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Streamable HTTP transport. The bearer credential, if any, is read
    /// from the environment variable named by `bearer_env` at connect time.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_env: Option<String>,
    },
    /// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        stderr: StderrMode,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
        }
    }
}

/// Configuration for one upstream tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Unique identifier (e.g. "notion", "github").
    pub id: String,

    /// Display name. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Whether this server participates in sync and proxying.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tool allow-list patterns. `*` matches everything; a trailing `*`
    /// makes the pattern a prefix match; anything else is an exact match.
    #[serde(default = "default_allow_all")]
    pub allow_tools: Vec<String>,

    /// Transport descriptor.
    pub transport: TransportConfig,
}

impl UpstreamConfig {
    pub fn new(id: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            allow_tools: default_allow_all(),
            transport,
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "servers[].id".to_string(),
                hint: "Every upstream server needs a unique id".to_string(),
            });
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidValue {
                key: format!("servers[{}].id", self.id),
                message: "server ids must match [a-zA-Z0-9_-]+".to_string(),
            });
        }

        match &self.transport {
            TransportConfig::Http { url, .. } => {
                let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                    key: format!("servers[{}].transport.url", self.id),
                    message: e.to_string(),
                })?;
                // Remote servers must use HTTPS; loopback is allowed for development.
                if parsed.scheme() != "https" && !is_loopback(&parsed) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("servers[{}].transport.url", self.id),
                        message: "remote servers must use HTTPS".to_string(),
                    });
                }
            }
            TransportConfig::Stdio { command, .. } => {
                if command.is_empty() {
                    return Err(ConfigError::MissingRequired {
                        key: format!("servers[{}].transport.command", self.id),
                        hint: "stdio servers need a command to spawn".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Retry and backoff policy for upstream operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first failure, for restartable (stdio)
    /// transports. HTTP operations are never retried here.
    #[serde(default = "RetryConfig::default_stdio_retries")]
    pub stdio_retries: u32,

    /// Base backoff in milliseconds; doubles per consecutive failure.
    #[serde(default = "RetryConfig::default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for the computed backoff.
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    fn default_stdio_retries() -> u32 {
        2
    }

    fn default_base_backoff_ms() -> u64 {
        500
    }

    fn default_max_backoff_ms() -> u64 {
        30_000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            stdio_retries: Self::default_stdio_retries(),
            base_backoff_ms: Self::default_base_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

/// Sandbox execution budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Wall-clock budget for one snippet, in milliseconds.
    #[serde(default = "SandboxSettings::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum snippet length in characters.
    #[serde(default = "SandboxSettings::default_max_code_length")]
    pub max_code_length: usize,

    /// Serialized-result budget for the model-facing response.
    #[serde(default = "SandboxSettings::default_max_result_chars")]
    pub max_result_chars: usize,

    /// V8 heap ceiling in bytes.
    #[serde(default = "SandboxSettings::default_max_heap_bytes")]
    pub max_heap_bytes: usize,
}

impl SandboxSettings {
    fn default_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_code_length() -> usize {
        32_768
    }

    fn default_max_result_chars() -> usize {
        40_000
    }

    fn default_max_heap_bytes() -> usize {
        64 * 1024 * 1024
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            max_code_length: Self::default_max_code_length(),
            max_result_chars: Self::default_max_result_chars(),
            max_heap_bytes: Self::default_max_heap_bytes(),
        }
    }
}

/// Top-level gateway configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Catalog database file. Parent directory is created on open.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for immutable snapshot files.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Periodic sync interval in seconds; absent disables the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            snapshot_dir: default_snapshot_dir(),
            sync_interval_secs: None,
            retry: RetryConfig::default(),
            sandbox: SandboxSettings::default(),
            servers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file. A missing file yields the
    /// defaults (no servers), matching how a fresh install starts.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServer {
                    id: server.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Enabled servers in configured order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &UpstreamConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

/// Default configuration path: `~/.toolgate/config.json`.
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

fn default_db_path() -> PathBuf {
    data_dir().join("catalog.db")
}

fn default_snapshot_dir() -> PathBuf {
    data_dir().join("snapshots")
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
}

/// Check whether a parsed URL points at a loopback host.
fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
