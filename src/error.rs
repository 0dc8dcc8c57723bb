//! Error types for the gateway.

use std::time::Duration;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Duplicate server id: {id}")]
    DuplicateServer { id: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Catalog store errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to open catalog database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Upstream connection and invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Unknown server: {id}")]
    UnknownServer { id: String },

    #[error("Server {id} is disabled")]
    Disabled { id: String },

    #[error("Failed to connect to server {id}: {reason}")]
    ConnectFailed { id: String, reason: String },

    #[error("Missing credential: environment variable {var} is not set")]
    MissingCredential { var: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream returned error: {message} (code {code})")]
    Rpc { code: i64, message: String },

    #[error("Request to server {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },
}

/// Tool proxy errors. All variants are user-visible through the gateway
/// error envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Unknown server: {server_id}")]
    UnknownServer { server_id: String },

    #[error("Server {server_id} is disabled")]
    ServerDisabled { server_id: String },

    #[error("Tool {tool} is not allowed on server {server_id}")]
    NotAllowed { server_id: String, tool: String },

    #[error("Tool {tool} not found on server {server_id}")]
    ToolNotFound { server_id: String, tool: String },

    #[error("Input validation failed for tool {tool}: {message}")]
    ValidationFailed { tool: String, message: String },

    #[error("Failed to compile input schema for tool {tool}: {message}")]
    SchemaCompile { tool: String, message: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Sandbox execution errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Code must be a non-empty string")]
    EmptyCode,

    #[error("Code exceeds maximum length of {max} characters (got {len})")]
    CodeTooLong { len: usize, max: usize },

    #[error("Code execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("JavaScript heap limit exceeded")]
    HeapLimit,

    #[error("{0}")]
    Execution(String),

    #[error("Host call failed: {0}")]
    HostCall(String),

    #[error("Sandbox worker failed: {0}")]
    Worker(String),
}

/// Sync service errors (per-server; never abort a full sync pass).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Failed to write snapshot: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("Failed to serialize snapshot payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
