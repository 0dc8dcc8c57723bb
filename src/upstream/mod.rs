//! Upstream connection management: transports, health, and the per-server
//! connection discipline.

pub mod health;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use health::{HealthSnapshot, ServerHealth, ServerStatus};
pub use manager::{UpstreamManager, backoff_delay};
pub use protocol::{RpcRequest, RpcResponse, ToolDescriptor};
pub use transport::Transport;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;

/// Invocation seam consumed by the tool proxy.
#[async_trait]
pub trait UpstreamInvoker: Send + Sync {
    async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, UpstreamError>;
}

/// Discovery seam consumed by the sync service.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// All configured servers, in configured order.
    fn server_configs(&self) -> Vec<UpstreamConfig>;

    /// Live tool discovery on one server.
    async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, UpstreamError>;
}
