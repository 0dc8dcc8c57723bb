//! Upstream connection manager.
//!
//! Owns one logical connection per configured server. Connection
//! establishment happens under a per-server async mutex, so there is at
//! most one live connection and at most one in-flight attempt per id;
//! concurrent callers share whichever wins. Operations are wrapped in the
//! retry policy: restartable (stdio) transports get `stdio_retries` extra
//! attempts with exponential backoff, HTTP gets exactly one attempt.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::{RetryConfig, TransportConfig, TransportKind, UpstreamConfig};
use crate::error::UpstreamError;
use crate::upstream::health::{HealthSnapshot, ServerHealth};
use crate::upstream::protocol::{ListToolsResult, RpcRequest, RpcResponse, ToolDescriptor};
use crate::upstream::transport::{HttpTransport, StdioTransport, Transport};
use crate::upstream::{ToolSource, UpstreamInvoker};

/// Compute the backoff before the next attempt. Doubles per consecutive
/// failure, bounded above by `max_backoff_ms`.
pub fn backoff_delay(retry: &RetryConfig, consecutive_failures: u64) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20) as u32;
    let ms = retry
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.max_backoff_ms);
    Duration::from_millis(ms)
}

/// One live connection: a transport plus the request-id counter and the
/// JSON-RPC conveniences layered on top of it.
struct Connection {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
}

impl Connection {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Initialize handshake; runs once right after the transport is built.
    async fn initialize(&self) -> Result<(), UpstreamError> {
        let response = self
            .transport
            .request(RpcRequest::initialize(self.next_request_id()))
            .await?;
        expect_result(response)?;
        // Fire-and-forget per protocol; some servers never acknowledge it.
        let _ = self
            .transport
            .notify(RpcRequest::initialized_notification())
            .await;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, UpstreamError> {
        let response = self
            .transport
            .request(RpcRequest::tools_list(self.next_request_id()))
            .await?;
        let result = expect_result(response)?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| UpstreamError::Protocol(format!("invalid tools list: {e}")))?;
        Ok(parsed.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let response = self
            .transport
            .request(RpcRequest::tools_call(
                self.next_request_id(),
                name,
                arguments,
            ))
            .await?;
        expect_result(response)
    }
}

fn expect_result(response: RpcResponse) -> Result<Value, UpstreamError> {
    if let Some(error) = response.error {
        return Err(UpstreamError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    response
        .result
        .ok_or_else(|| UpstreamError::Protocol("response carries neither result nor error".into()))
}

struct ServerEntry {
    config: UpstreamConfig,
    health: Arc<ServerHealth>,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

/// Multiplexes all configured upstream servers behind one handle.
pub struct UpstreamManager {
    servers: BTreeMap<String, Arc<ServerEntry>>,
    /// Configured order, preserved for sync passes.
    order: Vec<String>,
    retry: RetryConfig,
}

impl UpstreamManager {
    pub fn new(configs: Vec<UpstreamConfig>, retry: RetryConfig) -> Self {
        let order: Vec<String> = configs.iter().map(|c| c.id.clone()).collect();
        let servers = configs
            .into_iter()
            .map(|config| {
                let health = Arc::new(ServerHealth::new(
                    config.transport.kind(),
                    config.enabled,
                ));
                (
                    config.id.clone(),
                    Arc::new(ServerEntry {
                        config,
                        health,
                        connection: tokio::sync::Mutex::new(None),
                    }),
                )
            })
            .collect();
        Self {
            servers,
            order,
            retry,
        }
    }

    /// Server configs in configured order.
    pub fn list_server_configs(&self) -> Vec<UpstreamConfig> {
        self.order
            .iter()
            .filter_map(|id| self.servers.get(id))
            .map(|e| e.config.clone())
            .collect()
    }

    pub fn get_server_config(&self, id: &str) -> Option<UpstreamConfig> {
        self.servers.get(id).map(|e| e.config.clone())
    }

    /// Remote discovery: `tools/list` on one server, with retry policy.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, UpstreamError> {
        self.run_operation(server_id, "listTools", |conn| async move {
            conn.list_tools().await
        })
        .await
    }

    /// Remote invocation: `tools/call` on one server, with retry policy.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, UpstreamError> {
        let name = name.to_string();
        self.run_operation(server_id, "callTool", move |conn| {
            let name = name.clone();
            let arguments = arguments.clone();
            async move { conn.call_tool(&name, arguments).await }
        })
        .await
    }

    /// Health snapshots for every configured server, sorted by id.
    pub fn get_health_snapshot(&self) -> Vec<HealthSnapshot> {
        self.servers
            .iter()
            .map(|(id, entry)| entry.health.snapshot(id))
            .collect()
    }

    /// Close every transport, swallowing individual errors.
    pub async fn close_all(&self) {
        for entry in self.servers.values() {
            let conn = entry.connection.lock().await.take();
            if let Some(conn) = conn {
                conn.transport.close().await;
                entry.health.record_disconnected(None);
            }
        }
    }

    async fn run_operation<T, F, Fut>(
        &self,
        server_id: &str,
        op: &str,
        f: F,
    ) -> Result<T, UpstreamError>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let entry = self
            .servers
            .get(server_id)
            .ok_or_else(|| UpstreamError::UnknownServer {
                id: server_id.to_string(),
            })?;

        entry.health.record_call();
        if !entry.config.enabled {
            return Err(UpstreamError::Disabled {
                id: server_id.to_string(),
            });
        }

        let max_attempts = match entry.config.transport.kind() {
            TransportKind::Stdio => self.retry.stdio_retries as u64 + 1,
            TransportKind::Http => 1,
        };

        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let result = match self.get_connection(entry).await {
                Ok(conn) => f(conn).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    entry.health.record_success();
                    return Ok(value);
                }
                Err(error) => {
                    let streak = entry.health.record_attempt_failure(&error.to_string());
                    self.dispose_connection(entry).await;
                    let delay = backoff_delay(&self.retry, streak);
                    entry.health.set_next_retry_at(
                        Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );

                    if attempt < max_attempts {
                        entry.health.record_restart();
                        tracing::warn!(
                            server_id = %server_id,
                            op = %op,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "upstream.retry"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    entry.health.record_call_failed();
                    return Err(error);
                }
            }
        }
    }

    /// Get or establish the single connection for a server. Holding the
    /// slot mutex across establishment gives at-most-one in-flight attempt;
    /// concurrent callers block here and then share the stored connection.
    async fn get_connection(
        &self,
        entry: &Arc<ServerEntry>,
    ) -> Result<Arc<Connection>, UpstreamError> {
        let mut slot = entry.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        // An armed retry gate delays reconnects of restartable transports.
        if entry.config.transport.kind() == TransportKind::Stdio {
            if let Some(at) = entry.health.next_retry_at() {
                let now = Utc::now();
                if at > now {
                    let wait = (at - now).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let transport = self.build_transport(entry)?;
        let conn = Arc::new(Connection::new(transport));
        if let Err(e) = conn.initialize().await {
            conn.transport.close().await;
            return Err(e);
        }

        entry.health.record_connected();
        tracing::info!(server_id = %entry.config.id, "upstream connected");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn build_transport(
        &self,
        entry: &Arc<ServerEntry>,
    ) -> Result<Arc<dyn Transport>, UpstreamError> {
        match &entry.config.transport {
            TransportConfig::Http { url, bearer_env } => Ok(Arc::new(HttpTransport::connect(
                &entry.config.id,
                url,
                bearer_env.as_deref(),
            )?)),
            TransportConfig::Stdio {
                command,
                args,
                cwd,
                env,
                stderr,
            } => {
                let health = Arc::clone(&entry.health);
                let on_close = Arc::new(move |reason: String| {
                    health.record_disconnected(Some(reason));
                });
                Ok(Arc::new(StdioTransport::spawn(
                    &entry.config.id,
                    command,
                    args,
                    cwd.as_deref(),
                    env,
                    *stderr,
                    on_close,
                )?))
            }
        }
    }

    async fn dispose_connection(&self, entry: &Arc<ServerEntry>) {
        let conn = entry.connection.lock().await.take();
        if let Some(conn) = conn {
            conn.transport.close().await;
        }
        entry.health.record_disconnected(None);
    }
}

#[async_trait]
impl UpstreamInvoker for UpstreamManager {
    async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, UpstreamError> {
        UpstreamManager::call_tool(self, server_id, name, arguments).await
    }
}

#[async_trait]
impl ToolSource for UpstreamManager {
    fn server_configs(&self) -> Vec<UpstreamConfig> {
        self.list_server_configs()
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, UpstreamError> {
        UpstreamManager::list_tools(self, server_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let retry = RetryConfig {
            stdio_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_500,
        };
        let mut previous = Duration::ZERO;
        for failures in 1..=16 {
            let delay = backoff_delay(&retry, failures);
            assert!(delay >= previous, "backoff decreased at {failures}");
            assert!(delay <= Duration::from_millis(retry.max_backoff_ms));
            previous = delay;
        }
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 5), Duration::from_millis(1_500));
    }

    #[test]
    fn test_backoff_survives_huge_streaks() {
        let retry = RetryConfig {
            stdio_retries: 1,
            base_backoff_ms: u64::MAX / 2,
            max_backoff_ms: 10_000,
        };
        assert_eq!(backoff_delay(&retry, 64), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn test_unknown_server_is_rejected() {
        let manager = UpstreamManager::new(Vec::new(), RetryConfig::default());
        let result = manager.list_tools("ghost").await;
        assert!(matches!(result, Err(UpstreamError::UnknownServer { .. })));
    }
}
