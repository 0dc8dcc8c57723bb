//! Upstream transports.
//!
//! Two transports exist: streamable HTTP (stateless per request, JSON or
//! SSE responses) and stdio (a child process speaking newline-delimited
//! JSON-RPC). Both sit behind the [`Transport`] trait so the connection
//! manager never branches on the concrete kind.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use crate::config::{StderrMode, TransportKind};
use crate::error::UpstreamError;
use crate::upstream::protocol::{RpcRequest, RpcResponse};

/// Per-request wall clock for both transports.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Invoked when a transport observes an unexpected close (child exit,
/// broken pipe). The argument is a short human-readable reason.
pub type CloseHook = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and await its response.
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, UpstreamError>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: RpcRequest) -> Result<(), UpstreamError>;

    /// Tear the transport down. Errors during close are swallowed.
    async fn close(&self);
}

// ==================== Streamable HTTP ====================

/// Streamable HTTP transport. Each request is an independent POST; the
/// server may reply with plain JSON or a one-shot SSE stream. A session id
/// handed out by the server is echoed back on subsequent requests.
pub struct HttpTransport {
    server_id: String,
    url: String,
    bearer: Option<SecretString>,
    client: reqwest::Client,
    session_id: std::sync::RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn connect(
        server_id: &str,
        url: &str,
        bearer_env: Option<&str>,
    ) -> Result<Self, UpstreamError> {
        let bearer = match bearer_env {
            Some(var) => {
                let token =
                    std::env::var(var).map_err(|_| UpstreamError::MissingCredential {
                        var: var.to_string(),
                    })?;
                Some(SecretString::new(token))
            }
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::ConnectFailed {
                id: server_id.to_string(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            bearer,
            client,
            session_id: std::sync::RwLock::new(None),
        })
    }

    async fn post(&self, body: &RpcRequest) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(token) = &self.bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        if let Some(session) = self.session_id.read().unwrap().clone() {
            builder = builder.header("Mcp-Session-Id", session);
        }

        let response = builder.send().await.map_err(|e| {
            // Surface the full cause chain; reqwest errors bury the
            // interesting part (DNS, TLS, refused) in the sources.
            let mut chain = format!("request failed: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                chain.push_str(&format!(" -> {cause}"));
                source = cause.source();
            }
            UpstreamError::Transport(chain)
        })?;

        if let Some(session) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap() = Some(session.to_string());
        }

        Ok(response)
    }

    async fn parse_response(
        &self,
        response: reqwest::Response,
    ) -> Result<RpcResponse, UpstreamError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Transport(format!(
                "server '{}' returned status {status}: {body}",
                self.server_id
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            // One-shot SSE: read chunks until a data line parses as a
            // complete JSON-RPC response.
            use futures::StreamExt;

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| {
                    UpstreamError::Transport(format!("failed to read SSE chunk: {e}"))
                })?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in buffer.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(parsed) = serde_json::from_str::<RpcResponse>(data) {
                            return Ok(parsed);
                        }
                    }
                }
            }

            Err(UpstreamError::Protocol(format!(
                "no valid data in SSE response: {buffer}"
            )))
        } else {
            response
                .json()
                .await
                .map_err(|e| UpstreamError::Protocol(format!("invalid JSON-RPC response: {e}")))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, UpstreamError> {
        let response = self.post(&request).await?;
        self.parse_response(response).await
    }

    async fn notify(&self, notification: RpcRequest) -> Result<(), UpstreamError> {
        let response = self.post(&notification).await?;
        // Notifications commonly come back 202/204 with an empty body.
        if response.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Transport(format!(
                "server '{}' rejected notification with status {}",
                self.server_id,
                response.status()
            )))
        }
    }

    async fn close(&self) {}
}

// ==================== stdio ====================

/// Child-process transport speaking newline-delimited JSON-RPC.
///
/// A reader task routes responses to waiting callers through a pending-id
/// map; child exit fails every pending request and fires the close hook.
#[derive(Debug)]
pub struct StdioTransport {
    server_id: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        cwd: Option<&std::path::Path>,
        env: &HashMap<String, String>,
        stderr: StderrMode,
        on_close: CloseHook,
    ) -> Result<Self, UpstreamError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match stderr {
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Null => Stdio::null(),
                StderrMode::Log => Stdio::piped(),
            })
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(env);

        let mut child = cmd.spawn().map_err(|e| UpstreamError::ConnectFailed {
            id: server_id.to_string(),
            reason: format!("failed to spawn `{command}`: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| UpstreamError::ConnectFailed {
            id: server_id.to_string(),
            reason: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| UpstreamError::ConnectFailed {
            id: server_id.to_string(),
            reason: "child stdout unavailable".to_string(),
        })?;

        let pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Reader task: route responses by id until EOF.
        {
            let server_id = server_id.to_string();
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<RpcResponse>(line) {
                                Ok(response) => {
                                    let Some(id) = response.id_u64() else {
                                        tracing::debug!(
                                            server_id = %server_id,
                                            "ignoring server-initiated message"
                                        );
                                        continue;
                                    };
                                    let sender = pending.lock().unwrap().remove(&id);
                                    if let Some(sender) = sender {
                                        let _ = sender.send(response);
                                    } else {
                                        tracing::debug!(
                                            server_id = %server_id,
                                            id,
                                            "response for unknown request id"
                                        );
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(
                                        server_id = %server_id,
                                        error = %e,
                                        "unparseable line from upstream"
                                    );
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                // Child went away: fail everything still waiting.
                pending.lock().unwrap().clear();
                if !closed.swap(true, Ordering::SeqCst) {
                    on_close(format!("stdio server '{server_id}' closed its pipe"));
                }
            });
        }

        if stderr == StderrMode::Log {
            if let Some(child_stderr) = child.stderr.take() {
                let server_id = server_id.to_string();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(child_stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(server_id = %server_id, "upstream stderr: {line}");
                    }
                });
            }
        }

        Ok(Self {
            server_id: server_id.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            closed,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport(format!(
                "stdio server '{}' is closed",
                self.server_id
            )));
        }
        let id = request.id.ok_or_else(|| {
            UpstreamError::Protocol("stdio request requires a numeric id".to_string())
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut line = serde_json::to_string(&request)
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                self.pending.lock().unwrap().remove(&id);
                return Err(UpstreamError::Transport(format!(
                    "failed to write to stdio server '{}': {e}",
                    self.server_id
                )));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(UpstreamError::Transport(format!(
                "stdio server '{}' closed before replying",
                self.server_id
            ))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(UpstreamError::Timeout {
                    id: self.server_id.clone(),
                    timeout: REQUEST_TIMEOUT,
                })
            }
        }
    }

    async fn notify(&self, notification: RpcRequest) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport(format!(
                "stdio server '{}' is closed",
                self.server_id
            )));
        }
        let mut line = serde_json::to_string(&notification)
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| {
            UpstreamError::Transport(format!(
                "failed to write to stdio server '{}': {e}",
                self.server_id
            ))
        })
    }

    async fn close(&self) {
        // Mark closed first so the reader task's EOF path stays quiet.
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(server_id = %self.server_id, "kill on close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bearer_env_is_an_error() {
        let result = HttpTransport::connect(
            "test",
            "https://mcp.example.com",
            Some("TOOLGATE_TEST_BEARER_THAT_DOES_NOT_EXIST"),
        );
        assert!(matches!(
            result,
            Err(UpstreamError::MissingCredential { .. })
        ));
    }

    #[test]
    fn test_http_transport_kind() {
        let transport = HttpTransport::connect("test", "https://mcp.example.com", None).unwrap();
        assert_eq!(transport.kind(), TransportKind::Http);
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure_surfaces_command() {
        let result = StdioTransport::spawn(
            "test",
            "/nonexistent/toolgate-test-binary",
            &[],
            None,
            &HashMap::new(),
            StderrMode::Null,
            Arc::new(|_| {}),
        );
        match result {
            Err(UpstreamError::ConnectFailed { reason, .. }) => {
                assert!(reason.contains("/nonexistent/toolgate-test-binary"));
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stdio_round_trip_with_cat_like_child() {
        // `cat` echoes our request line back; a JSON-RPC request is not a
        // response, so the reader ignores it, but a crafted "response"
        // written as the request goes through the whole path.
        let transport = StdioTransport::spawn(
            "echo",
            "cat",
            &[],
            None,
            &HashMap::new(),
            StderrMode::Null,
            Arc::new(|_| {}),
        )
        .unwrap();

        // The echoed request has `method`, which RpcResponse tolerates via
        // unknown-field skipping, and the id routes back to us.
        let response = transport
            .request(RpcRequest::tools_list(7))
            .await
            .expect("echoed line should round-trip");
        assert_eq!(response.id_u64(), Some(7));

        transport.close().await;
    }
}
