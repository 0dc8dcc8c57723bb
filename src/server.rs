//! Thin stdio JSON-RPC server exposing the two gateway tools.
//!
//! This is the conventional bootstrap loop, not the hardened inbound
//! listener: newline-delimited JSON-RPC on stdin/stdout, three methods
//! (`initialize`, `tools/list`, `tools/call`) plus `ping`. Logs go to
//! stderr so stdout stays a clean wire.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::gateway::ToolGateway;
use crate::upstream::protocol::PROTOCOL_VERSION;

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub struct GatewayServer {
    gateway: Arc<ToolGateway>,
}

impl GatewayServer {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self { gateway }
    }

    /// Serve until stdin closes.
    pub async fn run(&self) -> std::io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    write_response(
                        &mut stdout,
                        error_response(Value::Null, PARSE_ERROR, &format!("parse error: {e}")),
                    )
                    .await?;
                    continue;
                }
            };

            // Notifications get no response.
            let Some(id) = request.get("id").cloned() else {
                continue;
            };

            let response = self.handle(id, &request).await;
            write_response(&mut stdout, response).await?;
        }
        Ok(())
    }

    async fn handle(&self, id: Value, request: &Value) -> Value {
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "initialize" => result_response(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "toolgate",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => result_response(id, json!({})),
            "tools/list" => result_response(id, json!({ "tools": tool_descriptors() })),
            "tools/call" => self.handle_tool_call(id, request).await,
            _ => error_response(id, METHOD_NOT_FOUND, &format!("unknown method: {method}")),
        }
    }

    async fn handle_tool_call(&self, id: Value, request: &Value) -> Value {
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let code = params
            .get("arguments")
            .and_then(|a| a.get("code"))
            .and_then(Value::as_str);

        let Some(code) = code else {
            return error_response(id, INVALID_PARAMS, "arguments.code must be a string");
        };

        let response = match name {
            "search" => self.gateway.search(code).await,
            "execute" => self.gateway.execute(code).await,
            _ => return error_response(id, INVALID_PARAMS, &format!("unknown tool: {name}")),
        };

        match serde_json::to_value(&response) {
            Ok(result) => result_response(id, result),
            Err(e) => error_response(id, INVALID_PARAMS, &format!("unserializable result: {e}")),
        }
    }
}

/// The constant two-tool surface, independent of connected upstreams.
fn tool_descriptors() -> Value {
    let code_input = json!({
        "type": "object",
        "properties": {
            "code": {
                "type": "string",
                "description": "A JavaScript expression evaluating to a callable, e.g. async () => { ... }",
            },
        },
        "required": ["code"],
    });
    json!([
        {
            "name": "search",
            "description": "Discover available tools. The snippet runs with an injected `catalog` API: catalog.listServers(), catalog.findTools({ query?, serverId?, limit? }), catalog.getTool(serverId, toolName).",
            "inputSchema": code_input,
        },
        {
            "name": "execute",
            "description": "Invoke upstream tools. The snippet runs with an injected `tool` API: tool.call({ serverId, name, arguments? }).",
            "inputSchema": code_input,
        },
    ])
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    response: Value,
) -> std::io::Result<()> {
    let mut line = response.to_string();
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}
