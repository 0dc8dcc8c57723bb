//! JSON-RPC framing for the upstream tool protocol (MCP).
//!
//! Requests are built through the constructor helpers so every call site
//! agrees on method names and parameter shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Protocol revision advertised during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// An outgoing JSON-RPC request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    fn new(id: Option<u64>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn initialize(id: u64) -> Self {
        Self::new(
            Some(id),
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        )
    }

    pub fn initialized_notification() -> Self {
        Self::new(None, "notifications/initialized", None)
    }

    pub fn tools_list(id: u64) -> Self {
        Self::new(Some(id), "tools/list", Some(json!({})))
    }

    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(
            Some(id),
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An incoming JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    /// Numeric id, when present.
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// JSON-RPC error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One tool as described by an upstream in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Result payload of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_list_request() {
        let req = RpcRequest::tools_list(1);
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(1));
        assert!(!req.is_notification());
    }

    #[test]
    fn test_tools_call_request() {
        let req = RpcRequest::tools_call(2, "read_file", json!({"path": "/tmp"}));
        assert_eq!(req.method, "tools/call");
        let params = req.params.unwrap();
        assert_eq!(params["name"], "read_file");
        assert_eq!(params["arguments"]["path"], "/tmp");
    }

    #[test]
    fn test_notification_has_no_id() {
        let req = RpcRequest::initialized_notification();
        assert!(req.is_notification());
        let text = serde_json::to_string(&req).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let t: ToolDescriptor = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(t.input_schema, json!({}));
        assert!(t.title.is_none());
        assert!(t.output_schema.is_none());
    }

    #[test]
    fn test_tool_descriptor_camel_case() {
        let t: ToolDescriptor = serde_json::from_str(
            r#"{"name":"x","inputSchema":{"type":"object"},"outputSchema":{"type":"string"}}"#,
        )
        .unwrap();
        assert_eq!(t.input_schema, json!({"type": "object"}));
        assert_eq!(t.output_schema, Some(json!({"type": "string"})));
    }
}
