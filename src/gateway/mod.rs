//! The two-operation surface exposed to the model.
//!
//! `search` runs a snippet against the local catalog (discovery);
//! `execute` runs a snippet that may invoke upstream tools through the
//! proxy. Both keep the model-facing prompt surface flat no matter how
//! many upstreams are connected: the snippet shape never changes, only
//! what the injected host APIs can reach.

pub mod normalize;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::catalog::{CatalogStore, ToolQuery};
use crate::config::SandboxSettings;
use crate::gateway::normalize::normalize_execute_result;
use crate::proxy::{ToolCallRequest, ToolProxy};
use crate::sandbox::{GlobalValue, Globals, SandboxLimits, SandboxRuntime, serialize_with_limit};

/// Response envelope for both tools, shaped like an MCP tool result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub content: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl GatewayResponse {
    fn success(value: Value, max_chars: usize) -> Self {
        let text = serialize_with_limit(&value, max_chars);
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            structured_content: Some(json!({ "result": value })),
            is_error: false,
        }
    }

    fn failure(op: &str, message: &str) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": format!("{op}() failed: {message}") })],
            structured_content: None,
            is_error: true,
        }
    }
}

/// Gateway facade wiring the sandbox to the catalog and the proxy.
pub struct ToolGateway {
    catalog: Arc<CatalogStore>,
    proxy: Arc<ToolProxy>,
    sandbox: SandboxRuntime,
    max_result_chars: usize,
}

impl ToolGateway {
    pub fn new(
        catalog: Arc<CatalogStore>,
        proxy: Arc<ToolProxy>,
        settings: &SandboxSettings,
    ) -> Self {
        let limits = SandboxLimits::default()
            .with_timeout(settings.timeout())
            .with_max_code_length(settings.max_code_length)
            .with_max_heap_bytes(settings.max_heap_bytes);
        Self {
            catalog,
            proxy,
            sandbox: SandboxRuntime::new(limits),
            max_result_chars: settings.max_result_chars,
        }
    }

    /// Discovery: run `code` with the injected `catalog` API.
    pub async fn search(&self, code: &str) -> GatewayResponse {
        match self.sandbox.execute(code, self.search_globals()).await {
            Ok(value) => GatewayResponse::success(value, self.max_result_chars),
            Err(e) => GatewayResponse::failure("search", &e.to_string()),
        }
    }

    /// Invocation: run `code` with the injected `tool` API; the returned
    /// value is normalized before serialization.
    pub async fn execute(&self, code: &str) -> GatewayResponse {
        match self.sandbox.execute(code, self.execute_globals()).await {
            Ok(value) => {
                let normalized = normalize_execute_result(&value);
                GatewayResponse::success(normalized, self.max_result_chars)
            }
            Err(e) => GatewayResponse::failure("execute", &e.to_string()),
        }
    }

    fn search_globals(&self) -> Globals {
        let mut globals = Globals::new();

        let list_catalog = Arc::clone(&self.catalog);
        let find_catalog = Arc::clone(&self.catalog);
        let get_catalog = Arc::clone(&self.catalog);

        globals.insert(
            "catalog",
            GlobalValue::object([
                (
                    "listServers",
                    GlobalValue::function(move |_args| {
                        let catalog = Arc::clone(&list_catalog);
                        Box::pin(async move {
                            let servers = catalog.list_servers().await?;
                            Ok(serde_json::to_value(servers)?)
                        })
                    }),
                ),
                (
                    "findTools",
                    GlobalValue::function(move |args| {
                        let catalog = Arc::clone(&find_catalog);
                        Box::pin(async move {
                            let query = match args.into_iter().next() {
                                Some(v) if !v.is_null() => serde_json::from_value::<ToolQuery>(v)
                                    .map_err(|e| {
                                        anyhow::anyhow!("invalid findTools arguments: {e}")
                                    })?,
                                _ => ToolQuery::default(),
                            };
                            let tools = catalog.search_tools(&query).await?;
                            Ok(serde_json::to_value(tools)?)
                        })
                    }),
                ),
                (
                    "getTool",
                    GlobalValue::function(move |args| {
                        let catalog = Arc::clone(&get_catalog);
                        Box::pin(async move {
                            let mut args = args.into_iter();
                            let server_id = args
                                .next()
                                .and_then(|v| v.as_str().map(str::to_string))
                                .ok_or_else(|| {
                                    anyhow::anyhow!(
                                        "getTool(serverId, toolName) requires two strings"
                                    )
                                })?;
                            let tool_name = args
                                .next()
                                .and_then(|v| v.as_str().map(str::to_string))
                                .ok_or_else(|| {
                                    anyhow::anyhow!(
                                        "getTool(serverId, toolName) requires two strings"
                                    )
                                })?;
                            match catalog.get_tool(&server_id, &tool_name).await? {
                                Some(tool) => Ok(serde_json::to_value(tool)?),
                                None => Ok(Value::Null),
                            }
                        })
                    }),
                ),
            ]),
        );
        globals
    }

    fn execute_globals(&self) -> Globals {
        let mut globals = Globals::new();
        let proxy = Arc::clone(&self.proxy);

        globals.insert(
            "tool",
            GlobalValue::object([(
                "call",
                GlobalValue::function(move |args| {
                    let proxy = Arc::clone(&proxy);
                    Box::pin(async move {
                        let request = args.into_iter().next().ok_or_else(|| {
                            anyhow::anyhow!(
                                "tool.call({{ serverId, name, arguments? }}) requires an argument"
                            )
                        })?;
                        let request: ToolCallRequest = serde_json::from_value(request)
                            .map_err(|e| anyhow::anyhow!("invalid tool.call arguments: {e}"))?;
                        let result = proxy.call(request).await?;
                        Ok(result)
                    })
                }),
            )]),
        );
        globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_envelope_shape() {
        let response = GatewayResponse::failure("execute", "boom");
        assert!(response.is_error);
        assert_eq!(
            response.content[0]["text"].as_str().unwrap(),
            "execute() failed: boom"
        );
        assert!(response.structured_content.is_none());

        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["isError"], json!(true));
        assert!(encoded.get("structuredContent").is_none());
    }

    #[test]
    fn test_success_envelope_mirrors_result() {
        let response = GatewayResponse::success(json!({"n": 1}), 1_000);
        assert!(!response.is_error);
        assert_eq!(
            response.structured_content.as_ref().unwrap()["result"],
            json!({"n": 1})
        );

        let encoded = serde_json::to_value(&response).unwrap();
        // isError is omitted when false.
        assert!(encoded.get("isError").is_none());
        assert_eq!(encoded["content"][0]["type"], json!("text"));
    }
}
