//! End-to-end gateway tests: model-supplied snippets through the sandbox,
//! against a real in-memory catalog and a scripted upstream.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use toolgate::catalog::{CatalogStore, ToolRecord};
use toolgate::config::{SandboxSettings, TransportConfig, UpstreamConfig};
use toolgate::error::UpstreamError;
use toolgate::gateway::ToolGateway;
use toolgate::proxy::ToolProxy;
use toolgate::upstream::UpstreamInvoker;

struct EchoUpstream {
    calls: Mutex<Vec<(String, String, Value)>>,
    result: Value,
}

#[async_trait]
impl UpstreamInvoker for EchoUpstream {
    async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((server_id.to_string(), name.to_string(), arguments));
        Ok(self.result.clone())
    }
}

fn config(id: &str) -> UpstreamConfig {
    UpstreamConfig::new(
        id,
        TransportConfig::Http {
            url: format!("https://{id}.example.com/mcp"),
            bearer_env: None,
        },
    )
}

fn record(server_id: &str, name: &str) -> ToolRecord {
    ToolRecord {
        server_id: server_id.to_string(),
        tool_name: name.to_string(),
        title: Some(name.to_string()),
        description: Some(format!("{name} description")),
        input_schema: json!({"type": "object"}),
        output_schema: None,
        annotations: None,
        searchable_text: format!("{name} {name} description"),
        snapshot_hash: "testhash00000000".to_string(),
    }
}

async fn gateway_with(
    servers: Vec<UpstreamConfig>,
    tools: Vec<ToolRecord>,
    upstream_result: Value,
) -> (ToolGateway, Arc<EchoUpstream>) {
    let catalog = Arc::new(CatalogStore::in_memory().await.expect("catalog"));
    catalog.upsert_servers(&servers).await.expect("servers");
    let mut by_server: std::collections::HashMap<String, Vec<ToolRecord>> = Default::default();
    for tool in tools {
        by_server.entry(tool.server_id.clone()).or_default().push(tool);
    }
    for (server_id, tools) in by_server {
        catalog
            .replace_server_tools(&server_id, "testhash00000000", "/tmp/test.json", &tools)
            .await
            .expect("tools");
    }

    let upstream = Arc::new(EchoUpstream {
        calls: Mutex::new(Vec::new()),
        result: upstream_result,
    });
    let proxy = Arc::new(ToolProxy::new(
        Arc::clone(&catalog),
        Arc::clone(&upstream) as Arc<dyn UpstreamInvoker>,
        &servers,
    ));
    let gateway = ToolGateway::new(catalog, proxy, &SandboxSettings::default());
    (gateway, upstream)
}

#[tokio::test]
async fn test_search_snippet_sees_catalog() {
    let (gateway, _upstream) = gateway_with(
        vec![config("fs"), config("mail")],
        vec![record("fs", "read_file"), record("mail", "send")],
        Value::Null,
    )
    .await;

    let response = gateway
        .search(
            r#"async () => {
                const servers = await catalog.listServers();
                const hits = await catalog.findTools({ query: "read" });
                const one = await catalog.getTool("fs", "read_file");
                return {
                    servers: servers.map((s) => s.id),
                    hits: hits.map((t) => t.toolName),
                    found: one !== null,
                };
            }"#,
        )
        .await;

    assert!(!response.is_error, "response: {response:?}");
    let result = &response.structured_content.as_ref().unwrap()["result"];
    assert_eq!(result["servers"], json!(["fs", "mail"]));
    assert_eq!(result["hits"], json!(["read_file"]));
    assert_eq!(result["found"], json!(true));
}

#[tokio::test]
async fn test_search_get_tool_miss_returns_null() {
    let (gateway, _upstream) = gateway_with(vec![config("fs")], vec![], Value::Null).await;

    let response = gateway
        .search(r#"async () => catalog.getTool("fs", "nope")"#)
        .await;
    assert!(!response.is_error);
    assert_eq!(
        response.structured_content.as_ref().unwrap()["result"],
        Value::Null
    );
}

#[tokio::test]
async fn test_execute_routes_through_proxy_and_normalizes() {
    let big_text = "x".repeat(10_000);
    let (gateway, upstream) = gateway_with(
        vec![config("fs")],
        vec![record("fs", "read_file")],
        json!({"content": [{"type": "text", "text": big_text}]}),
    )
    .await;

    let response = gateway
        .execute(
            r#"async () => tool.call({ serverId: "fs", name: "read_file", arguments: { path: "/etc/hosts" } })"#,
        )
        .await;

    assert!(!response.is_error, "response: {response:?}");
    let calls = upstream.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "fs");
    assert_eq!(calls[0].1, "read_file");
    assert_eq!(calls[0].2, json!({"path": "/etc/hosts"}));

    // Normalization bounded the text item before serialization.
    let result = &response.structured_content.as_ref().unwrap()["result"];
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.len() < 10_000);
    assert!(text.contains("truncated"));
}

#[tokio::test]
async fn test_execute_error_envelope() {
    let (gateway, upstream) = gateway_with(vec![config("fs")], vec![], Value::Null).await;

    // "ghost" is not in the catalog: the proxy rejects, the snippet does
    // not catch, and the gateway wraps the failure.
    let response = gateway
        .execute(r#"async () => tool.call({ serverId: "ghost", name: "x" })"#)
        .await;

    assert!(response.is_error);
    let text = response.content[0]["text"].as_str().unwrap();
    assert!(text.starts_with("execute() failed:"), "got: {text}");
    assert!(upstream.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_search_timeout_envelope() {
    let servers = vec![config("fs")];
    let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
    catalog.upsert_servers(&servers).await.unwrap();
    let upstream = Arc::new(EchoUpstream {
        calls: Mutex::new(Vec::new()),
        result: Value::Null,
    });
    let proxy = Arc::new(ToolProxy::new(
        Arc::clone(&catalog),
        upstream as Arc<dyn UpstreamInvoker>,
        &servers,
    ));
    let settings = SandboxSettings {
        timeout_ms: 100,
        ..Default::default()
    };
    let gateway = ToolGateway::new(catalog, proxy, &settings);

    let response = gateway
        .search("async () => { await new Promise(() => {}); }")
        .await;

    assert!(response.is_error);
    let text = response.content[0]["text"].as_str().unwrap().to_lowercase();
    assert!(text.contains("timed out"), "got: {text}");
}

#[tokio::test]
async fn test_search_result_is_serialized_with_budget() {
    let servers = vec![config("fs")];
    let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
    catalog.upsert_servers(&servers).await.unwrap();
    let upstream = Arc::new(EchoUpstream {
        calls: Mutex::new(Vec::new()),
        result: Value::Null,
    });
    let proxy = Arc::new(ToolProxy::new(
        Arc::clone(&catalog),
        upstream as Arc<dyn UpstreamInvoker>,
        &servers,
    ));
    let settings = SandboxSettings {
        max_result_chars: 200,
        ..Default::default()
    };
    let gateway = ToolGateway::new(catalog, proxy, &settings);

    let response = gateway
        .search(r#"async () => ({ blob: "y".repeat(5000) })"#)
        .await;

    assert!(!response.is_error);
    let text = response.content[0]["text"].as_str().unwrap();
    assert!(text.chars().count() <= 200);
    assert!(text.contains("truncated"));
}
