//! Health and retry behavior of the upstream manager, exercised against
//! real (failing) transports.

use serde_json::json;

use toolgate::config::{RetryConfig, StderrMode, TransportConfig, UpstreamConfig};
use toolgate::upstream::{ServerStatus, UpstreamManager};

fn stdio_server(id: &str, command: &str) -> UpstreamConfig {
    UpstreamConfig::new(
        id,
        TransportConfig::Stdio {
            command: command.to_string(),
            args: Vec::new(),
            cwd: None,
            env: Default::default(),
            stderr: StderrMode::Null,
        },
    )
}

#[tokio::test]
async fn test_disabled_server_health_snapshot() {
    let mut config = UpstreamConfig::new(
        "sleepy",
        TransportConfig::Http {
            url: "https://sleepy.example.com/mcp".to_string(),
            bearer_env: None,
        },
    );
    config.enabled = false;

    let manager = UpstreamManager::new(vec![config], RetryConfig::default());
    let snapshots = manager.get_health_snapshot();

    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    assert_eq!(snap.server_id, "sleepy");
    assert_eq!(snap.status, ServerStatus::Disabled);
    assert!(!snap.enabled);
    assert!(!snap.connected);
    assert_eq!(snap.total_calls, 0);
    assert_eq!(snap.successful_calls, 0);
    assert_eq!(snap.failed_calls, 0);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(snap.restarts, 0);
    assert!(snap.last_error.is_none());
}

#[tokio::test]
async fn test_stdio_retry_with_backoff_on_bogus_command() {
    let manager = UpstreamManager::new(
        vec![stdio_server("bogus", "/nonexistent/toolgate-bogus-server")],
        RetryConfig {
            stdio_retries: 1,
            base_backoff_ms: 10,
            max_backoff_ms: 20,
        },
    );

    let result = manager.list_tools("bogus").await;
    assert!(result.is_err(), "listTools against a bogus command must fail");

    let snapshots = manager.get_health_snapshot();
    let snap = &snapshots[0];
    assert!(snap.failed_calls >= 1, "snapshot: {snap:?}");
    assert!(snap.consecutive_failures >= 1, "snapshot: {snap:?}");
    assert!(snap.restarts >= 1, "snapshot: {snap:?}");
    assert!(snap.last_error.is_some(), "snapshot: {snap:?}");
    assert!(snap.next_retry_at.is_some(), "snapshot: {snap:?}");
    assert_eq!(snap.status, ServerStatus::Degraded);
    assert_eq!(snap.total_calls, 1);
}

#[tokio::test]
async fn test_disabled_server_rejects_operations() {
    let mut config = stdio_server("off", "true");
    config.enabled = false;
    let manager = UpstreamManager::new(vec![config], RetryConfig::default());

    let result = manager.call_tool("off", "anything", json!({})).await;
    assert!(result.is_err());

    // The rejected call is still counted, but nothing else moves.
    let snap = &manager.get_health_snapshot()[0];
    assert_eq!(snap.total_calls, 1);
    assert_eq!(snap.failed_calls, 0);
    assert_eq!(snap.consecutive_failures, 0);
}

#[tokio::test]
async fn test_health_snapshot_is_sorted_by_id() {
    let manager = UpstreamManager::new(
        vec![
            stdio_server("zulu", "true"),
            stdio_server("alpha", "true"),
            stdio_server("mike", "true"),
        ],
        RetryConfig::default(),
    );
    let ids: Vec<String> = manager
        .get_health_snapshot()
        .into_iter()
        .map(|s| s.server_id)
        .collect();
    assert_eq!(ids, vec!["alpha", "mike", "zulu"]);
}

#[tokio::test]
async fn test_down_status_after_repeated_failures() {
    let manager = UpstreamManager::new(
        vec![stdio_server("flaky", "/nonexistent/toolgate-bogus-server")],
        RetryConfig {
            stdio_retries: 0,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        },
    );

    for _ in 0..3 {
        let _ = manager.list_tools("flaky").await;
    }

    let snap = &manager.get_health_snapshot()[0];
    assert!(snap.consecutive_failures >= 3);
    assert_eq!(snap.status, ServerStatus::Down);
    assert_eq!(snap.total_calls, 3);
    assert_eq!(snap.failed_calls, 3);
}
