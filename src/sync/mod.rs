//! Catalog synchronizer.
//!
//! Pulls tool lists from upstreams, writes an immutable snapshot file per
//! fetch, and atomically replaces the server's catalog rows. Runs on
//! demand (targeted refresh), as a one-shot pass, or on a periodic tick.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::catalog::{CatalogStore, ToolRecord};
use crate::config::UpstreamConfig;
use crate::error::SyncError;
use crate::proxy::ServerRefresher;
use crate::upstream::{ToolDescriptor, ToolSource};

/// Smallest allowed interval for the periodic sync tick.
const MIN_INTERVAL_SECS: u64 = 10;

/// Hex prefix length of the snapshot content hash.
const SNAPSHOT_HASH_LEN: usize = 16;

/// Outcome of syncing one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub server_id: String,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SyncService {
    source: Arc<dyn ToolSource>,
    catalog: Arc<CatalogStore>,
    snapshot_dir: PathBuf,
}

impl SyncService {
    /// Create the service, ensuring the snapshot directory exists.
    pub fn new(
        source: Arc<dyn ToolSource>,
        catalog: Arc<CatalogStore>,
        snapshot_dir: PathBuf,
    ) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Self {
            source,
            catalog,
            snapshot_dir,
        })
    }

    /// Sync one server: fetch its tool list, write the snapshot file, and
    /// replace its catalog rows in one transaction.
    pub async fn sync_server(&self, server: &UpstreamConfig) -> Result<SyncSummary, SyncError> {
        tracing::info!(server_id = %server.id, "sync.start");

        let tools = self.source.list_tools(&server.id).await?;
        let fetched_at = Utc::now();

        let payload = json!({
            "fetchedAt": fetched_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "server": { "id": server.id.as_str(), "name": server.display_name() },
            "tools": &tools,
        });
        let serialized = serde_json::to_string(&payload)?;
        let hash = snapshot_hash(&serialized);

        let snapshot_path = self
            .snapshot_dir
            .join(&server.id)
            .join(format!("{}-{hash}.json", iso_filename(&fetched_at)));
        if let Some(parent) = snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&snapshot_path, &serialized).await?;

        let records: Vec<ToolRecord> = tools
            .iter()
            .map(|tool| normalize_tool(&server.id, tool, &hash))
            .collect();

        self.catalog
            .replace_server_tools(
                &server.id,
                &hash,
                &snapshot_path.to_string_lossy(),
                &records,
            )
            .await?;

        tracing::info!(
            server_id = %server.id,
            snapshot_hash = %hash,
            tool_count = records.len(),
            "sync.complete"
        );

        Ok(SyncSummary {
            server_id: server.id.clone(),
            tool_count: records.len(),
            snapshot_hash: Some(hash),
            error: None,
        })
    }

    /// Sync every enabled server sequentially, in configured order, and
    /// return one summary per server. A failing server never interrupts
    /// the others.
    pub async fn sync_all_servers(&self) -> Vec<SyncSummary> {
        let mut summaries = Vec::new();
        for server in self
            .source
            .server_configs()
            .into_iter()
            .filter(|s| s.enabled)
        {
            match self.sync_server(&server).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::warn!(server_id = %server.id, error = %e, "sync.server.failed");
                    summaries.push(SyncSummary {
                        server_id: server.id.clone(),
                        tool_count: 0,
                        snapshot_hash: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        summaries
    }

    /// Start the periodic sync tick (floor 10 seconds). Failures are
    /// logged and never terminate the scheduler. Overlapping ticks are not
    /// serialized; safety relies on the per-server replacement transaction.
    pub fn start_interval_sync(self: &Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let secs = interval_secs.max(MIN_INTERVAL_SECS);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick is consumed so the schedule starts
            // one interval from now.
            interval.tick().await;
            loop {
                interval.tick().await;
                for summary in service.sync_all_servers().await {
                    if let Some(error) = summary.error {
                        tracing::warn!(
                            server_id = %summary.server_id,
                            error = %error,
                            "sync.interval.failed"
                        );
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl ServerRefresher for SyncService {
    async fn refresh_server(&self, server_id: &str) -> Result<(), crate::error::SyncError> {
        let server = self
            .source
            .server_configs()
            .into_iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| {
                SyncError::Upstream(crate::error::UpstreamError::UnknownServer {
                    id: server_id.to_string(),
                })
            })?;
        self.sync_server(&server).await?;
        Ok(())
    }
}

/// First 16 hex chars of the SHA-256 of the serialized payload.
fn snapshot_hash(serialized: &str) -> String {
    let digest = Sha256::digest(serialized.as_bytes());
    let mut hex = String::with_capacity(SNAPSHOT_HASH_LEN);
    for byte in digest.iter().take(SNAPSHOT_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Timestamp suitable for a filename: RFC 3339 with `.` and `:` replaced.
fn iso_filename(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(['.', ':'], "-")
}

/// Project an upstream tool descriptor onto a catalog row, deriving the
/// lowercase search text.
fn normalize_tool(server_id: &str, tool: &ToolDescriptor, snapshot_hash: &str) -> ToolRecord {
    let input_schema = match &tool.input_schema {
        serde_json::Value::Object(_) => tool.input_schema.clone(),
        _ => serde_json::Value::Object(serde_json::Map::new()),
    };

    let schema_text = serde_json::to_string(&input_schema).unwrap_or_default();
    let annotations_text = tool
        .annotations
        .as_ref()
        .and_then(|a| serde_json::to_string(a).ok())
        .unwrap_or_default();

    let searchable_text = [
        tool.name.as_str(),
        tool.title.as_deref().unwrap_or(""),
        tool.description.as_deref().unwrap_or(""),
        schema_text.as_str(),
        annotations_text.as_str(),
    ]
    .iter()
    .filter(|part| !part.is_empty())
    .map(|part| part.to_lowercase())
    .collect::<Vec<_>>()
    .join(" ");

    ToolRecord {
        server_id: server_id.to_string(),
        tool_name: tool.name.clone(),
        title: tool.title.clone(),
        description: tool.description.clone(),
        input_schema,
        output_schema: tool.output_schema.clone(),
        annotations: tool.annotations.clone(),
        searchable_text,
        snapshot_hash: snapshot_hash.to_string(),
    }
}
