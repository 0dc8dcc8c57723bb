//! Local catalog of upstream servers and their tools.
//!
//! The catalog is the indexed projection of the latest snapshot per server.
//! Rows are only written by the sync service; everything else reads.

mod store;

pub use store::CatalogStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A known upstream server, as recorded in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// One tool of one server. `(server_id, tool_name)` is unique per catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub server_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stored verbatim; always a well-formed JSON object.
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub annotations: Option<Value>,
    /// Lowercase concatenation used for substring search. Not part of the
    /// model-facing shape.
    #[serde(skip_serializing)]
    pub searchable_text: String,
    /// Ties the row to the snapshot that produced it.
    pub snapshot_hash: String,
}

/// An immutable snapshot registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub server_id: String,
    pub snapshot_hash: String,
    pub snapshot_path: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for [`CatalogStore::search_tools`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolQuery {
    /// Substring to match against `searchable_text` (case-insensitive).
    #[serde(default)]
    pub query: Option<String>,
    /// Restrict to one server.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Row cap; clamped to `[1, 100]`, default 30.
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Default and bounds for the search row cap.
pub(crate) const SEARCH_LIMIT_DEFAULT: i64 = 30;
pub(crate) const SEARCH_LIMIT_MAX: i64 = 100;

pub(crate) fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(SEARCH_LIMIT_DEFAULT).clamp(1, SEARCH_LIMIT_MAX)
}
