//! libSQL-backed catalog store.
//!
//! A local embedded database holding three tables: `servers`, `tools`
//! (unique on `(server_id, tool_name)`), and `snapshots` (unique on
//! `(server_id, snapshot_hash)`). Writes are transactional; tool-set
//! replacement is atomic so readers never observe a partial catalog.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde_json::Value;

use crate::catalog::{ServerRecord, SnapshotRecord, ToolQuery, ToolRecord, clamp_limit};
use crate::config::UpstreamConfig;
use crate::error::CatalogError;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        transport_kind TEXT NOT NULL,
        last_synced_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tools (
        server_id TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        title TEXT,
        description TEXT,
        input_schema TEXT NOT NULL,
        output_schema TEXT,
        annotations TEXT,
        searchable_text TEXT NOT NULL,
        snapshot_hash TEXT NOT NULL,
        PRIMARY KEY (server_id, tool_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tools_snapshot ON tools (server_id, snapshot_hash)",
    "CREATE TABLE IF NOT EXISTS snapshots (
        server_id TEXT NOT NULL,
        snapshot_hash TEXT NOT NULL,
        snapshot_path TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (server_id, snapshot_hash)
    )",
];

/// Explicit column list for the tools table (matches positional access in
/// `row_to_tool`).
const TOOL_COLUMNS: &str = "server_id, tool_name, title, description, \
    input_schema, output_schema, annotations, searchable_text, snapshot_hash";

/// Catalog database handle, shared across components.
pub struct CatalogStore {
    db: Arc<Database>,
}

impl CatalogStore {
    /// Open (or create) the catalog at `path`. The parent directory is
    /// created if missing and migrations run idempotently.
    pub async fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CatalogError::Open(format!("failed to create database directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CatalogError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory catalog for tests.
    pub async fn in_memory() -> Result<Self, CatalogError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| CatalogError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.migrate().await?;
        Ok(store)
    }

    /// Release the database handle. The catalog is shared by reference
    /// everywhere else, so the shutdown path calls this exactly once.
    pub fn close(self) {
        tracing::debug!("catalog store closed");
        drop(self.db);
    }

    /// New connection with a busy timeout so concurrent writers wait
    /// instead of failing instantly with "database is locked".
    async fn connect(&self) -> Result<Connection, CatalogError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| CatalogError::Open(e.to_string()))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| CatalogError::Open(e.to_string()))?;
        Ok(conn)
    }

    async fn migrate(&self) -> Result<(), CatalogError> {
        let conn = self.connect().await?;
        for statement in MIGRATIONS {
            conn.execute(statement, ())
                .await
                .map_err(|e| CatalogError::Query(e.to_string()))?;
        }
        Ok(())
    }

    /// Idempotent bulk upsert of server records by id. `last_synced_at`
    /// is preserved across upserts.
    pub async fn upsert_servers(&self, configs: &[UpstreamConfig]) -> Result<(), CatalogError> {
        let conn = self.connect().await?;
        for config in configs {
            conn.execute(
                "INSERT INTO servers (id, name, enabled, transport_kind) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    transport_kind = excluded.transport_kind",
                params![
                    config.id.as_str(),
                    config.display_name(),
                    config.enabled as i64,
                    config.transport.kind().as_str(),
                ],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;
        }
        Ok(())
    }

    /// Atomically replace the tool set for one server: delete the old rows,
    /// insert the new set, register the snapshot (ignoring duplicates), and
    /// stamp `last_synced_at`, all in one transaction.
    pub async fn replace_server_tools(
        &self,
        server_id: &str,
        snapshot_hash: &str,
        snapshot_path: &str,
        tools: &[ToolRecord],
    ) -> Result<(), CatalogError> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        tx.execute(
            "DELETE FROM tools WHERE server_id = ?1",
            params![server_id],
        )
        .await
        .map_err(|e| CatalogError::Query(e.to_string()))?;

        for tool in tools {
            tx.execute(
                "INSERT INTO tools (server_id, tool_name, title, description,
                    input_schema, output_schema, annotations, searchable_text, snapshot_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    tool.server_id.as_str(),
                    tool.tool_name.as_str(),
                    opt_text(tool.title.as_deref()),
                    opt_text(tool.description.as_deref()),
                    json_text(&tool.input_schema)?,
                    opt_json_text(tool.output_schema.as_ref())?,
                    opt_json_text(tool.annotations.as_ref())?,
                    tool.searchable_text.as_str(),
                    tool.snapshot_hash.as_str(),
                ],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;
        }

        tx.execute(
            "INSERT OR IGNORE INTO snapshots (server_id, snapshot_hash, snapshot_path, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![server_id, snapshot_hash, snapshot_path, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| CatalogError::Query(e.to_string()))?;

        tx.execute(
            "UPDATE servers SET last_synced_at = ?2 WHERE id = ?1",
            params![server_id, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| CatalogError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))
    }

    /// All server records ordered by id.
    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>, CatalogError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, enabled, transport_kind, last_synced_at
                 FROM servers ORDER BY id",
                (),
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        let mut servers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?
        {
            servers.push(ServerRecord {
                id: get_text(&row, 0),
                name: get_text(&row, 1),
                enabled: get_i64(&row, 2) != 0,
                transport: get_text(&row, 3),
                last_synced_at: get_opt_ts(&row, 4),
            });
        }
        Ok(servers)
    }

    /// Single server lookup.
    pub async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>, CatalogError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, enabled, transport_kind, last_synced_at
                 FROM servers WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(ServerRecord {
                id: get_text(&row, 0),
                name: get_text(&row, 1),
                enabled: get_i64(&row, 2) != 0,
                transport: get_text(&row, 3),
                last_synced_at: get_opt_ts(&row, 4),
            })),
            None => Ok(None),
        }
    }

    /// Substring search over the catalog. Deterministic ordering by
    /// `(server_id, tool_name)`; limit clamped to `[1, 100]` (default 30).
    pub async fn search_tools(&self, query: &ToolQuery) -> Result<Vec<ToolRecord>, CatalogError> {
        let limit = clamp_limit(query.limit);
        let mut sql = format!("SELECT {TOOL_COLUMNS} FROM tools");
        let mut clauses = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(server_id) = &query.server_id {
            args.push(libsql::Value::Text(server_id.clone()));
            clauses.push(format!("server_id = ?{}", args.len()));
        }
        if let Some(text) = query.query.as_deref().filter(|q| !q.is_empty()) {
            args.push(libsql::Value::Text(text.to_lowercase()));
            clauses.push(format!("instr(searchable_text, ?{}) > 0", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        args.push(libsql::Value::Integer(limit));
        sql.push_str(&format!(" ORDER BY server_id, tool_name LIMIT ?{}", args.len()));

        let conn = self.connect().await?;
        let mut rows = conn
            .query(&sql, args)
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        let mut tools = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?
        {
            tools.push(row_to_tool(&row));
        }
        Ok(tools)
    }

    /// Single-row tool lookup.
    pub async fn get_tool(
        &self,
        server_id: &str,
        tool_name: &str,
    ) -> Result<Option<ToolRecord>, CatalogError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TOOL_COLUMNS} FROM tools WHERE server_id = ?1 AND tool_name = ?2"
                ),
                params![server_id, tool_name],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_tool(&row))),
            None => Ok(None),
        }
    }

    /// Most recent snapshot registration for one server.
    pub async fn latest_snapshot(
        &self,
        server_id: &str,
    ) -> Result<Option<SnapshotRecord>, CatalogError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT server_id, snapshot_hash, snapshot_path, created_at
                 FROM snapshots WHERE server_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![server_id],
            )
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| CatalogError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(SnapshotRecord {
                server_id: get_text(&row, 0),
                snapshot_hash: get_text(&row, 1),
                snapshot_path: get_text(&row, 2),
                created_at: get_opt_ts(&row, 3).unwrap_or(DateTime::UNIX_EPOCH),
            })),
            None => Ok(None),
        }
    }
}

// ==================== Row helpers ====================

fn row_to_tool(row: &libsql::Row) -> ToolRecord {
    ToolRecord {
        server_id: get_text(row, 0),
        tool_name: get_text(row, 1),
        title: get_opt_text(row, 2),
        description: get_opt_text(row, 3),
        // A corrupted row degrades to an empty schema / absent metadata
        // instead of failing the whole query.
        input_schema: get_opt_text(row, 4)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        output_schema: get_opt_text(row, 5).and_then(|s| serde_json::from_str(&s).ok()),
        annotations: get_opt_text(row, 6).and_then(|s| serde_json::from_str(&s).ok()),
        searchable_text: get_text(row, 7),
        snapshot_hash: get_text(row, 8),
    }
}

fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Returns None for SQL NULL, preserves empty strings as Some("").
fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

fn get_opt_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC 3339 with millisecond precision, the canonical storage format.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn json_text(value: &Value) -> Result<String, CatalogError> {
    serde_json::to_string(value).map_err(|e| CatalogError::Serialization(e.to_string()))
}

fn opt_json_text(value: Option<&Value>) -> Result<libsql::Value, CatalogError> {
    match value {
        Some(v) => Ok(libsql::Value::Text(json_text(v)?)),
        None => Ok(libsql::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::TransportConfig;

    fn server(id: &str) -> UpstreamConfig {
        UpstreamConfig::new(
            id,
            TransportConfig::Http {
                url: format!("https://{id}.example.com"),
                bearer_env: None,
            },
        )
    }

    fn tool(server_id: &str, name: &str, hash: &str) -> ToolRecord {
        ToolRecord {
            server_id: server_id.to_string(),
            tool_name: name.to_string(),
            title: Some(format!("{name} title")),
            description: Some(format!("does {name} things")),
            input_schema: json!({"type": "object"}),
            output_schema: None,
            annotations: None,
            searchable_text: format!("{name} does {name} things").to_lowercase(),
            snapshot_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_servers_is_idempotent() {
        let store = CatalogStore::in_memory().await.unwrap();
        let configs = vec![server("alpha"), server("beta")];

        store.upsert_servers(&configs).await.unwrap();
        store.upsert_servers(&configs).await.unwrap();

        let servers = store.list_servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, "alpha");
        assert_eq!(servers[1].id, "beta");
    }

    #[tokio::test]
    async fn test_upsert_preserves_last_synced_at() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();
        store
            .replace_server_tools("alpha", "hash0", "/tmp/a.json", &[])
            .await
            .unwrap();

        let before = store.get_server("alpha").await.unwrap().unwrap();
        assert!(before.last_synced_at.is_some());

        store.upsert_servers(&[server("alpha")]).await.unwrap();
        let after = store.get_server("alpha").await.unwrap().unwrap();
        assert_eq!(after.last_synced_at, before.last_synced_at);
    }

    #[tokio::test]
    async fn test_replace_server_tools_is_atomic_and_exact() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();

        let old = vec![tool("alpha", "read", "h1"), tool("alpha", "write", "h1")];
        store
            .replace_server_tools("alpha", "h1", "/snap/1.json", &old)
            .await
            .unwrap();

        let new = vec![tool("alpha", "read", "h2"), tool("alpha", "delete", "h2")];
        store
            .replace_server_tools("alpha", "h2", "/snap/2.json", &new)
            .await
            .unwrap();

        // Every tool from the new set is present, the old-only tool is gone.
        for t in &new {
            let found = store.get_tool("alpha", &t.tool_name).await.unwrap().unwrap();
            assert_eq!(&found, t);
        }
        assert!(store.get_tool("alpha", "write").await.unwrap().is_none());

        // All rows share the latest snapshot hash.
        let rows = store.search_tools(&ToolQuery::default()).await.unwrap();
        assert!(rows.iter().all(|t| t.snapshot_hash == "h2"));
        let snap = store.latest_snapshot("alpha").await.unwrap().unwrap();
        assert_eq!(snap.snapshot_hash, "h2");
    }

    #[tokio::test]
    async fn test_replace_is_idempotent_and_snapshot_inserted_once() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();

        let tools = vec![tool("alpha", "read", "h1")];
        store
            .replace_server_tools("alpha", "h1", "/snap/1.json", &tools)
            .await
            .unwrap();
        store
            .replace_server_tools("alpha", "h1", "/snap/1.json", &tools)
            .await
            .unwrap();

        let rows = store.search_tools(&ToolQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);

        let conn = store.connect().await.unwrap();
        let mut count_rows = conn
            .query(
                "SELECT COUNT(*) FROM snapshots WHERE server_id = 'alpha'",
                (),
            )
            .await
            .unwrap();
        let row = count_rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_ordering_and_limit() {
        let store = CatalogStore::in_memory().await.unwrap();
        store
            .upsert_servers(&[server("beta"), server("alpha")])
            .await
            .unwrap();
        store
            .replace_server_tools(
                "beta",
                "hb",
                "/snap/b.json",
                &[tool("beta", "zeta", "hb"), tool("beta", "alef", "hb")],
            )
            .await
            .unwrap();
        store
            .replace_server_tools("alpha", "ha", "/snap/a.json", &[tool("alpha", "mid", "ha")])
            .await
            .unwrap();

        let all = store.search_tools(&ToolQuery::default()).await.unwrap();
        let keys: Vec<(String, String)> = all
            .iter()
            .map(|t| (t.server_id.clone(), t.tool_name.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let capped = store
            .search_tools(&ToolQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_search_substring_is_case_insensitive() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();
        store
            .replace_server_tools(
                "alpha",
                "h1",
                "/snap/1.json",
                &[tool("alpha", "read_file", "h1"), tool("alpha", "list_dir", "h1")],
            )
            .await
            .unwrap();

        let hits = store
            .search_tools(&ToolQuery {
                query: Some("READ_".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_name, "read_file");

        let scoped = store
            .search_tools(&ToolQuery {
                server_id: Some("missing".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(scoped.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_schema_rows_degrade_gracefully() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();
        store
            .replace_server_tools("alpha", "h1", "/snap/1.json", &[tool("alpha", "read", "h1")])
            .await
            .unwrap();

        // Corrupt the stored JSON behind the store's back.
        let conn = store.connect().await.unwrap();
        conn.execute(
            "UPDATE tools SET input_schema = 'not json', annotations = '{broken'
             WHERE server_id = 'alpha'",
            (),
        )
        .await
        .unwrap();

        let t = store.get_tool("alpha", "read").await.unwrap().unwrap();
        assert_eq!(t.input_schema, json!({}));
        assert!(t.annotations.is_none());
    }

    #[tokio::test]
    async fn test_null_output_schema_preserved() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.upsert_servers(&[server("alpha")]).await.unwrap();
        let mut t = tool("alpha", "read", "h1");
        t.output_schema = None;
        t.annotations = Some(json!({"readOnlyHint": true}));
        store
            .replace_server_tools("alpha", "h1", "/snap/1.json", &[t])
            .await
            .unwrap();

        let found = store.get_tool("alpha", "read").await.unwrap().unwrap();
        assert!(found.output_schema.is_none());
        assert_eq!(found.annotations, Some(json!({"readOnlyHint": true})));
    }
}
