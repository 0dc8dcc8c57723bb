//! Tool proxy: authorization, argument validation, and routing.
//!
//! Every model-initiated invocation passes through here. The proxy only
//! ever dispatches `(server_id, tool)` pairs that exist in the catalog and
//! pass the server's allow-list; argument validation uses compiled JSON
//! Schema validators cached per snapshot hash so a re-synced schema
//! invalidates its stale validator automatically.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::catalog::{CatalogStore, ToolRecord};
use crate::error::{ProxyError, SyncError};
use crate::upstream::UpstreamInvoker;

/// Targeted re-sync hook, implemented by the sync service. Injected so the
/// proxy can absorb catalog drift without depending on the sync module.
#[async_trait]
pub trait ServerRefresher: Send + Sync {
    async fn refresh_server(&self, server_id: &str) -> Result<(), SyncError>;
}

/// A model-initiated tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

type ValidatorKey = (String, String, String);

pub struct ToolProxy {
    catalog: Arc<CatalogStore>,
    upstream: Arc<dyn UpstreamInvoker>,
    refresher: Option<Arc<dyn ServerRefresher>>,
    /// Allow-list patterns per server id, frozen at bootstrap.
    allow_lists: HashMap<String, Vec<String>>,
    validators: RwLock<HashMap<ValidatorKey, Arc<jsonschema::Validator>>>,
}

impl ToolProxy {
    pub fn new(
        catalog: Arc<CatalogStore>,
        upstream: Arc<dyn UpstreamInvoker>,
        servers: &[crate::config::UpstreamConfig],
    ) -> Self {
        let allow_lists = servers
            .iter()
            .map(|s| (s.id.clone(), s.allow_tools.clone()))
            .collect();
        Self {
            catalog,
            upstream,
            refresher: None,
            allow_lists,
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn ServerRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Authorize, validate, and route one invocation. The upstream's
    /// result is returned verbatim.
    pub async fn call(&self, request: ToolCallRequest) -> Result<Value, ProxyError> {
        let ToolCallRequest {
            server_id,
            name,
            arguments,
        } = request;

        let server = self
            .catalog
            .get_server(&server_id)
            .await?
            .ok_or_else(|| ProxyError::UnknownServer {
                server_id: server_id.clone(),
            })?;
        if !server.enabled {
            return Err(ProxyError::ServerDisabled { server_id });
        }

        // A server with no configured allow-list denies everything; the
        // config default is `["*"]`, so this only bites drifted catalogs.
        let allowed = self
            .allow_lists
            .get(&server_id)
            .is_some_and(|patterns| tool_allowed(patterns, &name));
        if !allowed {
            return Err(ProxyError::NotAllowed {
                server_id,
                tool: name,
            });
        }

        let tool = match self.catalog.get_tool(&server_id, &name).await? {
            Some(tool) => tool,
            None => {
                // Catalog miss: the tool may exist upstream but postdate
                // the last sync. Refresh once and look again.
                self.try_refresh(&server_id, &name).await;
                self.catalog
                    .get_tool(&server_id, &name)
                    .await?
                    .ok_or_else(|| ProxyError::ToolNotFound {
                        server_id: server_id.clone(),
                        tool: name.clone(),
                    })?
            }
        };

        let arguments = arguments.unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        if let Err(original) = self.validate_arguments(&tool, &arguments) {
            // The stored schema may be stale. Refresh, re-fetch, and
            // revalidate; if it still fails, surface the original error so
            // the caller sees the user-visible cause.
            if self.refresher.is_some() {
                self.try_refresh(&server_id, &name).await;
                if let Some(refreshed) = self.catalog.get_tool(&server_id, &name).await? {
                    if self.validate_arguments(&refreshed, &arguments).is_ok() {
                        let result = self
                            .upstream
                            .call_tool(&server_id, &name, arguments)
                            .await?;
                        return Ok(result);
                    }
                }
            }
            return Err(original);
        }

        let result = self.upstream.call_tool(&server_id, &name, arguments).await?;
        Ok(result)
    }

    async fn try_refresh(&self, server_id: &str, tool: &str) {
        if let Some(refresher) = &self.refresher {
            tracing::info!(server_id = %server_id, tool = %tool, "proxy.refresh.start");
            if let Err(e) = refresher.refresh_server(server_id).await {
                tracing::warn!(server_id = %server_id, error = %e, "proxy.refresh.failed");
            }
        }
    }

    /// Validate arguments against the tool's input schema, compiling and
    /// caching the validator keyed by `(server, tool, snapshot_hash)`.
    fn validate_arguments(&self, tool: &ToolRecord, arguments: &Value) -> Result<(), ProxyError> {
        let key = (
            tool.server_id.clone(),
            tool.tool_name.clone(),
            tool.snapshot_hash.clone(),
        );

        let validator = {
            let cached = self.validators.read().unwrap().get(&key).cloned();
            match cached {
                Some(validator) => validator,
                None => {
                    let compiled = jsonschema::validator_for(&tool.input_schema).map_err(|e| {
                        ProxyError::SchemaCompile {
                            tool: tool.tool_name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    let validator = Arc::new(compiled);
                    let mut validators = self.validators.write().unwrap();
                    // Drop validators for older snapshots of the same tool.
                    validators.retain(|(server, name, _), _| {
                        server != &tool.server_id || name != &tool.tool_name
                    });
                    validators.insert(key, Arc::clone(&validator));
                    validator
                }
            }
        };

        if let Err(error) = validator.validate(arguments) {
            return Err(ProxyError::ValidationFailed {
                tool: tool.tool_name.clone(),
                message: error.to_string(),
            });
        }
        Ok(())
    }
}

/// Allow-list check: `*` matches everything, a trailing `*` makes the
/// pattern a prefix match, anything else must match exactly.
pub fn tool_allowed(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return name.starts_with(prefix);
        }
        pattern == name
    })
}
