//! Catalog aggregation
//!
//! Merges every provider's tool list into one namespace. Per server the
//! pipeline is: fetch, allow-list, dedup, block-list, namespace. A server
//! that contributes nothing gets its fallback entries instead, whether it is
//! connected but degraded or was never connected at all.
//!
//! The merged list and the name map are built into a fresh
//! [`CatalogSnapshot`] and swapped in only once the pass is complete, so
//! routing never observes a half-built map.

use broker_core::{NamespacedToolDefinition, ResourceItem, ServerConfig};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manager::{ClientEntry, McpBroker};
use crate::naming::{base_tool_name, canonical_key, create_matcher, generate_tool_name};
use crate::types::McpTool;

/// Where a namespaced tool name routes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub server_id: String,
    pub original_name: String,
}

/// Immutable result of one aggregation pass
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    tools: Arc<Vec<NamespacedToolDefinition>>,
    name_map: HashMap<String, ToolRoute>,
}

impl CatalogSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tools(&self) -> &Arc<Vec<NamespacedToolDefinition>> {
        &self.tools
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolRoute> {
        self.name_map.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Parameter schema for tools that declare none
pub fn empty_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Apply the allow-list, drop near-duplicates, then the block-list.
pub fn filter_provider_tools(config: &ServerConfig, raw: Vec<McpTool>) -> Vec<McpTool> {
    let blocked: Vec<_> = config.blocked_tools.iter().map(|p| create_matcher(p)).collect();
    let mut seen = HashSet::new();

    raw.into_iter()
        .filter(|tool| config.is_tool_allowed(&tool.name))
        .filter(|tool| {
            let fresh = seen.insert(canonical_key(&config.id, &tool.name));
            if !fresh {
                debug!(
                    "Skipping near-duplicate tool '{}' on server '{}'",
                    tool.name, config.id
                );
            }
            fresh
        })
        .filter(|tool| !blocked.iter().any(|m| m.matches(&tool.name)))
        .collect()
}

/// Accumulates one aggregation pass
#[derive(Default)]
struct CatalogBuilder {
    tools: Vec<NamespacedToolDefinition>,
    name_map: HashMap<String, ToolRoute>,
    contributed: HashMap<String, usize>,
    fallback_applied: HashSet<String>,
}

impl CatalogBuilder {
    fn add_live_tools(&mut self, server_id: &str, tools: Vec<McpTool>) {
        let count = tools.len();
        for tool in tools {
            let name = generate_tool_name(server_id, &tool.name, &self.name_map);
            self.name_map.insert(
                name.clone(),
                ToolRoute {
                    server_id: server_id.to_string(),
                    original_name: tool.name.clone(),
                },
            );
            self.tools.push(NamespacedToolDefinition {
                name,
                description: tool.description,
                parameters: tool.input_schema.unwrap_or_else(empty_parameters),
                server_id: server_id.to_string(),
                original_name: tool.name,
                fallback: false,
            });
        }
        *self.contributed.entry(server_id.to_string()).or_default() += count;
    }

    fn contributed(&self, server_id: &str) -> usize {
        self.contributed.get(server_id).copied().unwrap_or(0)
    }

    /// Names already taken are skipped, never suffixed.
    fn add_fallback(&mut self, server_id: &str, broker: &McpBroker) {
        if !self.fallback_applied.insert(server_id.to_string()) {
            return;
        }

        let entries = broker.fallback.tools_for(server_id);
        if entries.is_empty() {
            debug!("No fallback tools defined for server '{}'", server_id);
            return;
        }

        let mut injected = 0;
        for entry in entries {
            let name = base_tool_name(server_id, &entry.name);
            if self.name_map.contains_key(&name) {
                debug!("Fallback tool '{}' collides with an existing name, skipping", name);
                continue;
            }
            self.name_map.insert(
                name.clone(),
                ToolRoute {
                    server_id: server_id.to_string(),
                    original_name: entry.name.clone(),
                },
            );
            self.tools.push(NamespacedToolDefinition {
                name,
                description: entry.description.clone(),
                parameters: empty_parameters(),
                server_id: server_id.to_string(),
                original_name: entry.name.clone(),
                fallback: true,
            });
            injected += 1;
        }

        warn!(
            "Server '{}' contributed no tools, using {} fallback tools",
            server_id, injected
        );
    }

    fn finish(self, generation: u64) -> CatalogSnapshot {
        CatalogSnapshot {
            generation,
            tools: Arc::new(self.tools),
            name_map: self.name_map,
        }
    }
}

impl McpBroker {
    /// The LLM-facing tool menu.
    ///
    /// Returns the cached list unless `force_refresh` is set or nothing has
    /// been built yet. Concurrent refreshes collapse into one pass.
    pub async fn list_tools(&self, force_refresh: bool) -> Arc<Vec<NamespacedToolDefinition>> {
        let observed = self.current_catalog().await;
        if !force_refresh {
            if let Some(snapshot) = &observed {
                return snapshot.tools().clone();
            }
        }

        let _refresh = self.refresh.lock().await;

        let current = self.current_catalog().await;
        if let Some(current) = &current {
            let rebuilt_while_waiting = observed
                .as_ref()
                .map_or(true, |seen| current.generation() > seen.generation());
            if rebuilt_while_waiting {
                return current.tools().clone();
            }
        }

        let generation = current.map_or(0, |c| c.generation()) + 1;
        let snapshot = Arc::new(self.build_catalog(generation).await);
        info!(
            "Aggregated {} tools from {} configured servers",
            snapshot.len(),
            self.servers.len()
        );

        *self.catalog.write().await = Some(snapshot.clone());
        snapshot.tools().clone()
    }

    /// Last complete snapshot, if any pass has finished
    pub async fn current_catalog(&self) -> Option<Arc<CatalogSnapshot>> {
        self.catalog.read().await.clone()
    }

    async fn build_catalog(&self, generation: u64) -> CatalogSnapshot {
        let entries = self.live_entries().await;
        let listings = join_all(entries.iter().map(|entry| self.fetch_tools(entry))).await;

        let mut builder = CatalogBuilder::default();

        for (entry, raw) in entries.iter().zip(listings) {
            let server_id = entry.config.id.as_str();
            let tools = filter_provider_tools(&entry.config, raw);
            builder.add_live_tools(server_id, tools);

            if builder.contributed(server_id) == 0 {
                builder.add_fallback(server_id, self);
            }
        }

        // Configured servers that never connected
        for config in &self.servers {
            if builder.contributed(&config.id) == 0 {
                builder.add_fallback(&config.id, self);
            }
        }

        builder.finish(generation)
    }

    /// Raw tool list for one provider; any failure counts as zero tools.
    async fn fetch_tools(&self, entry: &ClientEntry) -> Vec<McpTool> {
        let server_id = &entry.config.id;
        if !entry.client.capabilities().list_tools {
            warn!("MCP server '{}' does not support tool listing", server_id);
            return Vec::new();
        }

        let listing = entry.client.list_tools();
        match self.with_deadline(&entry.config, "tools/list", listing).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!("Failed to list tools from MCP server '{}': {}", server_id, e);
                Vec::new()
            }
        }
    }

    /// Resources across every connected provider that exposes them. Not cached.
    pub async fn list_resources(&self) -> Vec<ResourceItem> {
        let entries: Vec<ClientEntry> = self
            .live_entries()
            .await
            .into_iter()
            .filter(|entry| entry.client.capabilities().list_resources)
            .collect();

        let listings = join_all(entries.iter().map(|entry| async move {
            let listing = entry.client.list_resources();
            match self.with_deadline(&entry.config, "resources/list", listing).await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(
                        "Failed to list resources from MCP server '{}': {}",
                        entry.config.id, e
                    );
                    Vec::new()
                }
            }
        }))
        .await;

        entries
            .iter()
            .zip(listings)
            .flat_map(|(entry, resources)| {
                resources.into_iter().map(move |resource| ResourceItem {
                    server_id: entry.config.id.clone(),
                    uri: resource.uri,
                    name: resource.name,
                    description: resource.description,
                    mime_type: resource.mime_type,
                })
            })
            .collect()
    }
}
