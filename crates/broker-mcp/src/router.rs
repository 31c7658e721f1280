//! Invocation routing
//!
//! Resolves namespaced tool names against the last complete catalog snapshot
//! and forwards calls and resource reads to the owning live connection.

use broker_core::{BrokerError, Capability, Result};
use serde_json::Value;
use tracing::debug;

use crate::catalog::ToolRoute;
use crate::manager::McpBroker;

impl McpBroker {
    /// Resolve a namespaced name to its `(server_id, original_name)` pair
    pub async fn resolve_tool(&self, namespaced_name: &str) -> Result<ToolRoute> {
        self.current_catalog()
            .await
            .and_then(|snapshot| snapshot.resolve(namespaced_name).cloned())
            .ok_or_else(|| BrokerError::UnknownTool(namespaced_name.to_string()))
    }

    /// Forward a tool call; the provider's result is returned unmodified.
    pub async fn call_tool(&self, namespaced_name: &str, arguments: Value) -> Result<Value> {
        let route = self.resolve_tool(namespaced_name).await?;

        let entry = self
            .client_entry(&route.server_id)
            .await
            .ok_or_else(|| BrokerError::ServerNotFound(route.server_id.clone()))?;

        // Fallback entries never went through the listing filter
        if !entry.config.is_tool_allowed(&route.original_name) {
            return Err(BrokerError::ToolNotAllowed {
                server: route.server_id,
                tool: route.original_name,
            });
        }

        if !entry.client.capabilities().call_tool {
            return Err(BrokerError::Unsupported {
                server: route.server_id,
                capability: Capability::CallTool,
            });
        }

        debug!(
            "Routing '{}' to '{}' on server '{}'",
            namespaced_name, route.original_name, route.server_id
        );
        let call = entry.client.call_tool(&route.original_name, arguments);
        self.with_deadline(&entry.config, "tools/call", call).await
    }

    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value> {
        let entry = self
            .client_entry(server_id)
            .await
            .ok_or_else(|| BrokerError::ServerNotFound(server_id.to_string()))?;

        if !entry.client.capabilities().read_resource {
            return Err(BrokerError::Unsupported {
                server: server_id.to_string(),
                capability: Capability::ReadResource,
            });
        }

        debug!("Reading resource '{}' from server '{}'", uri, server_id);
        let read = entry.client.read_resource(uri);
        self.with_deadline(&entry.config, "resources/read", read).await
    }
}
