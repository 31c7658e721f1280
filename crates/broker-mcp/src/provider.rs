//! Capability interface the broker uses to talk to a provider
//!
//! A provider client may support only some operations. The broker checks
//! [`ProviderCapabilities`] before forwarding anything, instead of probing for
//! methods at call time.

use async_trait::async_trait;
use broker_core::{Result, ServerConfig};
use serde_json::Value;
use std::sync::Arc;

use crate::client::McpClient;
use crate::transport::TransportConfig;
use crate::types::{McpResource, McpTool};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub list_tools: bool,
    pub call_tool: bool,
    pub list_resources: bool,
    pub read_resource: bool,
}

impl ProviderCapabilities {
    pub fn all() -> Self {
        Self {
            list_tools: true,
            call_tool: true,
            list_resources: true,
            read_resource: true,
        }
    }

    pub fn tools_only() -> Self {
        Self {
            list_tools: true,
            call_tool: true,
            ..Self::default()
        }
    }
}

/// A live, capability-negotiated connection to one provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn list_resources(&self) -> Result<Vec<McpResource>>;

    async fn read_resource(&self, uri: &str) -> Result<Value>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl ProviderClient for McpClient {
    fn capabilities(&self) -> ProviderCapabilities {
        let tools = self.supports_tools();
        let resources = self.supports_resources();
        ProviderCapabilities {
            list_tools: tools,
            call_tool: tools,
            list_resources: resources,
            read_resource: resources,
        }
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        McpClient::call_tool(self, name, arguments).await
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        McpClient::list_resources(self).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        McpClient::read_resource(self, uri).await
    }

    async fn close(&self) -> Result<()> {
        McpClient::close(self).await
    }
}

/// Builds a provider client for one server configuration
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig, timeout_ms: u64) -> Result<Arc<dyn ProviderClient>>;
}

/// Opens real stdio or websocket connections, picked from `config.transport`
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, config: &ServerConfig, timeout_ms: u64) -> Result<Arc<dyn ProviderClient>> {
        let transport = TransportConfig::from_server_config(config)?;
        let client = McpClient::connect(config.id.clone(), &transport, timeout_ms).await?;
        Ok(Arc::new(client))
    }
}
