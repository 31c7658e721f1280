//! MCP client implementation

use broker_core::{BrokerError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportConfig};
use crate::types::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, McpResource, McpTool, PaginatedParams,
    ReadResourceParams, ToolCallParams,
};

/// MCP client for communicating with an MCP server
pub struct McpClient {
    /// Server id for identification
    name: String,

    /// Transport for communication; one exchange at a time
    transport: Mutex<Box<dyn Transport>>,

    /// Request ID counter
    request_id: AtomicU64,

    /// Result of the initialize handshake
    server: Option<InitializeResult>,

    /// Timeout duration for requests (in milliseconds)
    timeout_ms: u64,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl McpClient {
    /// Wrap an already-open transport. Call [`McpClient::initialize`] before use.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(transport),
            request_id: AtomicU64::new(1),
            server: None,
            timeout_ms,
        }
    }

    /// Open the configured transport and run the initialize handshake.
    pub async fn connect(
        name: impl Into<String>,
        transport_config: &TransportConfig,
        timeout_ms: u64,
    ) -> Result<Self> {
        let transport = transport_config.create_transport().await?;
        let mut client = Self::new(name, transport, timeout_ms);
        if let Err(e) = client.initialize().await {
            if let Err(close_err) = client.close().await {
                debug!("Error closing half-open client '{}': {}", client.name, close_err);
            }
            return Err(e);
        }
        Ok(client)
    }

    fn next_request_id(&self) -> String {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        format!("{}", id)
    }

    /// Initialize the MCP connection
    pub async fn initialize(&mut self) -> Result<InitializeResult> {
        info!("Initializing MCP client: {}", self.name);

        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self.request("initialize", Some(params)).await?;

        info!(
            "MCP client '{}' initialized with protocol version: {}",
            self.name, result.protocol_version
        );
        if let Some(ref server_info) = result.server_info {
            info!(
                "Connected to MCP server: {} v{}",
                server_info.name, server_info.version
            );
        }

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        self.transport
            .lock()
            .await
            .send_notification(notification)
            .await?;

        self.server = Some(result.clone());
        Ok(result)
    }

    /// Server advertised the `tools` capability
    pub fn supports_tools(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|s| s.capabilities.tools.is_some())
    }

    /// Server advertised the `resources` capability
    pub fn supports_resources(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|s| s.capabilities.resources.is_some())
    }

    /// List every tool, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        debug!("Listing tools from MCP server: {}", self.name);

        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(PaginatedParams { cursor })?;
            let page: ListToolsResult = self.request("tools/list", Some(params)).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!("Discovered {} tools from MCP server '{}'", tools.len(), self.name);
        Ok(tools)
    }

    /// Call a tool; the result object is returned as the server sent it
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        debug!("Calling MCP tool '{}' on server '{}'", name, self.name);

        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request("tools/call", Some(params)).await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        debug!("Listing resources from MCP server: {}", self.name);

        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(PaginatedParams { cursor })?;
            let page: ListResourcesResult = self.request("resources/list", Some(params)).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        debug!("Reading resource '{}' from server '{}'", uri, self.name);

        let params = serde_json::to_value(ReadResourceParams {
            uri: uri.to_string(),
        })?;
        self.request("resources/read", Some(params)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<T> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let response = self.send_request(method, request).await?;

        if let Some(error) = response.error {
            return Err(BrokerError::Mcp(format!(
                "{} failed on '{}': {} (code {})",
                method, self.name, error.message, error.code
            )));
        }

        let result = response.result.ok_or_else(|| {
            BrokerError::Mcp(format!("{} response from '{}' missing result", method, self.name))
        })?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request and wait for the response with the same id
    async fn send_request(
        &self,
        method: &'static str,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        let timeout_duration = Duration::from_millis(self.timeout_ms);

        timeout(timeout_duration, self.exchange(request))
            .await
            .map_err(|_| BrokerError::Timeout {
                server: self.name.clone(),
                operation: method,
                timeout_ms: self.timeout_ms,
            })?
    }

    async fn exchange(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let request_id = request.id.clone();
        let mut transport = self.transport.lock().await;
        transport.send_request(request).await?;

        loop {
            if let Some(response) = transport.receive_response().await? {
                if response.answers(&request_id) {
                    return Ok(response);
                }
                // Out-of-order reply to an abandoned request
                warn!(
                    "Received response for different request: {} (expected: {})",
                    response.id, request_id
                );
                continue;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Close the client connection
    pub async fn close(&self) -> Result<()> {
        debug!("Closing MCP client: {}", self.name);
        let mut transport = self.transport.lock().await;
        transport.close().await
    }
}
