//! Connection manager for the tool broker
//!
//! Owns one live provider connection per configured server. Startup failures
//! are isolated per server: a provider that fails to connect is logged and
//! stays unreachable for the lifetime of the broker; nothing reconnects it.

use broker_core::{BrokerError, Result, ServerConfig};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogSnapshot;
use crate::fallback::FallbackCatalog;
use crate::provider::{Connector, ProviderClient, TransportConnector};

pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// A live provider connection paired with the configuration that opened it
#[derive(Clone)]
pub struct ClientEntry {
    pub client: Arc<dyn ProviderClient>,
    pub config: ServerConfig,
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("server", &self.config.id)
            .field("capabilities", &self.client.capabilities())
            .finish()
    }
}

/// Discovers, names and dispatches to MCP tool providers
pub struct McpBroker {
    /// Configured servers, in configuration order
    pub(crate) servers: Vec<ServerConfig>,

    pub(crate) default_timeout_ms: u64,

    connector: Arc<dyn Connector>,

    pub(crate) fallback: FallbackCatalog,

    /// Live connections indexed by server id
    pub(crate) clients: RwLock<HashMap<String, ClientEntry>>,

    /// Last complete tool cache + name map, swapped whole
    pub(crate) catalog: RwLock<Option<Arc<CatalogSnapshot>>>,

    /// Serializes catalog rebuilds
    pub(crate) refresh: Mutex<()>,
}

impl McpBroker {
    /// Broker over real stdio/websocket transports
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        let fallback = FallbackCatalog::for_servers(&servers);
        Self {
            servers,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            connector: Arc::new(TransportConnector),
            fallback,
            clients: RwLock::new(HashMap::new()),
            catalog: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Deadline for servers without `defaultTimeoutMs`
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_fallback_catalog(mut self, fallback: FallbackCatalog) -> Self {
        self.fallback = fallback;
        self
    }

    /// Bring up every configured server concurrently. Never fails for an
    /// individual server.
    pub async fn init(&self) {
        info!("Starting {} MCP servers", self.servers.len());

        let starts = self.servers.iter().map(|config| async move {
            match self.start_server(config.clone()).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to start MCP server '{}': {}", config.id, e);
                    false
                }
            }
        });
        let outcomes = join_all(starts).await;

        let started = outcomes.iter().filter(|ok| **ok).count();
        let failed = outcomes.len() - started;
        info!(
            "MCP server startup complete: {} started, {} failed",
            started, failed
        );
    }

    /// Connect one server. A server that already has a live entry is left alone.
    pub async fn start_server(&self, config: ServerConfig) -> Result<()> {
        if self.clients.read().await.contains_key(&config.id) {
            warn!("MCP server '{}' is already running", config.id);
            return Ok(());
        }

        info!(
            "Starting MCP server '{}' over {}",
            config.id, config.transport
        );

        let timeout_ms = self.timeout_for(&config);
        let connect = self.connector.connect(&config, timeout_ms);
        let client = self.with_deadline(&config, "connect", connect).await?;

        let capabilities = client.capabilities();
        info!(
            "MCP server '{}' connected (tools: {}, resources: {})",
            config.id, capabilities.list_tools, capabilities.list_resources
        );

        let mut clients = self.clients.write().await;
        if clients.contains_key(&config.id) {
            // Lost a race with a concurrent start of the same id
            warn!("MCP server '{}' is already running", config.id);
            drop(clients);
            if let Err(e) = client.close().await {
                warn!("Error closing duplicate MCP client '{}': {}", config.id, e);
            }
            return Ok(());
        }
        clients.insert(config.id.clone(), ClientEntry { client, config });
        Ok(())
    }

    /// Close every live connection. Individual close failures are logged only.
    pub async fn shutdown(&self) {
        let entries: Vec<ClientEntry> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, entry)| entry).collect()
        };

        info!("Stopping {} MCP servers", entries.len());

        let closes = entries.iter().map(|entry| async move {
            let close = entry.client.close();
            match self.with_deadline(&entry.config, "close", close).await {
                Ok(()) => debug!("MCP server '{}' stopped", entry.config.id),
                Err(e) => warn!("Error closing MCP client '{}': {}", entry.config.id, e),
            }
        });
        join_all(closes).await;
    }

    pub fn configured_servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    /// Ids with a live connection, in configuration order
    pub async fn connected_servers(&self) -> Vec<String> {
        self.live_entries()
            .await
            .into_iter()
            .map(|entry| entry.config.id)
            .collect()
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.clients.read().await.contains_key(server_id)
    }

    pub(crate) async fn client_entry(&self, server_id: &str) -> Option<ClientEntry> {
        self.clients.read().await.get(server_id).cloned()
    }

    /// Snapshot of live connections: configured servers first, in order,
    /// then any started ad hoc, by id.
    pub(crate) async fn live_entries(&self) -> Vec<ClientEntry> {
        let clients = self.clients.read().await;
        let mut entries: Vec<ClientEntry> = clients.values().cloned().collect();
        drop(clients);

        entries.sort_by_cached_key(|entry| {
            let position = self
                .servers
                .iter()
                .position(|s| s.id == entry.config.id)
                .unwrap_or(usize::MAX);
            (position, entry.config.id.clone())
        });
        entries
    }

    pub(crate) fn timeout_for(&self, config: &ServerConfig) -> u64 {
        config.default_timeout_ms.unwrap_or(self.default_timeout_ms)
    }

    /// Bound a provider round trip by the server's timeout
    pub(crate) async fn with_deadline<T>(
        &self,
        config: &ServerConfig,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout_ms = self.timeout_for(config);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                server: config.id.clone(),
                operation,
                timeout_ms,
            }),
        }
    }
}

impl std::fmt::Debug for McpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBroker")
            .field("servers", &self.servers.len())
            .field("default_timeout_ms", &self.default_timeout_ms)
            .finish()
    }
}
