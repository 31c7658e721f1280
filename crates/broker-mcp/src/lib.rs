//! MCP tool broker
//!
//! Connects to a set of MCP tool providers over stdio or websocket,
//! aggregates their tools into one collision-free namespace that is safe for
//! LLM tool-calling, and routes invocations back to the owning provider.
//!
//! ```no_run
//! # async fn demo() -> broker_core::Result<()> {
//! use broker_core::ServerConfig;
//! use broker_mcp::McpBroker;
//!
//! let broker = McpBroker::new(vec![
//!     ServerConfig::stdio("meters", "./bin/meters-mcp"),
//!     ServerConfig::websocket("employee", "wss://tools.example.com/employee"),
//! ]);
//! broker.init().await;
//!
//! let menu = broker.list_tools(false).await;
//! let result = broker.call_tool(&menu[0].name, serde_json::json!({})).await?;
//! # let _ = result;
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod client;
pub mod fallback;
pub mod manager;
pub mod naming;
pub mod provider;
pub mod router;
pub mod transport;
pub mod types;

pub use catalog::{CatalogSnapshot, ToolRoute};
pub use client::McpClient;
pub use fallback::FallbackCatalog;
pub use manager::{ClientEntry, McpBroker, DEFAULT_TIMEOUT_MS};
pub use provider::{Connector, ProviderCapabilities, ProviderClient, TransportConnector};
pub use types::{McpResource, McpTool};
