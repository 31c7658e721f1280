//! Transport layer for MCP communication
//!
//! Provides transport abstractions for MCP communication with support for:
//! - Stdio (process-based) transport
//! - Websocket (ws/wss) transport

use async_trait::async_trait;
use broker_core::{BrokerError, Result, ServerConfig, TransportKind};
use std::collections::HashMap;
use std::fmt::Debug;

use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub mod stdio;
pub mod websocket;

pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Send a JSON-RPC request
    async fn send_request(&mut self, request: JsonRpcRequest) -> Result<()>;

    /// Send a JSON-RPC notification (no response expected)
    async fn send_notification(&mut self, notification: JsonRpcNotification) -> Result<()>;

    /// Receive a JSON-RPC response, `None` if nothing has arrived yet
    async fn receive_response(&mut self) -> Result<Option<JsonRpcResponse>>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;
}

/// Transport configuration, selected once from `ServerConfig::transport`
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// Stdio-based transport (process communication)
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },

    /// Websocket transport, `ws://` or `wss://`
    WebSocket { url: String },
}

impl TransportConfig {
    pub fn from_server_config(config: &ServerConfig) -> Result<Self> {
        match config.transport {
            TransportKind::Stdio => {
                let command = config
                    .command
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| {
                        BrokerError::Config(format!(
                            "Server '{}' requires a command for stdio transport",
                            config.id
                        ))
                    })?;
                Ok(TransportConfig::Stdio {
                    command,
                    args: config.args.clone(),
                    env: config.env.clone(),
                })
            }
            TransportKind::Ws | TransportKind::Wss => {
                let url = config.url.clone().ok_or_else(|| {
                    BrokerError::Config(format!(
                        "Server '{}' requires a url for {} transport",
                        config.id, config.transport
                    ))
                })?;
                Ok(TransportConfig::WebSocket { url })
            }
        }
    }

    /// Create a transport instance from configuration
    pub async fn create_transport(&self) -> Result<Box<dyn Transport>> {
        match self {
            TransportConfig::Stdio { command, args, env } => {
                let transport = StdioTransport::new(command.clone(), args.clone(), env.clone())?;
                Ok(Box::new(transport))
            }
            TransportConfig::WebSocket { url } => {
                let transport = WebSocketTransport::connect(url.clone()).await?;
                Ok(Box::new(transport))
            }
        }
    }

    /// Get transport type as string
    pub fn transport_type(&self) -> &str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::WebSocket { .. } => "websocket",
        }
    }
}
