use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// How the broker reaches a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Ws,
    Wss,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured tool provider. Immutable once the broker is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,

    #[serde(default)]
    pub transport: TransportKind,

    /// Executable for stdio providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Endpoint for ws/wss providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Strict allow-list of original tool names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    /// Exact names or `*` globs, checked in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,

    /// Replaces the built-in fallback entries for this server id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_tools: Option<Vec<FallbackTool>>,
}

impl ServerConfig {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            allowed_tools: None,
            blocked_tools: Vec::new(),
            default_timeout_ms: None,
            fallback_tools: None,
        }
    }

    /// Websocket provider; the transport kind follows the URL scheme.
    pub fn websocket(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let transport = if url.starts_with("wss://") {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        };
        Self {
            id: id.into(),
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url),
            allowed_tools: None,
            blocked_tools: Vec::new(),
            default_timeout_ms: None,
            fallback_tools: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_blocked_tools<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_tools = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_fallback_tools(mut self, tools: Vec<FallbackTool>) -> Self {
        self.fallback_tools = Some(tools);
        self
    }

    /// `true` when no allow-list is configured or `name` is on it.
    pub fn is_tool_allowed(&self, name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|t| t == name),
            None => true,
        }
    }
}

/// A tool as exposed to the LLM, after namespacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
    pub server_id: String,
    pub original_name: String,
    /// Entry came from the static fallback catalog rather than the live provider
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceItem {
    pub server_id: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Minimal descriptor used when a provider cannot list its own tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FallbackTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
        }
    }
}

/// Optional provider operations a caller can be refused for.
///
/// Listing without the capability is not an error; the provider simply
/// contributes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CallTool,
    ReadResource,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Capability::CallTool => "does not support tool calling",
            Capability::ReadResource => "does not expose resources API",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("MCP server '{0}' not found")]
    ServerNotFound(String),

    #[error("Tool '{tool}' is not allowed on server '{server}'")]
    ToolNotAllowed { server: String, tool: String },

    #[error("MCP server '{server}' {capability}")]
    Unsupported { server: String, capability: Capability },

    #[error("MCP server '{server}' timed out after {timeout_ms}ms during {operation}")]
    Timeout {
        server: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("MCP communication error: {0}")]
    Mcp(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Routing failures are caller-correctable: stale menu or misconfiguration.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownTool(_)
                | BrokerError::ServerNotFound(_)
                | BrokerError::ToolNotAllowed { .. }
                | BrokerError::Unsupported { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
