//! Configuration loading for the MCP tool broker
//!
//! Parses the YAML server list, substitutes `${VAR}` references and
//! validates it into the typed `ServerConfig` records the broker consumes.

use broker_core::{BrokerError, Result, ServerConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

pub mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub defaults: BrokerDefaults,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerDefaults {
    /// Deadline for provider RPCs when a server sets no `defaultTimeoutMs`
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
}

impl Default for BrokerDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30000
}

impl BrokerConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading broker configuration from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| BrokerError::Config(format!("Failed to parse YAML: {}", e)))?;

        let mut document = serde_json::to_value(raw)
            .map_err(|e| BrokerError::Config(format!("Unsupported YAML value: {}", e)))?;
        if document.is_null() {
            document = serde_json::json!({});
        }
        substitute_env_vars(&mut document)?;

        let config: BrokerConfig = serde_json::from_value(document)
            .map_err(|e| BrokerError::Config(format!("Invalid broker configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            validate_server(server)?;
            if !seen.insert(server.id.as_str()) {
                return Err(BrokerError::Config(format!(
                    "Duplicate server id '{}'",
                    server.id
                )));
            }
        }
        if self.defaults.timeout_ms == 0 {
            return Err(BrokerError::Config("defaults.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

fn validate_server(server: &ServerConfig) -> Result<()> {
    if server.id.trim().is_empty() {
        return Err(BrokerError::Config("Server id cannot be empty".into()));
    }

    match server.transport {
        TransportKind::Stdio => {
            let has_command = server
                .command
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty());
            if !has_command {
                return Err(BrokerError::Config(format!(
                    "Server '{}' uses stdio transport but has no command",
                    server.id
                )));
            }
        }
        TransportKind::Ws | TransportKind::Wss => {
            let scheme = format!("{}://", server.transport);
            match server.url.as_deref() {
                Some(url) if url.starts_with(&scheme) => {}
                Some(url) => {
                    return Err(BrokerError::Config(format!(
                        "Server '{}' url '{}' must start with {}",
                        server.id, url, scheme
                    )));
                }
                None => {
                    return Err(BrokerError::Config(format!(
                        "Server '{}' uses {} transport but has no url",
                        server.id, server.transport
                    )));
                }
            }
        }
    }

    if server.default_timeout_ms == Some(0) {
        return Err(BrokerError::Config(format!(
            "Server '{}' defaultTimeoutMs must be positive",
            server.id
        )));
    }

    Ok(())
}
