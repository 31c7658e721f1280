//! Stdio transport implementation for process-based MCP servers

use async_trait::async_trait;
use broker_core::{BrokerError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::Transport;
use crate::types::{decode_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Stdio transport for process-based MCP servers
pub struct StdioTransport {
    /// Child process handle
    process: Arc<Mutex<Option<Child>>>,

    /// Process stdin for sending data
    stdin: Arc<Mutex<Option<ChildStdin>>>,

    /// Channel for receiving responses
    response_rx: Arc<Mutex<mpsc::Receiver<JsonRpcResponse>>>,

    command: PathBuf,
    args: Vec<String>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command)
            .field("args", &self.args)
            .finish()
    }
}

/// Relative paths with a separator resolve against the working directory;
/// bare program names are left for `PATH` lookup.
pub fn resolve_command(command: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(command);
    let has_separator = command.contains('/') || command.contains(std::path::MAIN_SEPARATOR);
    if path.is_relative() && has_separator {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

impl StdioTransport {
    /// Spawn the provider process. Must be called inside a tokio runtime.
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let program = resolve_command(&command, &cwd);
        info!("Starting MCP server via stdio: {} {:?}", program.display(), args);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BrokerError::Transport(format!(
                "Failed to spawn MCP server process '{}': {}",
                program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Transport("Failed to get process stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Transport("Failed to get process stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrokerError::Transport("Failed to get process stderr".into()))?;

        let (response_tx, response_rx) = mpsc::channel::<JsonRpcResponse>(100);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        info!("MCP server process stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        debug!("Received from MCP server: {}", trimmed);

                        match decode_response(trimmed) {
                            Ok(Some(response)) => {
                                if let Err(e) = response_tx.send(response).await {
                                    error!("Failed to send response through channel: {}", e);
                                }
                            }
                            Ok(None) => {
                                debug!("Ignoring server-initiated message: {}", trimmed);
                            }
                            Err(e) => {
                                debug!("Non-JSON-RPC message from server: {} - {}", trimmed, e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error reading from MCP server stdout: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("MCP server stderr: {}", trimmed);
                        }
                    }
                    Err(e) => {
                        error!("Error reading from MCP server stderr: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            process: Arc::new(Mutex::new(Some(child))),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            response_rx: Arc::new(Mutex::new(response_rx)),
            command: program,
            args,
        })
    }

    async fn write_line(&self, json: String) -> Result<()> {
        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| BrokerError::Transport("Process stdin not available".into()))?;

        debug!("Sending to MCP server: {}", json);
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to write to stdin: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to write newline: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to flush stdin: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(&mut self, request: JsonRpcRequest) -> Result<()> {
        let json = serde_json::to_string(&request)?;
        self.write_line(json).await
    }

    async fn send_notification(&mut self, notification: JsonRpcNotification) -> Result<()> {
        let json = serde_json::to_string(&notification)?;
        self.write_line(json).await
    }

    async fn receive_response(&mut self) -> Result<Option<JsonRpcResponse>> {
        let mut rx_guard = self.response_rx.lock().await;

        match rx_guard.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BrokerError::Transport("MCP server process exited".into()))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing stdio transport for {}", self.command.display());

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.process.lock().await.take() {
            child.kill().await.map_err(|e| {
                BrokerError::Transport(format!("Failed to kill MCP server process: {}", e))
            })?;
            info!("MCP server process terminated");
        }

        Ok(())
    }
}
