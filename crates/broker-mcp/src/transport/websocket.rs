//! Websocket transport for socket-based MCP servers (ws:// and wss://)

use async_trait::async_trait;
use broker_core::{BrokerError, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use super::Transport;
use crate::types::{decode_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// One JSON-RPC message per websocket frame
pub struct WebSocketTransport {
    url: String,

    sink: Arc<Mutex<WsSink>>,

    /// Channel for receiving responses
    response_rx: Arc<Mutex<mpsc::Receiver<JsonRpcResponse>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .finish()
    }
}

impl WebSocketTransport {
    pub async fn connect(url: String) -> Result<Self> {
        info!("Connecting to MCP server via websocket: {}", url);

        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(BrokerError::Transport(format!(
                "Websocket URL must start with ws:// or wss://: {}",
                url
            )));
        }

        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            BrokerError::Transport(format!("Websocket handshake with {} failed: {}", url, e))
        })?;
        let (sink, mut source) = stream.split();

        let (response_tx, response_rx) = mpsc::channel::<JsonRpcResponse>(100);
        let url_clone = url.clone();

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let payload = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!("Dropping non UTF-8 binary frame: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!("Websocket closed by {}: {:?}", url_clone, frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Websocket stream error from {}: {}", url_clone, e);
                        break;
                    }
                };

                debug!("Received from MCP server: {}", payload);
                match decode_response(&payload) {
                    Ok(Some(response)) => {
                        if let Err(e) = response_tx.send(response).await {
                            error!("Failed to send response through channel: {}", e);
                        }
                    }
                    Ok(None) => {
                        debug!("Ignoring server-initiated message: {}", payload);
                    }
                    Err(e) => {
                        debug!("Non-JSON-RPC message from server: {} - {}", payload, e);
                    }
                }
            }

            info!("Websocket listener for {} ended", url_clone);
        });

        Ok(Self {
            url,
            sink: Arc::new(Mutex::new(sink)),
            response_rx: Arc::new(Mutex::new(response_rx)),
        })
    }

    async fn send_text(&self, json: String) -> Result<()> {
        debug!("Sending to {}: {}", self.url, json);
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to send websocket frame: {}", e)))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_request(&mut self, request: JsonRpcRequest) -> Result<()> {
        let json = serde_json::to_string(&request)?;
        self.send_text(json).await
    }

    async fn send_notification(&mut self, notification: JsonRpcNotification) -> Result<()> {
        let json = serde_json::to_string(&notification)?;
        self.send_text(json).await
    }

    async fn receive_response(&mut self) -> Result<Option<JsonRpcResponse>> {
        let mut rx_guard = self.response_rx.lock().await;

        match rx_guard.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BrokerError::Transport(format!("Websocket {} disconnected", self.url)))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing websocket transport: {}", self.url);

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to close websocket: {}", e)))
    }
}
