//! Socket transport.
//!
//! The connection task never touches the websocket directly: a
//! [`Connector`] hands it a [`FrameStream`], a pair of text-frame channels
//! pumped by two small tasks. This keeps the connection logic independent
//! of tungstenite and lets tests script a broker in memory.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use gigline_shared::constants::EVENT_QUEUE_CAPACITY;

use crate::config::BrokerConfig;
use crate::error::{NetError, Result};

/// What the read side of a transport yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Both directions of an established transport.
///
/// Dropping `outgoing` closes the socket.
pub struct FrameStream {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<FrameStream>;
}

/// Connects to the broker over a (TLS) websocket.
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.socket_url(),
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<FrameStream> {
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| NetError::Timeout {
                stage: "websocket connect",
            })?
            .map_err(|e| NetError::Connection(e.to_string()))?;

        info!(url = %self.url, "Websocket connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(EVENT_QUEUE_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(EVENT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::text(text)).await {
                    warn!(error = %e, "Websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Websocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let frame = match item {
                    Ok(WsMessage::Text(text)) => TransportFrame::Text(text.as_str().to_owned()),
                    Ok(WsMessage::Close(close)) => {
                        let (code, reason) = match close {
                            Some(cf) => (Some(u16::from(cf.code)), cf.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        let _ = in_tx.send(TransportFrame::Closed { code, reason }).await;
                        return;
                    }
                    // Control frames are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(TransportFrame::Error(e.to_string())).await;
                        return;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = in_tx
                .send(TransportFrame::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(FrameStream {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
