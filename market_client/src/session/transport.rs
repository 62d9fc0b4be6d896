//! Duplex frame transports to a host.

use crate::error::{MarketError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// An open connection carrying JSON text frames
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next frame; `Ok(None)` once the peer has closed the connection
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let url = Url::parse(url)
            .map_err(|e| MarketError::Configuration(format!("invalid host URL {}: {}", url, e)))?;
        let (stream, _) = connect_async(url.as_str()).await?;
        info!("🔗 Connected to {}", url);
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(text.as_str().to_string())),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes.as_slice().to_vec())
                        .map_err(|e| MarketError::Protocol(format!("binary frame: {}", e)))?;
                    return Ok(Some(text));
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by host");
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Host end of an in-process connection
pub struct ChannelPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ChannelPeer {
    /// `false` once the client side is gone
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

/// Connects to an in-process host. Every successful connect hands a
/// [`ChannelPeer`] to whoever holds the acceptor receiver.
#[derive(Clone)]
pub struct ChannelConnector {
    acceptor: mpsc::UnboundedSender<ChannelPeer>,
    refuse: Arc<AtomicU32>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (acceptor, incoming) = mpsc::unbounded_channel();
        (
            Self {
                acceptor,
                refuse: Arc::new(AtomicU32::new(0)),
            },
            incoming,
        )
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MarketError::Transport(format!("connection to {} refused", url)));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        self.acceptor
            .send(ChannelPeer {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| MarketError::Transport(format!("no host listening at {}", url)))?;
        Ok(Box::new(ChannelTransport {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| MarketError::Transport("connection closed".into()))?;
        tx.send(frame)
            .map_err(|_| MarketError::Transport("host hung up".into()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        self.rx.close();
        Ok(())
    }
}
