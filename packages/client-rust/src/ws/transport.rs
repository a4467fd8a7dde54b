//! Socket abstraction under the duplex connection.
//!
//! A [`Connector`] opens text-frame sockets. The connection state machine
//! only sees a pair of channels, which keeps it independent of the
//! WebSocket library and lets tests drive it in memory.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// WebSocket close code, when the peer sent one.
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Closed(CloseInfo),
}

/// An open socket. Dropping `outgoing` closes the socket.
#[derive(Debug)]
pub struct Socket {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Socket, ClientError>;
}

/// Connects to a `ws://` or `wss://` URL with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: String,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Bounds the TCP connect plus the opening handshake.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> Result<Socket, ClientError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_elapsed| {
                    ClientError::Transport(format!(
                        "connect {}: timed out after {:?}",
                        self.url, self.connect_timeout
                    ))
                })?
                .map_err(|e| ClientError::Transport(format!("connect {}: {e}", self.url)))?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if write.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let info = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(SocketEvent::Message(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(CloseInfo::default, |f| {
                            CloseInfo::new(Some(u16::from(f.code)), f.reason.to_string())
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseInfo::new(None, e.to_string()),
                    None => break CloseInfo::new(None, "stream ended"),
                }
            };
            let _ = in_tx.send(SocketEvent::Closed(info));
        });

        Ok(Socket {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
