//! One registered client.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection already closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Outbound half of a client channel.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), SendError>;

    async fn send_ping(&self) -> Result<(), SendError>;

    async fn close(&self) -> Result<(), SendError>;
}

/// Write half of an accepted WebSocket.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
}

impl WsSink {
    pub fn new(sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.inner
            .lock()
            .await
            .send(Message::text(text.to_owned()))
            .await?;
        Ok(())
    }

    async fn send_ping(&self) -> Result<(), SendError> {
        self.inner
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SendError> {
        self.inner.lock().await.close().await?;
        Ok(())
    }
}

pub struct ClientConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    sink: Box<dyn ClientSink>,
    // Fired when the broadcaster gives up on this client
    evicted: CancellationToken,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, peer: SocketAddr, sink: Box<dyn ClientSink>) -> Self {
        Self {
            id,
            peer,
            sink,
            evicted: CancellationToken::new(),
        }
    }

    /// Sends one text frame, giving up after `deadline`.
    pub async fn send(&self, text: &str, deadline: Duration) -> Result<(), SendError> {
        if self.evicted.is_cancelled() {
            return Err(SendError::Closed);
        }
        tokio::time::timeout(deadline, self.sink.send_text(text))
            .await
            .map_err(|_| SendError::Timeout(deadline))?
    }

    /// Sends a keepalive ping, giving up after `deadline`.
    pub async fn ping(&self, deadline: Duration) -> Result<(), SendError> {
        tokio::time::timeout(deadline, self.sink.send_ping())
            .await
            .map_err(|_| SendError::Timeout(deadline))?
    }

    pub async fn close(&self) -> Result<(), SendError> {
        self.sink.close().await
    }

    /// Tells the connection task to hang up.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once [`evict`](Self::evict) has been called.
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}
