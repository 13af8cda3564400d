//! # WebSocket server
//!
//! Pushes button presses to every connected client and accepts the `EXIT`
//! control command.
//!
//! ```text
//! server/
//! ├── protocol.rs     - DOWN / EXIT text frames
//! ├── connection.rs   - One client: id, peer, outbound sink, eviction flag
//! ├── broadcaster.rs  - Client set and concurrent fan-out with per-send deadline
//! └── hub.rs          - Accept loop, per-connection receive tasks, keepalive
//! ```
//!
//! A client that fails or stalls a send is evicted; nothing it does can hold
//! up the other clients or the button poll loop. Sockets that never finish
//! the handshake, or stop answering pings, are dropped as well.

pub mod broadcaster;
pub mod connection;
pub mod hub;
pub mod protocol;

use std::net::SocketAddr;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use connection::{ClientConnection, ClientSink, ConnectionId, SendError};
pub use hub::{ConnectionHub, HubSettings};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read listener address: {0}")]
    LocalAddr(#[source] std::io::Error),
}
