use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::broadcaster::Broadcaster;
use super::connection::{ClientConnection, ConnectionId, WsSink};
use super::protocol::ClientCommand;
use super::ServerError;
use crate::process::ProcessTerminator;
use crate::supervisor::{ShutdownReason, ShutdownTrigger};

/// How long a closing handshake may take before the socket is just dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-connection time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Time a new socket gets to complete the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Idle time between keepalive pings. Must be non-zero.
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered before the client is dropped.
    pub ping_timeout: Duration,
    /// Upper bound for stopping the external process on `EXIT`.
    pub terminate_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

/// Everything a connection task needs, shared by all of them.
#[derive(Clone)]
struct HubContext {
    broadcaster: Arc<Broadcaster>,
    terminator: Arc<dyn ProcessTerminator>,
    shutdown: ShutdownTrigger,
    settings: HubSettings,
}

/// Accepts WebSocket clients and runs one receive task per client.
pub struct ConnectionHub {
    listener: TcpListener,
    context: HubContext,
    tracker: TaskTracker,
    next_id: u64,
}

impl ConnectionHub {
    pub async fn bind(
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster>,
        terminator: Arc<dyn ProcessTerminator>,
        shutdown: ShutdownTrigger,
        settings: HubSettings,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            context: HubContext {
                broadcaster,
                terminator,
                shutdown,
                settings,
            },
            tracker: TaskTracker::new(),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    /// Tracker for the per-connection tasks; closed when [`run`](Self::run) returns.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Accepts until shutdown, then drops the listener.
    pub async fn run(self) {
        let ConnectionHub {
            listener,
            context,
            tracker,
            mut next_id,
        } = self;

        match listener.local_addr() {
            Ok(addr) => info!("WebSocket server started on {}", addr),
            Err(e) => warn!("WebSocket server started, local address unknown: {}", e),
        }

        loop {
            tokio::select! {
                _ = context.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        let id = ConnectionId(next_id);
                        let _ = tracker.spawn(handle_connection(stream, peer, id, context.clone()));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
            }
        }

        drop(listener);
        tracker.close();
        info!(
            "Server closed, {} connection task(s) still winding down",
            tracker.len()
        );
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    context: HubContext,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let settings = context.settings;
    let handshake = tokio::select! {
        _ = context.shutdown.cancelled() => return,
        handshake = timeout(settings.handshake_timeout, tokio_tungstenite::accept_async(stream)) => handshake,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("WS handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!(
                "WS handshake with {} not completed within {:?}, dropping socket",
                peer, settings.handshake_timeout
            );
            return;
        }
    };

    let (sink, mut incoming) = ws.split();
    let conn = Arc::new(ClientConnection::new(id, peer, Box::new(WsSink::new(sink))));
    context.broadcaster.add(conn.clone()).await;
    info!(
        "WS client connected: {} {} (clients={})",
        id,
        peer,
        context.broadcaster.connection_count()
    );

    // First ping after one quiet interval.
    let mut ping_timer = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Set while a ping is unanswered
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => break,
            _ = conn.evicted() => {
                debug!("{} evicted by broadcaster", id);
                break;
            }
            _ = ping_timer.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = conn.ping(settings.ping_timeout).await {
                        warn!("WS ping to {} {} failed: {}", id, peer, e);
                        break;
                    }
                    pong_deadline = Some(Instant::now() + settings.ping_timeout);
                }
            }
            _ = expire(pong_deadline) => {
                warn!(
                    "WS client {} {} silent for {:?} after ping, dropping",
                    id, peer, settings.ping_timeout
                );
                break;
            }
            frame = incoming.next() => {
                // Any frame counts as a sign of life.
                pong_deadline = None;
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        info!("WS RECV <- {} from {}", text.as_str(), peer);
                        match ClientCommand::parse(text.as_str()) {
                            ClientCommand::Exit => handle_exit(peer, &context).await,
                            ClientCommand::Unknown(other) => {
                                debug!("Ignoring unrecognised message {:?} from {}", other, peer)
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame from {}", data.len(), peer)
                    }
                    Some(Ok(Message::Pong(_))) => debug!("WS pong from {} {}", id, peer),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WS read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }

    let _ = context.broadcaster.remove(id).await;
    match timeout(CLOSE_TIMEOUT, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing {} failed: {}", id, e),
        Err(_) => debug!("Closing {} timed out", id),
    }
    info!(
        "WS client disconnected: {} {} (clients={})",
        id,
        peer,
        context.broadcaster.connection_count()
    );
}

async fn handle_exit(peer: SocketAddr, context: &HubContext) {
    info!(
        "EXIT received from {}, stopping '{}' and server",
        peer,
        context.terminator.target()
    );

    // Neither failure nor a stuck terminator may keep the server alive.
    let limit = context.settings.terminate_timeout;
    match timeout(limit, context.terminator.terminate()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Terminate request failed: {}", e),
        Err(_) => warn!(
            "Stopping '{}' did not finish within {:?}, shutting down anyway",
            context.terminator.target(),
            limit
        ),
    }

    if !context
        .shutdown
        .trigger(ShutdownReason::ExitCommand { peer })
    {
        debug!("Shutdown already in progress");
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}
