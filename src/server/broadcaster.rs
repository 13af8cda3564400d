//! Message fan-out to connected WebSocket clients.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{ClientConnection, ConnectionId};

/// Default per-client send deadline.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of one [`Broadcaster::broadcast`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Holds the client set and sends to all of it at once.
pub struct Broadcaster {
    /// Connected clients indexed by connection ID.
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    /// Mirrors the map size so counting never takes the lock.
    active_count: AtomicUsize,
    send_timeout: Duration,
    verbose: bool,
}

impl Broadcaster {
    pub fn new(send_timeout: Duration, verbose: bool) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            send_timeout,
            verbose,
        }
    }

    /// Registers a connection. Adding the same ID twice keeps one entry.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        if conns.insert(connection.id, connection).is_none() {
            let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Unregisters a connection; unknown IDs are ignored.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut conns = self.connections.write().await;
        if conns.remove(&id).is_some() {
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Sends `message` to every registered client concurrently.
    ///
    /// The set is snapshotted under the read lock and the lock is released
    /// before any network I/O. Each send has its own deadline; clients whose
    /// send fails or times out are evicted and removed. Returns once every
    /// send has settled, which takes at most one send deadline regardless of
    /// how many clients are connected.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let snapshot: Vec<Arc<ClientConnection>> =
            self.connections.read().await.values().cloned().collect();

        if snapshot.is_empty() {
            info!("No WS clients connected; skipping send of {}", message);
            return BroadcastReport::default();
        }

        let sends = snapshot.iter().map(|conn| self.send_one(conn, message));
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (conn, ok) in snapshot.iter().zip(results) {
            if ok {
                report.delivered += 1;
            } else {
                conn.evict();
                report.evicted.push(conn.id);
            }
        }

        if !report.evicted.is_empty() {
            let mut conns = self.connections.write().await;
            for id in &report.evicted {
                if conns.remove(id).is_some() {
                    let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        debug!(
            payload = message,
            recipients = snapshot.len(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "broadcast settled"
        );
        report
    }

    async fn send_one(&self, conn: &ClientConnection, message: &str) -> bool {
        let started = Instant::now();
        if self.verbose {
            info!("WS SEND start -> {} to {} ({})", message, conn.id, conn.peer);
        }

        match conn.send(message, self.send_timeout).await {
            Ok(()) => {
                if self.verbose {
                    info!(
                        "WS SEND done  -> {} to {} (dur_ms={:.3})",
                        message,
                        conn.id,
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
                true
            }
            Err(e) => {
                warn!(
                    "WS SEND fail  -> {} to {} ({}) (dur_ms={:.3}) err={}; removing client",
                    message,
                    conn.id,
                    conn.peer,
                    started.elapsed().as_secs_f64() * 1000.0,
                    e
                );
                false
            }
        }
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.connection_count() == 0
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::{ClientSink, SendError};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Accept,
        Fail,
        Hang,
    }

    struct FakeSink {
        behaviour: Behaviour,
        received: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ClientSink for FakeSink {
        async fn send_text(&self, text: &str) -> Result<(), SendError> {
            match self.behaviour {
                Behaviour::Accept => {
                    self.received.lock().unwrap().push(text.to_string());
                    Ok(())
                }
                Behaviour::Fail => Err(SendError::Closed),
                Behaviour::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn send_ping(&self) -> Result<(), SendError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn make_connection(
        id: u64,
        behaviour: Behaviour,
    ) -> (Arc<ClientConnection>, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = FakeSink {
            behaviour,
            received: received.clone(),
        };
        let peer: SocketAddr = ([127, 0, 0, 1], 40000 + id as u16).into();
        let conn = ClientConnection::new(ConnectionId(id), peer, Box::new(sink));
        (Arc::new(conn), received)
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Duration::from_millis(50), true)
    }

    #[tokio::test]
    async fn add_connection() {
        let bc = broadcaster();
        let (conn, _) = make_connection(1, Behaviour::Accept);
        bc.add(conn).await;
        assert_eq!(bc.connection_count(), 1);
        assert!(bc.contains(ConnectionId(1)).await);
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let bc = broadcaster();
        let (conn, _) = make_connection(1, Behaviour::Accept);
        bc.add(conn.clone()).await;
        bc.add(conn).await;
        assert_eq!(bc.connection_count(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let bc = broadcaster();
        let (conn, _) = make_connection(1, Behaviour::Accept);
        bc.add(conn).await;
        assert!(bc.remove(ConnectionId(1)).await);
        assert!(!bc.remove(ConnectionId(1)).await);
        assert!(!bc.remove(ConnectionId(99)).await);
        assert!(bc.is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_empty_set() {
        let bc = broadcaster();
        let report = bc.broadcast("DOWN").await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_once() {
        let bc = broadcaster();
        let mut inboxes = Vec::new();
        for id in 0..5 {
            let (conn, inbox) = make_connection(id, Behaviour::Accept);
            bc.add(conn).await;
            inboxes.push(inbox);
        }

        let report = bc.broadcast("DOWN").await;
        assert_eq!(report.delivered, 5);
        assert!(report.evicted.is_empty());
        for inbox in inboxes {
            assert_eq!(*inbox.lock().unwrap(), vec!["DOWN".to_string()]);
        }
    }

    #[tokio::test]
    async fn failing_client_is_removed_and_others_still_receive() {
        let bc = broadcaster();
        let n = 6;
        let failing = 3;
        let mut inboxes = Vec::new();
        let mut failing_conn = None;
        for id in 0..n {
            let behaviour = if id == failing {
                Behaviour::Fail
            } else {
                Behaviour::Accept
            };
            let (conn, inbox) = make_connection(id, behaviour);
            if id == failing {
                failing_conn = Some(conn.clone());
            } else {
                inboxes.push(inbox);
            }
            bc.add(conn).await;
        }

        let report = bc.broadcast("DOWN").await;

        assert_eq!(report.delivered, (n - 1) as usize);
        assert_eq!(report.evicted, vec![ConnectionId(failing)]);
        assert_eq!(bc.connection_count(), (n - 1) as usize);
        assert!(!bc.contains(ConnectionId(failing)).await);
        assert!(failing_conn.unwrap().is_evicted());
        for inbox in inboxes {
            assert_eq!(inbox.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_client_bounds_broadcast_time() {
        let bc = broadcaster();
        for id in 0..50 {
            let behaviour = if id % 10 == 0 {
                Behaviour::Hang
            } else {
                Behaviour::Accept
            };
            let (conn, _) = make_connection(id, behaviour);
            bc.add(conn).await;
        }

        let started = Instant::now();
        let report = bc.broadcast("DOWN").await;
        let elapsed = started.elapsed();

        // Sends run concurrently, so five hanging clients cost one deadline.
        assert!(elapsed >= bc.send_timeout());
        assert!(elapsed < bc.send_timeout() * 2);
        assert_eq!(report.evicted.len(), 5);
        assert_eq!(report.delivered, 45);
        assert_eq!(bc.connection_count(), 45);
    }

    #[tokio::test]
    async fn evicted_client_is_not_retried() {
        let bc = broadcaster();
        let (bad, _) = make_connection(1, Behaviour::Fail);
        let (good, inbox) = make_connection(2, Behaviour::Accept);
        bc.add(bad).await;
        bc.add(good).await;

        let _ = bc.broadcast("DOWN").await;
        let second = bc.broadcast("DOWN").await;

        assert_eq!(second.delivered, 1);
        assert!(second.evicted.is_empty());
        assert_eq!(inbox.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn add_during_broadcast_is_safe() {
        let bc = Arc::new(broadcaster());
        for id in 0..10 {
            let (conn, _) = make_connection(id, Behaviour::Accept);
            bc.add(conn).await;
        }

        let adder = {
            let bc = bc.clone();
            tokio::spawn(async move {
                for id in 10..20 {
                    let (conn, _) = make_connection(id, Behaviour::Accept);
                    bc.add(conn).await;
                    let _ = bc.remove(ConnectionId(id - 10)).await;
                }
            })
        };
        for _ in 0..10 {
            let _ = bc.broadcast("DOWN").await;
        }
        adder.await.unwrap();

        assert_eq!(bc.connection_count(), 10);
    }
}
