//! Supervisor - wiring and lifecycle
//!
//! Starts the button poll loop, the event relay, the WebSocket accept loop and
//! the signal watcher, then waits for the single shutdown latch. SIGINT,
//! SIGTERM and a client's `EXIT` all pull the same [`ShutdownTrigger`]; only
//! the first pull counts.
//!
//! # Shutdown order
//!
//! ```text
//! trigger ─► accept loop stops (listener closed)
//!         ─► poll loop stops (sampler handed back)
//!         ─► relay drains queued presses      (bounded by grace period)
//!         ─► connection tasks close            (bounded by grace period)
//!         ─► GPIO pin released
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::button::monitor::Polling;
use crate::button::{ButtonEvent, ButtonMonitor, EdgeKind, GpioError, GpioSampler, MonitorError};
use crate::config::{Config, ConfigError};
use crate::process::ProcessTerminator;
use crate::server::protocol::DOWN;
use crate::server::{Broadcaster, ConnectionHub, ServerError};

/// Buffered button events between the poll loop and the relay, and per
/// subscriber.
const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Supervisor task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    ExitCommand { peer: SocketAddr },
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {}", name),
            ShutdownReason::ExitCommand { peer } => write!(f, "EXIT from {}", peer),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

/// Set-once shutdown latch shared by every task.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts shutdown. Returns `false` if it was already started.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        match self.reason.set(reason) {
            Ok(()) => {
                if let Some(reason) = self.reason.get() {
                    info!("Stop signal received: {}", reason);
                }
                self.token.cancel();
                true
            }
            Err(ignored) => {
                debug!("Shutdown already in progress, ignoring {}", ignored);
                false
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Waits for the trigger and returns why it fired.
    pub async fn wait(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }

    /// Token that is cancelled together with this trigger.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// What the shutdown sequence managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub listener_closed: bool,
    pub broadcasts_settled: bool,
    pub connections_closed: bool,
    pub pin_released: bool,
    pub presses_broadcast: u64,
}

pub struct Supervisor;

pub struct SupervisorHandle {
    local_addr: SocketAddr,
    trigger: ShutdownTrigger,
    events: broadcast::Sender<ButtonEvent>,
    task: JoinHandle<ShutdownReport>,
}

impl SupervisorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Every debounced edge, presses and releases, in detection order.
    ///
    /// Only edges relayed after the call are seen. A subscriber that falls
    /// more than the queue capacity behind gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ButtonEvent> {
        self.events.subscribe()
    }

    /// Resolves once the full shutdown sequence has run.
    pub async fn wait(self) -> Result<ShutdownReport, SupervisorError> {
        self.task
            .await
            .map_err(|e| SupervisorError::Task(e.to_string()))
    }
}

impl Supervisor {
    /// Binds the server and starts every task.
    ///
    /// The sampler must already be claimed; a bind failure releases it before
    /// returning the error.
    pub async fn start(
        config: &Config,
        sampler: Box<dyn GpioSampler>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Result<SupervisorHandle, SupervisorError> {
        config.validate()?;
        info!("Starting supervisor with config: {:?}", config);

        let trigger = ShutdownTrigger::new();
        let broadcaster = Arc::new(Broadcaster::new(
            config.send_timeout(),
            config.server.verbose,
        ));

        let hub = match ConnectionHub::bind(
            config.listen_addr(),
            broadcaster.clone(),
            terminator,
            trigger.clone(),
            config.hub_settings(),
        )
        .await
        {
            Ok(hub) => hub,
            Err(e) => {
                error!("Failed to start WebSocket server: {}", e);
                if let Err(release_err) = sampler.release() {
                    error!("GPIO release error: {}", release_err);
                }
                return Err(e.into());
            }
        };
        let local_addr = hub.local_addr()?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let monitor = ButtonMonitor::create(sampler, config.monitor_settings(), event_tx)?
            .initialize();

        let task = tokio::spawn(run(
            trigger.clone(),
            monitor,
            event_rx,
            events.clone(),
            hub,
            broadcaster,
            config.grace_period(),
        ));

        Ok(SupervisorHandle {
            local_addr,
            trigger,
            events,
            task,
        })
    }
}

async fn run(
    trigger: ShutdownTrigger,
    monitor: ButtonMonitor<Polling>,
    event_rx: mpsc::Receiver<ButtonEvent>,
    subscribers: broadcast::Sender<ButtonEvent>,
    hub: ConnectionHub,
    broadcaster: Arc<Broadcaster>,
    grace: Duration,
) -> ShutdownReport {
    let connections = hub.tracker();
    let poll = tokio::spawn(monitor.run_poll_loop(trigger.token()));
    let relay = tokio::spawn(relay_button_events(event_rx, subscribers, broadcaster));
    let accept = tokio::spawn(hub.run());
    let signals = tokio::spawn(watch_signals(trigger.clone()));

    let reason = trigger.wait().await;
    info!("Stop received ({}), shutting down", reason);

    let listener_closed = match accept.await {
        Ok(()) => true,
        Err(e) => {
            error!("Accept loop failed: {}", e);
            false
        }
    };

    // The poll loop owns the event sender; once it returns the relay sees
    // the end of the queue after the last pending press.
    let sampler = match poll.await {
        Ok(sampler) => Some(sampler),
        Err(e) => {
            error!("Button poll loop failed: {}", e);
            None
        }
    };

    let relay_abort = relay.abort_handle();
    let (broadcasts_settled, presses_broadcast) = match timeout(grace, relay).await {
        Ok(Ok(count)) => (true, count),
        Ok(Err(e)) => {
            error!("Event relay failed: {}", e);
            (false, 0)
        }
        Err(_) => {
            warn!("In-flight broadcasts did not settle within {:?}", grace);
            relay_abort.abort();
            (false, 0)
        }
    };

    let connections_closed = match timeout(grace, connections.wait()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                "{} connection(s) still open after {:?}",
                connections.len(),
                grace
            );
            false
        }
    };

    let pin_released = match sampler {
        Some(sampler) => match sampler.release() {
            Ok(()) => true,
            Err(e) => {
                error!("GPIO release error: {}", e);
                false
            }
        },
        None => false,
    };

    let _ = signals.await;

    info!("Shutdown complete");
    ShutdownReport {
        reason,
        listener_closed,
        broadcasts_settled,
        connections_closed,
        pin_released,
        presses_broadcast,
    }
}

/// Forwards debounced edges to subscribers and presses to clients, strictly
/// in detection order.
async fn relay_button_events(
    mut events: mpsc::Receiver<ButtonEvent>,
    subscribers: broadcast::Sender<ButtonEvent>,
    broadcaster: Arc<Broadcaster>,
) -> u64 {
    let mut presses = 0;
    while let Some(event) = events.recv().await {
        // No subscribers is fine
        let _ = subscribers.send(event.clone());
        match event.kind {
            EdgeKind::PressStart => {
                info!("BUTTON PRESS -> sending {}", DOWN);
                let report = broadcaster.broadcast(DOWN).await;
                presses += 1;
                debug!(
                    "Press relayed to {} client(s), {} evicted, {:.3}ms after detection",
                    report.delivered,
                    report.evicted.len(),
                    event.detected_at.elapsed().as_secs_f64() * 1000.0
                );
            }
            // Release edges only go to subscribers.
            EdgeKind::Release => debug!("Release edge, nothing to send"),
        }
    }
    debug!("Event relay finished after {} presses", presses);
    presses
}

#[cfg(unix)]
async fn watch_signals(trigger: ShutdownTrigger) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            tokio::select! {
                _ = trigger.cancelled() => {}
                _ = tokio::signal::ctrl_c() => { let _ = trigger.trigger(ShutdownReason::Signal("SIGINT")); }
            }
            return;
        }
    };

    tokio::select! {
        _ = trigger.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => { let _ = trigger.trigger(ShutdownReason::Signal("SIGINT")); }
            Err(e) => warn!("Could not listen for SIGINT: {}", e),
        },
        _ = terminate.recv() => { let _ = trigger.trigger(ShutdownReason::Signal("SIGTERM")); }
    }
}

#[cfg(not(unix))]
async fn watch_signals(trigger: ShutdownTrigger) {
    tokio::select! {
        _ = trigger.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => { let _ = trigger.trigger(ShutdownReason::Signal("SIGINT")); }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        },
    }
}
