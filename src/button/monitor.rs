use chrono::{DateTime, Local};
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debouncer::{Debouncer, Edge, EdgeKind};
use super::sampler::GpioSampler;

/// A debounced edge as published to the rest of the application.
#[derive(Debug, Clone)]
pub struct ButtonEvent {
    pub kind: EdgeKind,
    pub edge: Edge,
    /// Monotonic instant of the poll that committed the edge.
    pub detected_at: std::time::Instant,
    /// How long the raw level had been steady when the edge was committed.
    pub settled_for: Duration,
    /// Wall clock, for display only.
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub debounce_time: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            debounce_time: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid monitor settings: {0}")]
    InvalidSettings(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum MonitorState {
    Initializing,
    Polling,
}

#[machine]
pub struct ButtonMonitor<S: MonitorState> {
    // Debounce filter, owns the sampler
    debouncer: Debouncer,

    settings: MonitorSettings,

    // Consumers of debounced edges (relay to clients, future subscribers)
    event_sender: mpsc::Sender<ButtonEvent>,

    // Edges committed since start
    edge_count: u64,
}

impl<S: MonitorState> ButtonMonitor<S> {
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count
    }
}

impl ButtonMonitor<Initializing> {
    pub fn create(
        sampler: Box<dyn GpioSampler>,
        settings: MonitorSettings,
        event_sender: mpsc::Sender<ButtonEvent>,
    ) -> Result<Self, MonitorError> {
        debug!("Creating Button Monitor with settings: {:?}", settings);

        if settings.poll_interval.is_zero() {
            return Err(MonitorError::InvalidSettings(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if settings.debounce_time < settings.poll_interval {
            warn!(
                "Debounce time {:?} is shorter than the poll interval {:?}; every stable sample commits",
                settings.debounce_time, settings.poll_interval
            );
        }

        let debouncer = Debouncer::new(
            sampler,
            settings.debounce_time,
            Instant::now().into_std(),
        );

        Ok(Self::new(debouncer, settings, event_sender, 0))
    }

    pub fn initialize(self) -> ButtonMonitor<Polling> {
        let state = self.debouncer.state();
        info!(
            "Button monitor initialized: raw={} stable={} (pressed=asserted)",
            state.raw_level, state.stable_level
        );
        self.transition()
    }
}

impl ButtonMonitor<Polling> {
    /// Runs one debounce step and publishes the edge, if any.
    ///
    /// Publishing never waits: a full event queue drops the event with a
    /// warning rather than stalling the next sample.
    pub fn poll_tick(&mut self, now: std::time::Instant) -> Option<ButtonEvent> {
        let settled_since = self.debouncer.state().last_raw_change;
        let edge = self.debouncer.poll_once(now)?;
        self.edge_count += 1;

        let event = ButtonEvent {
            kind: edge.kind(),
            edge,
            detected_at: now,
            settled_for: now.saturating_duration_since(settled_since),
            timestamp: Local::now(),
        };

        info!(
            "GPIO debounced edge -> {}->{} (steady for {:.3}ms)",
            edge.from,
            edge.to,
            event.settled_for.as_secs_f64() * 1000.0
        );
        match event.kind {
            EdgeKind::PressStart => info!(
                "BUTTON PRESS (start) at {}",
                event.timestamp.format("%H:%M:%S%.3f")
            ),
            EdgeKind::Release => info!(
                "BUTTON RELEASE (end) at {}",
                event.timestamp.format("%H:%M:%S%.3f")
            ),
        }

        match self.event_sender.try_send(event.clone()) {
            Ok(_) => debug!("Button event queued for relay"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Button event queue full, dropping {:?} edge", event.kind)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Button event queue closed, no consumers left")
            }
        }

        Some(event)
    }

    /// Polls until `cancel` fires, then hands the sampler back for release.
    ///
    /// The only wait is the poll-interval sleep, which is raced against the
    /// token, so shutdown latency is bounded by one interval.
    pub async fn run_poll_loop(mut self, cancel: CancellationToken) -> Box<dyn GpioSampler> {
        info!(
            "Starting button poll loop (interval={:?}, debounce={:?})",
            self.settings.poll_interval, self.settings.debounce_time
        );

        while !cancel.is_cancelled() {
            let _ = self.poll_tick(Instant::now().into_std());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.poll_interval) => {}
            }
        }

        info!(
            "Button poll loop stopped after {} debounced edges",
            self.edge_count
        );
        self.debouncer.into_sampler()
    }
}
