use std::time::{Duration, Instant};
use tracing::debug;

use super::sampler::{GpioSampler, PinLevel};

/// A committed transition between two stable levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: PinLevel,
    pub to: PinLevel,
}

/// What an edge means for a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    PressStart,
    Release,
}

impl Edge {
    pub fn kind(&self) -> EdgeKind {
        match self.to {
            PinLevel::Asserted => EdgeKind::PressStart,
            PinLevel::Released => EdgeKind::Release,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceState {
    pub raw_level: PinLevel,
    pub stable_level: PinLevel,
    pub last_raw_change: Instant,
}

/// Time-gated debounce filter.
///
/// A level is only committed once the raw signal has stayed on it for
/// `debounce_time`. Every raw flip restarts the timer, so contact bounce never
/// reaches the stable level.
#[derive(Debug)]
pub struct Debouncer {
    sampler: Box<dyn GpioSampler>,
    debounce_time: Duration,
    state: DebounceState,
}

impl Debouncer {
    /// Takes the first sample immediately; whatever the pin reads becomes both
    /// the raw and the stable level.
    pub fn new(mut sampler: Box<dyn GpioSampler>, debounce_time: Duration, now: Instant) -> Self {
        let initial = sampler.sample();
        Self {
            sampler,
            debounce_time,
            state: DebounceState {
                raw_level: initial,
                stable_level: initial,
                last_raw_change: now,
            },
        }
    }

    pub fn poll_once(&mut self, now: Instant) -> Option<Edge> {
        let sampled = self.sampler.sample();

        if sampled != self.state.raw_level {
            self.state.raw_level = sampled;
            self.state.last_raw_change = now;
            debug!("GPIO raw change -> {} (debouncing)", sampled);
            return None;
        }

        let held_for = now.saturating_duration_since(self.state.last_raw_change);
        if sampled != self.state.stable_level && held_for >= self.debounce_time {
            let from = self.state.stable_level;
            self.state.stable_level = sampled;
            return Some(Edge { from, to: sampled });
        }

        None
    }

    pub fn state(&self) -> &DebounceState {
        &self.state
    }

    pub fn stable_level(&self) -> PinLevel {
        self.state.stable_level
    }

    /// Gives the sampler back so the pin can be released.
    pub fn into_sampler(self) -> Box<dyn GpioSampler> {
        self.sampler
    }
}
