//! Button input subsystem
//!
//! Turns a bouncing mechanical contact into clean, timestamped edges:
//!
//! 1. [`sampler`] - Raw pin reads (rppal or a virtual pin)
//! 2. [`debouncer`] - Time-gated debounce filter
//! 3. [`monitor`] - Poll loop and lifecycle, publishes [`ButtonEvent`]s
//!
//! # Architecture
//!
//! ```text
//! GPIO pin ──► Sampler ──► Debouncer ──► ButtonMonitor ──► mpsc<ButtonEvent>
//!              (PinLevel)  (Edge)        (1ms poll loop)
//! ```
//!
//! Debounce timing uses the monotonic clock only; wall-clock timestamps are
//! attached to events for logging.

pub mod debouncer;
pub mod monitor;
pub mod sampler;

pub use debouncer::{DebounceState, Debouncer, Edge, EdgeKind};
pub use monitor::{ButtonEvent, ButtonMonitor, MonitorError, MonitorSettings};
pub use sampler::{ActiveLevel, Bias, GpioError, GpioSampler, PinLevel, RppalSampler, VirtualPin};
