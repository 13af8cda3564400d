//! Raw pin access.
//!
//! [`GpioSampler`] is the only place that touches hardware. Everything above it
//! works with logical [`PinLevel`]s, so the wiring polarity lives in exactly one
//! spot: the [`ActiveLevel`] handed to the sampler at claim time.

use rppal::gpio::{Gpio, InputPin, Level};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Logical state of the button contact, independent of wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinLevel {
    Asserted,
    Released,
}

impl fmt::Display for PinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinLevel::Asserted => write!(f, "asserted"),
            PinLevel::Released => write!(f, "released"),
        }
    }
}

/// Internal resistor configuration for the input pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    #[default]
    PullUp,
    PullDown,
    Off,
}

/// Physical level that counts as "pressed".
///
/// With a pull-up the pin idles high and the switch pulls it to ground, so the
/// default is [`ActiveLevel::Low`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveLevel {
    #[default]
    Low,
    High,
}

impl ActiveLevel {
    pub fn to_pin_level(self, physical: Level) -> PinLevel {
        match (self, physical) {
            (ActiveLevel::Low, Level::Low) | (ActiveLevel::High, Level::High) => PinLevel::Asserted,
            _ => PinLevel::Released,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("Failed to claim GPIO pin {pin}: {source}")]
    Claim {
        pin: u8,
        #[source]
        source: rppal::gpio::Error,
    },
}

/// Reads the current level of one input pin.
///
/// `sample` is called once per poll tick and must not block. `release` hands
/// the pin back to the system; taking `Box<Self>` makes a second release
/// impossible.
pub trait GpioSampler: Send + fmt::Debug {
    fn sample(&mut self) -> PinLevel;

    fn release(self: Box<Self>) -> Result<(), GpioError>;
}

/// Raspberry Pi input pin backed by rppal.
#[derive(Debug)]
pub struct RppalSampler {
    pin: InputPin,
    active_level: ActiveLevel,
}

impl RppalSampler {
    pub fn claim(pin: u8, bias: Bias, active_level: ActiveLevel) -> Result<Self, GpioError> {
        info!("Claiming GPIO pin {} (bias={:?}, active={:?})", pin, bias, active_level);

        let claim_err = |source| GpioError::Claim { pin, source };
        let gpio = Gpio::new().map_err(claim_err)?;
        let raw = gpio.get(pin).map_err(claim_err)?;

        let mut input = match bias {
            Bias::PullUp => raw.into_input_pullup(),
            Bias::PullDown => raw.into_input_pulldown(),
            Bias::Off => raw.into_input(),
        };
        // Dropping the pin restores its previous mode.
        input.set_reset_on_drop(true);

        debug!("GPIO pin {} claimed, initial physical level {:?}", pin, input.read());
        Ok(Self {
            pin: input,
            active_level,
        })
    }
}

impl GpioSampler for RppalSampler {
    fn sample(&mut self) -> PinLevel {
        self.active_level.to_pin_level(self.pin.read())
    }

    fn release(self: Box<Self>) -> Result<(), GpioError> {
        let pin = self.pin.pin();
        drop(self);
        info!("GPIO pin {} released", pin);
        Ok(())
    }
}

/// Software-driven pin.
///
/// Clones share the same level, so one clone can be handed to the monitor
/// while another one flips the level from a test or a simulator.
#[derive(Debug, Clone)]
pub struct VirtualPin {
    asserted: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl VirtualPin {
    pub fn new(initial: PinLevel) -> Self {
        Self {
            asserted: Arc::new(AtomicBool::new(initial == PinLevel::Asserted)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, level: PinLevel) {
        self.asserted
            .store(level == PinLevel::Asserted, Ordering::SeqCst);
    }

    pub fn level(&self) -> PinLevel {
        if self.asserted.load(Ordering::SeqCst) {
            PinLevel::Asserted
        } else {
            PinLevel::Released
        }
    }

    /// How many times a clone of this pin has been released.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl GpioSampler for VirtualPin {
    fn sample(&mut self) -> PinLevel {
        self.level()
    }

    fn release(self: Box<Self>) -> Result<(), GpioError> {
        let _ = self.releases.fetch_add(1, Ordering::SeqCst);
        debug!("Virtual pin released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_up_wiring_maps_low_to_asserted() {
        assert_eq!(ActiveLevel::Low.to_pin_level(Level::Low), PinLevel::Asserted);
        assert_eq!(ActiveLevel::Low.to_pin_level(Level::High), PinLevel::Released);
    }

    #[test]
    fn active_high_wiring_maps_high_to_asserted() {
        assert_eq!(ActiveLevel::High.to_pin_level(Level::High), PinLevel::Asserted);
        assert_eq!(ActiveLevel::High.to_pin_level(Level::Low), PinLevel::Released);
    }

    #[test]
    fn virtual_pin_clones_share_level() {
        let pin = VirtualPin::new(PinLevel::Released);
        let mut sampler = pin.clone();
        assert_eq!(sampler.sample(), PinLevel::Released);

        pin.set(PinLevel::Asserted);
        assert_eq!(sampler.sample(), PinLevel::Asserted);
    }

    #[test]
    fn virtual_pin_counts_releases() {
        let pin = VirtualPin::new(PinLevel::Released);
        let boxed: Box<dyn GpioSampler> = Box::new(pin.clone());
        boxed.release().unwrap();
        assert_eq!(pin.release_count(), 1);
    }
}
