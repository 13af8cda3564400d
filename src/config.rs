//! Runtime configuration.
//!
//! Loaded from `~/.buttoncast/config.toml` (or `$BUTTONCAST_CONFIG`). A missing
//! file falls back to defaults so a fresh Pi starts without any setup; the
//! environment variables `POLL_INTERVAL`, `DEBOUNCE_TIME` and `WS_VERBOSE` win
//! over the file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::button::{ActiveLevel, Bias, MonitorSettings};
use crate::process::{NoopTerminator, Pkill, ProcessTerminator};
use crate::server::HubSettings;

pub const CONFIG_DIR: &str = ".buttoncast";
pub const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "BUTTONCAST_CONFIG";

pub const POLL_INTERVAL_ENV: &str = "POLL_INTERVAL";
pub const DEBOUNCE_TIME_ENV: &str = "DEBOUNCE_TIME";
pub const VERBOSE_ENV: &str = "WS_VERBOSE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub gpio: GpioConfig,
    pub debounce: DebounceConfig,
    pub server: ServerConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GpioConfig {
    /// BCM pin number
    pub pin: u8,
    pub bias: Bias,
    pub active_level: ActiveLevel,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            pin: 27,
            bias: Bias::PullUp,
            active_level: ActiveLevel::Low,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DebounceConfig {
    pub poll_interval_secs: f64,
    pub debounce_time_secs: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 0.001,
            debounce_time_secs: 0.03,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub send_timeout_ms: u64,
    /// Time a new socket gets to finish the WebSocket upgrade
    pub handshake_timeout_ms: u64,
    /// Keepalive ping period for idle clients
    pub ping_interval_ms: u64,
    /// Unanswered ping limit before a client is dropped
    pub ping_timeout_ms: u64,
    /// Log every individual send
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            send_timeout_ms: 250,
            handshake_timeout_ms: 10_000,
            ping_interval_ms: 20_000,
            ping_timeout_ms: 20_000,
            verbose: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound for draining broadcasts and closing connections
    pub grace_period_ms: u64,
    /// Process name passed to `pkill` on EXIT; empty disables
    pub terminate_process: String,
    /// Longest wait for the terminate command before shutting down anyway
    pub terminate_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
            terminate_process: "chromium-browser".to_string(),
            terminate_timeout_ms: 3000,
        }
    }
}

impl Config {
    /// `$BUTTONCAST_CONFIG`, else `~/.buttoncast/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// File, then environment overrides, then validation.
    pub async fn load() -> Result<Self, ConfigError> {
        let config = Self::load_from(&Self::default_path())
            .await?
            .with_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies the environment-style overrides returned by `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            self.debounce.poll_interval_secs = parse_seconds(POLL_INTERVAL_ENV, &value)?;
            debug!("{} override: {}", POLL_INTERVAL_ENV, value);
        }
        if let Some(value) = lookup(DEBOUNCE_TIME_ENV) {
            self.debounce.debounce_time_secs = parse_seconds(DEBOUNCE_TIME_ENV, &value)?;
            debug!("{} override: {}", DEBOUNCE_TIME_ENV, value);
        }
        if let Some(value) = lookup(VERBOSE_ENV) {
            self.server.verbose = value == "1";
            debug!("{} override: {}", VERBOSE_ENV, value);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = seconds_to_duration("debounce.poll_interval_secs", self.debounce.poll_interval_secs)?;
        if poll.is_zero() {
            return Err(ConfigError::Invalid(
                "debounce.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        let _ = seconds_to_duration("debounce.debounce_time_secs", self.debounce.debounce_time_secs)?;
        for (name, value) in [
            ("server.send_timeout_ms", self.server.send_timeout_ms),
            ("server.handshake_timeout_ms", self.server.handshake_timeout_ms),
            ("server.ping_interval_ms", self.server.ping_interval_ms),
            ("server.ping_timeout_ms", self.server.ping_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        let defaults = MonitorSettings::default();
        MonitorSettings {
            poll_interval: Duration::try_from_secs_f64(self.debounce.poll_interval_secs)
                .unwrap_or(defaults.poll_interval),
            debounce_time: Duration::try_from_secs_f64(self.debounce.debounce_time_secs)
                .unwrap_or(defaults.debounce_time),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind_address, self.server.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.server.send_timeout_ms)
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
            ping_interval: Duration::from_millis(self.server.ping_interval_ms),
            ping_timeout: Duration::from_millis(self.server.ping_timeout_ms),
            terminate_timeout: Duration::from_millis(self.shutdown.terminate_timeout_ms),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    pub fn terminator(&self) -> Arc<dyn ProcessTerminator> {
        let name = self.shutdown.terminate_process.trim();
        if name.is_empty() {
            Arc::new(NoopTerminator)
        } else {
            Arc::new(Pkill::new(name))
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

fn parse_seconds(var: &'static str, value: &str) -> Result<f64, ConfigError> {
    let secs: f64 = value.trim().parse().map_err(|e: std::num::ParseFloatError| ConfigError::Env {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    seconds_to_duration(var, secs).map_err(|e| ConfigError::Env {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    Ok(secs)
}

fn seconds_to_duration(name: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::Invalid(format!("{} = {}: {}", name, secs, e)))
}
