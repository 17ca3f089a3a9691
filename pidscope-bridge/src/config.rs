//! Configuration for the bridge.

use pidscope_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::codec::WORDS_PER_VALUE;

/// Largest number of float values one read may request (125 registers).
pub const MAX_READ_COUNT: u16 = 62;

/// Highest supported sampling rate, in samples per second.
pub const MAX_SAMPLE_RATE: f64 = 1000.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] pidscope_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Controller device settings
    pub device: DeviceConfig,

    /// Subscriber-facing HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the polled Modbus/TCP device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Readings per second; the poll interval is its inverse
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Delay after a failed poll before polling resumes, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Consecutive failures tolerated before the connection is dropped
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Connect and per-transaction timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Input-register block to poll
    #[serde(default)]
    pub read: ReadConfig,

    /// First holding register of the setpoint block
    #[serde(default)]
    pub write_address: u16,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_sample_rate() -> f64 {
    10.0
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Input registers read on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Starting address (0-based)
    #[serde(default)]
    pub address: u16,

    /// Number of float values to decode from the response
    #[serde(default = "default_read_count")]
    pub count: u16,

    /// How `count` is expressed in the request
    #[serde(default)]
    pub quantity: ReadQuantity,
}

fn default_read_count() -> u16 {
    2
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            address: 0,
            count: default_read_count(),
            quantity: ReadQuantity::default(),
        }
    }
}

/// Unit of the quantity field in a read request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadQuantity {
    /// One per float value; the controller firmware answers with two words each
    #[default]
    Values,
    /// One per 16-bit register, as plain Modbus devices expect
    Words,
}

impl ReadQuantity {
    /// Quantity to put in a request for `count` float values.
    pub fn request_quantity(self, count: u16) -> u16 {
        match self {
            ReadQuantity::Values => count,
            ReadQuantity::Words => count * WORDS_PER_VALUE,
        }
    }
}

/// Subscriber-facing server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: "0.0.0.0:3000")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Events buffered per subscriber before it is dropped as too slow
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// The polling parameters that may change while the bridge runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub read_count: u16,
}

/// Partial update of [`PollSettings`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOptions {
    #[serde(default)]
    pub read_count: Option<u16>,
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

impl PollSettings {
    /// Apply a partial update, validating each field present.
    pub fn apply(mut self, options: &PollOptions) -> Result<Self, ConfigError> {
        if let Some(count) = options.read_count {
            validate_read_count(count)?;
            self.read_count = count;
        }
        if let Some(rate) = options.sample_rate {
            self.interval = interval_from_rate(rate)?;
        }
        Ok(self)
    }
}

/// Poll interval for a sampling rate in samples per second.
pub fn interval_from_rate(rate: f64) -> Result<Duration, ConfigError> {
    let out_of_range = || {
        ConfigError::Validation(format!(
            "sample_rate must be in (0, {}], got {}",
            MAX_SAMPLE_RATE, rate
        ))
    };
    if !rate.is_finite() || rate <= 0.0 || rate > MAX_SAMPLE_RATE {
        return Err(out_of_range());
    }
    // Tiny rates give a period too long for a Duration.
    Duration::try_from_secs_f64(1.0 / rate).map_err(|_| out_of_range())
}

fn validate_read_count(count: u16) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(ConfigError::Validation(format!(
            "read count must be 1-{}, got {}",
            MAX_READ_COUNT, count
        )));
    }
    Ok(())
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: BridgeConfig = pidscope_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = pidscope_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;

        if self.server.subscriber_buffer == 0 {
            return Err(ConfigError::Validation(
                "server.subscriber_buffer must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl DeviceConfig {
    /// Validate the device section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device.host cannot be empty".to_string(),
            ));
        }

        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "device.unit_id must be 1-247, got {}",
                self.unit_id
            )));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "device.timeout_ms must be positive".to_string(),
            ));
        }

        interval_from_rate(self.sample_rate)?;
        validate_read_count(self.read.count)?;

        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Initial runtime polling settings.
    ///
    /// Falls back to the default rate if `sample_rate` was never validated.
    pub fn poll_settings(&self) -> PollSettings {
        let interval = interval_from_rate(self.sample_rate)
            .unwrap_or_else(|_| Duration::from_secs_f64(1.0 / default_sample_rate()));
        PollSettings {
            interval,
            read_count: self.read.count,
        }
    }
}
