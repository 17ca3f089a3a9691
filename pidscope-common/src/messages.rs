//! Wire messages exchanged between the bridge and its subscribers.
//!
//! Outbound events are single JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"read","timestamp":1700000000000,"data":[50.0,0.5]}
//! {"type":"connected"}
//! {"type":"recovered"}
//! ```
//!
//! The only inbound message is a setpoint write. JSON cannot carry
//! infinity, so a `null` field means "leave this register unchanged".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceEvent {
    /// A decoded block of input registers.
    Read {
        /// Unix epoch milliseconds at which the device response arrived.
        timestamp: i64,
        /// Decoded values in register order.
        data: Vec<f32>,
    },
    /// A fresh connection to the device was established.
    Connected,
    /// Polling succeeded again after a failure run.
    Recovered,
}

impl DeviceEvent {
    /// Short name matching the wire `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::Read { .. } => "read",
            DeviceEvent::Connected => "connected",
            DeviceEvent::Recovered => "recovered",
        }
    }

    /// Serialize to a single JSON object.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Holding-register setpoint block.
///
/// Field order is the register order on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setpoint {
    #[serde(default)]
    pub target_frequency: Option<f32>,
    #[serde(default)]
    pub proportional_factor: Option<f32>,
    #[serde(default)]
    pub integration_time: Option<f32>,
    #[serde(default)]
    pub differentiation_time: Option<f32>,
}

impl Setpoint {
    /// Number of float values (two registers each) in a setpoint block.
    pub const LEN: usize = 4;

    /// Values in wire order; `None` marks a register the device should keep.
    pub fn to_registers(&self) -> [Option<f32>; Self::LEN] {
        [
            self.target_frequency,
            self.proportional_factor,
            self.integration_time,
            self.differentiation_time,
        ]
    }
}

/// Message received from a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Push a setpoint block to the device.
    Write { data: Setpoint },
}

/// Reasons an inbound message is rejected.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported message type: {0}")]
    Unsupported(String),
}

impl InboundMessage {
    /// Parse a raw inbound message.
    ///
    /// Valid JSON with an unknown or missing `type` is reported as
    /// [`MessageError::Unsupported`] rather than malformed.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("write") => Ok(serde_json::from_value(value)?),
            Some(other) => Err(MessageError::Unsupported(other.to_string())),
            None => Err(MessageError::Unsupported("<missing>".to_string())),
        }
    }
}

/// Current time as Unix epoch milliseconds.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
