//! Modbus/TCP bridge for a PID frequency controller.
//!
//! The bridge polls a block of input registers at a fixed rate, decodes them
//! as big-endian floats, and streams each reading to every connected
//! subscriber. Subscribers may push setpoint writes back to the device's
//! holding registers.
//!
//! # Wire format
//!
//! ```text
//! {"type":"read","timestamp":1700000000000,"data":[50.0,0.5]}
//! {"type":"connected"}
//! {"type":"recovered"}
//! {"type":"write","data":{"targetFrequency":50.0,"proportionalFactor":null}}
//! ```
//!
//! A `null` setpoint field is sent to the device as `+inf`, which it treats
//! as "keep the current value".

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod poller;
pub mod server;
pub mod status;

#[cfg(test)]
mod fake;

pub use config::{BridgeConfig, PollOptions};
pub use connection::{ConnectionManager, TcpConnector};
pub use gateway::WriteGateway;
pub use hub::{BroadcastHub, event_channel};
pub use poller::{PollerHandle, PollingEngine};
pub use status::StatusSnapshot;
