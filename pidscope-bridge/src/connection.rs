//! Modbus session ownership.
//!
//! The [`ConnectionManager`] holds at most one live session. Callers borrow it
//! through [`ConnectionManager::acquire`], which connects lazily and keeps the
//! session locked for the duration of one transaction, so the polling loop and
//! the write path never interleave requests on the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pidscope_common::{DeviceEvent, current_timestamp_millis};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{ConnectError, ProtocolError};
use crate::hub::EventSender;

/// Lifecycle of the device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Response to an input-register read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFrame {
    /// Unix epoch milliseconds at which the response arrived.
    pub received_at: i64,
    pub words: Vec<u16>,
}

/// An open Modbus session.
#[async_trait]
pub trait ModbusSession: Send {
    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<InputFrame, ProtocolError>;

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        words: &[u16],
    ) -> Result<(), ProtocolError>;

    /// Tear the session down. Errors are only logged.
    async fn disconnect(&mut self);
}

/// Opens sessions to one device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ModbusSession>, ConnectError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Modbus/TCP connector backed by tokio-modbus.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }

    pub fn from_config(device: &DeviceConfig) -> Self {
        Self::new(
            device.host.clone(),
            device.port,
            device.unit_id,
            device.timeout(),
        )
    }

    async fn open(&self) -> Result<Context, ConnectError> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| ConnectError::Dns {
                host: target.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ConnectError::Dns {
                host: target.clone(),
                reason: "no addresses found".to_string(),
            })?;

        debug!(%addr, unit_id = self.unit_id, "Resolved Modbus device");

        tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(ConnectError::Unreachable)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn ModbusSession>, ConnectError> {
        let ctx = tokio::time::timeout(self.timeout, self.open())
            .await
            .map_err(|_| ConnectError::Timeout(self.timeout))??;

        Ok(Box::new(TcpSession {
            ctx,
            timeout: self.timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

struct TcpSession {
    ctx: Context,
    timeout: Duration,
}

fn protocol_error(err: tokio_modbus::Error) -> ProtocolError {
    match err {
        tokio_modbus::Error::Transport(e) => ProtocolError::Transport(e),
        other => ProtocolError::OutOfSync(other.to_string()),
    }
}

#[async_trait]
impl ModbusSession for TcpSession {
    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<InputFrame, ProtocolError> {
        let words = tokio::time::timeout(
            self.timeout,
            self.ctx.read_input_registers(address, quantity),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(self.timeout))?
        .map_err(protocol_error)?
        .map_err(|code| ProtocolError::Exception(format!("{:?}", code)))?;

        Ok(InputFrame {
            received_at: current_timestamp_millis(),
            words,
        })
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        words: &[u16],
    ) -> Result<(), ProtocolError> {
        tokio::time::timeout(
            self.timeout,
            self.ctx.write_multiple_registers(address, words),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(self.timeout))?
        .map_err(protocol_error)?
        .map_err(|code| ProtocolError::Exception(format!("{:?}", code)))
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            debug!(error = %e, "Error while closing Modbus session");
        }
    }
}

/// Counters describing connection churn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Sessions successfully opened.
    pub connects: u64,
    /// Calls to [`ConnectionManager::release`].
    pub releases: u64,
}

/// Owner of the single device session.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    slot: Mutex<Option<Box<dyn ModbusSession>>>,
    state: watch::Sender<ConnectionState>,
    events: EventSender,
    connects: AtomicU64,
    releases: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager; `Connected` events are emitted on `events`.
    pub fn new(connector: Box<dyn Connector>, events: EventSender) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            slot: Mutex::new(None),
            state,
            events,
            connects: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Borrow the open session, connecting first if there is none.
    ///
    /// The returned guard serializes all users of the session, and a connect
    /// attempt happens under the same lock, so concurrent callers never open
    /// two sockets.
    pub async fn acquire(&self) -> Result<Session<'_>, ConnectError> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Ok(Session { slot, fresh: false });
        }

        self.state.send_replace(ConnectionState::Connecting);
        info!(target = %self.connector.describe(), "Connecting to Modbus device");

        match self.connector.connect().await {
            Ok(session) => {
                *slot = Some(session);
                self.connects.fetch_add(1, Ordering::Relaxed);
                self.state.send_replace(ConnectionState::Connected);
                info!(target = %self.connector.describe(), "Connected to Modbus device");

                if self.events.send(DeviceEvent::Connected).is_err() {
                    warn!("Event channel closed; connected notification lost");
                }

                Ok(Session { slot, fresh: true })
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the session if one is open. Safe to call at any time.
    ///
    /// Waits for an in-flight transaction to finish or time out.
    pub async fn release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);

        let mut slot = self.slot.lock().await;
        if let Some(mut session) = slot.take() {
            session.disconnect().await;
            info!(target = %self.connector.describe(), "Modbus session closed");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connects: self.connects.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }
}

/// Exclusive access to the open session for one transaction.
pub struct Session<'a> {
    slot: MutexGuard<'a, Option<Box<dyn ModbusSession>>>,
    fresh: bool,
}

impl Session<'_> {
    /// Whether this acquisition opened the connection.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<InputFrame, ProtocolError> {
        let session = self.slot.as_mut().ok_or(ProtocolError::NotConnected)?;
        session.read_input_registers(address, quantity).await
    }

    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        words: &[u16],
    ) -> Result<(), ProtocolError> {
        let session = self.slot.as_mut().ok_or(ProtocolError::NotConnected)?;
        session.write_multiple_registers(address, words).await
    }
}
