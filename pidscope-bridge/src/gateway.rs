//! Setpoint writes to the device's holding registers.

use std::sync::Arc;

use pidscope_common::Setpoint;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::WriteError;
use crate::poller::{PollState, PollStatus};

/// Forwards subscriber writes to the device over the shared session.
///
/// Writes are fire-and-forget: a failure is reported to the caller and
/// logged, never retried. While the poller is backing off, writes are
/// dropped instead of queued.
pub struct WriteGateway {
    connection: Arc<ConnectionManager>,
    status: watch::Receiver<PollStatus>,
    address: u16,
}

impl WriteGateway {
    pub fn new(
        connection: Arc<ConnectionManager>,
        status: watch::Receiver<PollStatus>,
        address: u16,
    ) -> Self {
        Self {
            connection,
            status,
            address,
        }
    }

    /// Write `values` as consecutive floats starting at the setpoint address.
    ///
    /// `None` entries are sent as `+inf` so the device keeps its current value.
    pub async fn write(&self, values: &[Option<f32>]) -> Result<(), WriteError> {
        if values.is_empty() {
            return Err(WriteError::Empty);
        }
        if self.status.borrow().state == PollState::Backoff {
            warn!("Device link backing off; write dropped");
            return Err(WriteError::Suspended);
        }

        let words = codec::encode_registers(values);
        let result = self.send(&words).await;

        match &result {
            Ok(()) => debug!(address = self.address, registers = words.len(), "Setpoint written"),
            Err(e) => warn!(address = self.address, error = %e, "Setpoint write failed"),
        }
        result
    }

    async fn send(&self, words: &[u16]) -> Result<(), WriteError> {
        let mut session = self.connection.acquire().await?;
        session.write_multiple_registers(self.address, words).await?;
        Ok(())
    }

    /// Write a full setpoint block.
    pub async fn write_setpoint(&self, setpoint: &Setpoint) -> Result<(), WriteError> {
        self.write(&setpoint.to_registers()).await
    }
}
