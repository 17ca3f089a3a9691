//! Bridge status reporting.

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionManager, ConnectionState, ConnectionStats};
use crate::hub::BroadcastHub;
use crate::poller::{PollStatus, PollingEngine};

/// Point-in-time view of the bridge, served on `GET /status` and logged at
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Bridge name.
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Device target, e.g. `tcp://10.0.0.5:502 (unit 1)`.
    pub target: String,
    pub connection: ConnectionState,
    pub poll: PollStatus,
    /// Float values read per poll.
    pub read_count: u16,
    /// Current poll period in milliseconds.
    pub interval_ms: u64,
    pub subscribers: usize,
    pub stats: ConnectionStats,
}

impl StatusSnapshot {
    pub fn capture(
        connection: &ConnectionManager,
        engine: &PollingEngine,
        hub: &BroadcastHub,
    ) -> Self {
        let settings = engine.settings();
        Self {
            bridge: "pidscope".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            target: connection.describe(),
            connection: connection.state(),
            poll: engine.status_snapshot(),
            read_count: settings.read_count,
            interval_ms: settings.interval.as_millis() as u64,
            subscribers: hub.subscriber_count(),
            stats: connection.stats(),
        }
    }
}
