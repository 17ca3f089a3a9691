//! Device polling loop.
//!
//! One task drives a fixed-period timer. Each tick runs a cycle:
//! acquire the session, read the input block, decode it and emit a
//! `read` event. A failed cycle marks the link degraded, bumps the retry
//! counter, drops the connection once the counter passes the configured
//! threshold, then sleeps for the retry interval. Ticks that land while a
//! cycle (including its backoff) is running are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use pidscope_common::DeviceEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{ConfigError, DeviceConfig, PollOptions, PollSettings, ReadConfig};
use crate::connection::ConnectionManager;
use crate::error::{PollError, PollErrorKind};
use crate::hub::EventSender;

/// Phase of the polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    #[default]
    Idle,
    Polling,
    Backoff,
}

/// Observable polling status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatus {
    pub state: PollState,
    /// Failed cycles since the last success or forced reconnect.
    pub retry_count: u32,
    /// Set by the first failure after a success, cleared by the next success.
    pub degraded: bool,
    /// Receipt time of the last published reading.
    pub last_reading_at: Option<i64>,
    pub last_error: Option<PollErrorKind>,
}

/// A decoded block of input registers.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: i64,
    pub values: Vec<f32>,
}

impl From<Reading> for DeviceEvent {
    fn from(reading: Reading) -> Self {
        DeviceEvent::Read {
            timestamp: reading.timestamp,
            data: reading.values,
        }
    }
}

/// Result of one [`PollingEngine::poll_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A reading was emitted.
    Published,
    /// The poll failed; the backoff delay has already elapsed.
    Failed(PollErrorKind),
    /// Another cycle was still running.
    Skipped,
}

/// Clears the in-flight flag even when the cycle is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls one device and emits readings and lifecycle events.
pub struct PollingEngine {
    connection: Arc<ConnectionManager>,
    events: EventSender,
    read: ReadConfig,
    retry_interval: Duration,
    retries: u32,
    settings: watch::Sender<PollSettings>,
    status: watch::Sender<PollStatus>,
    in_flight: AtomicBool,
    /// Connection count last seen by a poll.
    seen_connects: AtomicU64,
}

impl PollingEngine {
    pub fn new(
        device: &DeviceConfig,
        connection: Arc<ConnectionManager>,
        events: EventSender,
    ) -> Self {
        let (settings, _) = watch::channel(device.poll_settings());
        let (status, _) = watch::channel(PollStatus::default());

        Self {
            connection,
            events,
            read: device.read,
            retry_interval: device.retry_interval(),
            retries: device.retries,
            settings,
            status,
            in_flight: AtomicBool::new(false),
            seen_connects: AtomicU64::new(0),
        }
    }

    /// Start the polling loop on its own task.
    pub fn spawn(self: Arc<Self>) -> PollerHandle {
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run().await });
        PollerHandle { engine: self, task }
    }

    async fn run(&self) {
        let mut settings_rx = self.settings.subscribe();
        let mut period = settings_rx.borrow_and_update().interval;
        let mut ticker = ticker(period);

        info!(
            target = %self.connection.describe(),
            interval_ms = period.as_millis() as u64,
            "Starting Modbus poller"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let CycleOutcome::Failed(_) = self.poll_cycle().await {
                        // Resume one full period after the backoff ends.
                        ticker.reset();
                    }
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = settings_rx.borrow_and_update().interval;
                    if next != period {
                        info!(interval_ms = next.as_millis() as u64, "Poll interval changed");
                        period = next;
                        ticker = self::ticker(period);
                    }
                }
            }
        }
    }

    /// Run one polling cycle, including the backoff delay after a failure.
    pub async fn poll_cycle(&self) -> CycleOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Previous poll still running; tick dropped");
            return CycleOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        self.status.send_modify(|s| s.state = PollState::Polling);

        let outcome = match self.poll_once().await {
            Ok(reading) => {
                self.on_success(reading);
                CycleOutcome::Published
            }
            Err(err) => {
                let kind = err.kind;
                self.on_failure(err).await;
                CycleOutcome::Failed(kind)
            }
        };

        self.status.send_modify(|s| s.state = PollState::Idle);
        outcome
    }

    async fn poll_once(&self) -> Result<Reading, PollError> {
        let settings = *self.settings.borrow();
        let quantity = self.read.quantity.request_quantity(settings.read_count);

        let mut session = self.connection.acquire().await?;
        // Any reconnect since the last poll starts a new run, including one
        // made by a setpoint write.
        let connects = self.connection.stats().connects;
        if self.seen_connects.swap(connects, Ordering::AcqRel) != connects {
            self.status.send_modify(|s| s.retry_count = 0);
        }
        let frame = session
            .read_input_registers(self.read.address, quantity)
            .await?;
        drop(session);

        let values = codec::decode_registers(&frame.words, settings.read_count as usize)?;
        Ok(Reading {
            timestamp: frame.received_at,
            values,
        })
    }

    fn on_success(&self, reading: Reading) {
        let mut recovered = false;
        self.status.send_modify(|s| {
            recovered = s.degraded;
            s.degraded = false;
            s.retry_count = 0;
            s.last_error = None;
            s.last_reading_at = Some(reading.timestamp);
        });

        if recovered {
            info!(target = %self.connection.describe(), "Modbus polling recovered");
            self.emit(DeviceEvent::Recovered);
        }
        self.emit(reading.into());
    }

    async fn on_failure(&self, err: PollError) {
        let mut first = false;
        let mut failures = 0;
        let mut release = false;
        let retries = self.retries;

        self.status.send_modify(|s| {
            first = !s.degraded;
            failures = s.retry_count + 1;
            release = failures > retries;
            s.degraded = true;
            s.retry_count = if release { 0 } else { failures };
            s.last_error = Some(err.kind);
            s.state = PollState::Backoff;
        });

        if first {
            warn!(kind = %err.kind, error = %err.message, "Modbus poll failed");
        } else {
            debug!(kind = %err.kind, error = %err.message, failures, "Modbus poll failed again");
        }

        if release {
            info!(
                failures,
                "Retry threshold exceeded; reconnecting to Modbus device"
            );
            self.connection.release().await;
        }

        info!(
            delay_ms = self.retry_interval.as_millis() as u64,
            "Backing off before next poll"
        );
        tokio::time::sleep(self.retry_interval).await;
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!("Event channel closed; dropping event");
        }
    }

    /// Change the read count and/or sampling rate; applies from the next cycle.
    pub fn set_options(&self, options: &PollOptions) -> Result<PollSettings, ConfigError> {
        let next = self.settings().apply(options)?;
        self.settings.send_replace(next);
        info!(
            read_count = next.read_count,
            interval_ms = next.interval.as_millis() as u64,
            "Polling options updated"
        );
        Ok(next)
    }

    pub fn settings(&self) -> PollSettings {
        *self.settings.borrow()
    }

    /// Subscribe to polling status changes.
    pub fn status(&self) -> watch::Receiver<PollStatus> {
        self.status.subscribe()
    }

    pub fn status_snapshot(&self) -> PollStatus {
        self.status.borrow().clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Handle to a running poller.
pub struct PollerHandle {
    engine: Arc<PollingEngine>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn engine(&self) -> &Arc<PollingEngine> {
        &self.engine
    }

    /// Stop polling and release the connection.
    ///
    /// Cancels the timer and any in-flight transaction or backoff.
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;

        self.engine
            .status
            .send_modify(|s| s.state = PollState::Idle);
        self.engine.connection.release().await;
        info!("Modbus poller stopped");
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::fake::{ConnectStep, FailKind, FakeDevice, ReadStep, device_config};
    use crate::hub::{EventReceiver, event_channel};

    fn engine_with(device: &FakeDevice) -> (Arc<PollingEngine>, EventReceiver) {
        let (tx, rx) = event_channel();
        let connection = Arc::new(ConnectionManager::new(Box::new(device.clone()), tx.clone()));
        let engine = Arc::new(PollingEngine::new(&device_config(), connection, tx));
        (engine, rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_cycle_emits_reading() {
        let device = FakeDevice::new(vec![]);
        device.push_read(ReadStep::Frame {
            received_at: 1000,
            values: vec![50.0, 0.5],
        });
        let (engine, mut rx) = engine_with(&device);

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);

        assert_eq!(
            drain(&mut rx),
            vec![
                DeviceEvent::Connected,
                DeviceEvent::Read {
                    timestamp: 1000,
                    data: vec![50.0, 0.5]
                }
            ]
        );
        let status = engine.status_snapshot();
        assert_eq!(status.state, PollState::Idle);
        assert_eq!(status.last_reading_at, Some(1000));
        assert!(!status.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_run_forces_single_release_then_recovers() {
        // Threshold 5: ticks 2-7 fail, tick 8 succeeds.
        let device = FakeDevice::new(vec![50.0, 0.5]);
        device.push_read(ReadStep::Frame {
            received_at: 1000,
            values: vec![50.0, 0.5],
        });
        device.push_read_failures(FailKind::Broken, 6);
        let (engine, mut rx) = engine_with(&device);
        let connection = engine.connection().clone();

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);
        drain(&mut rx);

        for tick in 2..=7 {
            assert_eq!(
                engine.poll_cycle().await,
                CycleOutcome::Failed(PollErrorKind::Unreachable),
                "tick {}",
                tick
            );
            let expected_releases = if tick < 7 { 0 } else { 1 };
            assert_eq!(connection.stats().releases, expected_releases, "tick {}", tick);
            assert!(engine.status_snapshot().degraded);
        }
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(device.disconnects(), 1);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);

        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == DeviceEvent::Recovered)
                .count(),
            1
        );
        assert_eq!(events.first(), Some(&DeviceEvent::Connected));
        assert!(matches!(events.last(), Some(DeviceEvent::Read { .. })));

        let status = engine.status_snapshot();
        assert_eq!(status.retry_count, 0);
        assert!(!status.degraded);
        assert_eq!(connection.stats().releases, 1);
        assert_eq!(device.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_run_forces_single_release_then_recovers() {
        // Ticks 2-7 cannot resolve the host; tick 8 reconnects.
        let device = FakeDevice::new(vec![50.0, 0.5]);
        let (engine, mut rx) = engine_with(&device);
        let connection = engine.connection().clone();

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);
        connection.release().await;
        let released = connection.stats().releases;
        drain(&mut rx);

        for _ in 0..6 {
            device.push_connect(ConnectStep::Dns);
        }
        for tick in 2..=7 {
            assert_eq!(
                engine.poll_cycle().await,
                CycleOutcome::Failed(PollErrorKind::DnsUnresolved),
                "tick {}",
                tick
            );
            let expected = if tick < 7 { released } else { released + 1 };
            assert_eq!(connection.stats().releases, expected, "tick {}", tick);
        }
        assert_eq!(engine.status_snapshot().retry_count, 0);
        assert!(engine.status_snapshot().degraded);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], DeviceEvent::Connected);
        assert_eq!(events[1], DeviceEvent::Recovered);
        assert!(matches!(events[2], DeviceEvent::Read { .. }));
        assert_eq!(connection.stats().releases, released + 1);
        assert_eq!(device.connect_attempts(), 8);
        assert_eq!(device.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_by_write_resets_retry_count() {
        let device = FakeDevice::new(vec![1.0, 2.0]);
        device.push_connect(ConnectStep::Refused);
        let (engine, _rx) = engine_with(&device);
        let gateway = crate::gateway::WriteGateway::new(
            engine.connection().clone(),
            engine.status(),
            0,
        );

        assert_eq!(
            engine.poll_cycle().await,
            CycleOutcome::Failed(PollErrorKind::Unreachable)
        );
        assert_eq!(engine.status_snapshot().retry_count, 1);

        // The write opens the session the next poll reuses.
        gateway.write(&[Some(1.0)]).await.unwrap();
        device.push_read(ReadStep::Fail(FailKind::Broken));

        assert_eq!(
            engine.poll_cycle().await,
            CycleOutcome::Failed(PollErrorKind::Unreachable)
        );
        assert_eq!(engine.status_snapshot().retry_count, 1);
        assert_eq!(device.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_failure_run_keeps_session() {
        let device = FakeDevice::new(vec![1.0, 2.0]);
        let (engine, mut rx) = engine_with(&device);

        engine.poll_cycle().await;
        device.push_read_failures(FailKind::Timeout, 3);
        for _ in 0..3 {
            assert_eq!(
                engine.poll_cycle().await,
                CycleOutcome::Failed(PollErrorKind::Timeout)
            );
        }
        assert_eq!(engine.status_snapshot().retry_count, 3);

        engine.poll_cycle().await;

        assert_eq!(device.connect_attempts(), 1);
        assert_eq!(engine.connection().stats().releases, 0);
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, DeviceEvent::Connected))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, DeviceEvent::Recovered))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_are_classified_and_retried() {
        let device = FakeDevice::new(vec![1.0, 2.0]);
        device.push_connect(ConnectStep::Dns);
        device.push_connect(ConnectStep::Refused);
        let (engine, _rx) = engine_with(&device);

        assert_eq!(
            engine.poll_cycle().await,
            CycleOutcome::Failed(PollErrorKind::DnsUnresolved)
        );
        assert_eq!(
            engine.poll_cycle().await,
            CycleOutcome::Failed(PollErrorKind::Unreachable)
        );
        assert_eq!(
            engine.status_snapshot().last_error,
            Some(PollErrorKind::Unreachable)
        );
        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);
        assert_eq!(device.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_mismatch_is_a_poll_failure() {
        // Device answers with one value where two are expected.
        let device = FakeDevice::new(vec![1.0]);
        let (engine, mut rx) = engine_with(&device);

        assert_eq!(
            engine.poll_cycle().await,
            CycleOutcome::Failed(PollErrorKind::ProtocolOutOfSync)
        );
        assert_eq!(drain(&mut rx), vec![DeviceEvent::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_wall_clock_delay() {
        let device = FakeDevice::new(vec![1.0, 2.0]);
        device.push_read(ReadStep::Fail(FailKind::Exception));
        let (engine, _rx) = engine_with(&device);

        let mut status = engine.status();
        let started = tokio::time::Instant::now();
        let cycle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.poll_cycle().await })
        };

        status
            .wait_for(|s| s.state == PollState::Backoff)
            .await
            .unwrap();
        assert_eq!(engine.poll_cycle().await, CycleOutcome::Skipped);

        assert_eq!(
            cycle.await.unwrap(),
            CycleOutcome::Failed(PollErrorKind::Other)
        );
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(engine.status_snapshot().state, PollState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_never_overlaps_transactions() {
        let device = FakeDevice::new(vec![1.0, 2.0]).with_latency(Duration::from_millis(150));
        let (engine, _rx) = engine_with(&device);

        // Reads take longer than the 100 ms period.
        let handle = engine.clone().spawn();
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.close().await;

        assert!(device.reads() >= 5);
        assert_eq!(device.peak_in_flight(), 1);
        assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff() {
        let device = FakeDevice::new(vec![1.0, 2.0]);
        device.push_read_failures(FailKind::Broken, 1);
        let (engine, _rx) = engine_with(&device);

        let handle = engine.clone().spawn();
        let mut status = engine.status();
        status
            .wait_for(|s| s.state == PollState::Backoff)
            .await
            .unwrap();

        handle.close().await;

        assert_eq!(engine.status_snapshot().state, PollState::Idle);
        assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
        assert_eq!(device.disconnects(), 1);
        // The in-flight flag was cleared by cancellation.
        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_options_changes_read_count_and_rate() {
        let device = FakeDevice::new(vec![1.0, 2.0, 3.0, 4.0]);
        let (engine, mut rx) = engine_with(&device);

        let settings = engine
            .set_options(&PollOptions {
                read_count: Some(4),
                sample_rate: Some(20.0),
            })
            .unwrap();
        assert_eq!(settings.interval, Duration::from_millis(50));

        assert_eq!(engine.poll_cycle().await, CycleOutcome::Published);
        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(DeviceEvent::Read { data, .. }) if data == &vec![1.0, 2.0, 3.0, 4.0]
        ));

        assert!(
            engine
                .set_options(&PollOptions {
                    read_count: Some(0),
                    sample_rate: None,
                })
                .is_err()
        );
        assert_eq!(engine.settings().read_count, 4);
    }
}
