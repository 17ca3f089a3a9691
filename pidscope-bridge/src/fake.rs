//! Scriptable in-memory device for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pidscope_common::current_timestamp_millis;

use crate::codec;
use crate::config::{DeviceConfig, ReadConfig};
use crate::connection::{Connector, InputFrame, ModbusSession};
use crate::error::{ConnectError, ProtocolError};

/// Outcome of the next connect attempt.
#[derive(Debug, Clone)]
pub enum ConnectStep {
    Dns,
    Refused,
}

/// Outcome of the next read.
#[derive(Debug, Clone)]
pub enum ReadStep {
    Frame { received_at: i64, values: Vec<f32> },
    Fail(FailKind),
}

/// Transaction failure to inject.
#[derive(Debug, Clone, Copy)]
pub enum FailKind {
    Exception,
    OutOfSync,
    Timeout,
    Broken,
}

impl FailKind {
    fn into_error(self) -> ProtocolError {
        match self {
            FailKind::Exception => ProtocolError::Exception("IllegalDataAddress".to_string()),
            FailKind::OutOfSync => ProtocolError::OutOfSync("transaction id mismatch".to_string()),
            FailKind::Timeout => ProtocolError::Timeout(Duration::from_millis(100)),
            FailKind::Broken => {
                ProtocolError::Transport(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    values: Mutex<Vec<f32>>,
    connect_script: Mutex<VecDeque<ConnectStep>>,
    read_script: Mutex<VecDeque<ReadStep>>,
    write_script: Mutex<VecDeque<FailKind>>,
    writes: Mutex<Vec<(u16, Vec<u16>)>>,
    connect_attempts: AtomicUsize,
    disconnects: AtomicUsize,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Fake device; clones share state so tests can inspect it after handing
/// one clone to a `ConnectionManager`.
#[derive(Clone)]
pub struct FakeDevice {
    shared: Arc<Shared>,
    latency: Duration,
}

impl FakeDevice {
    /// Device whose unscripted reads return `values`.
    pub fn new(values: Vec<f32>) -> Self {
        let shared = Shared::default();
        *shared.values.lock().unwrap() = values;
        Self {
            shared: Arc::new(shared),
            latency: Duration::ZERO,
        }
    }

    /// Delay every connect and transaction by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_connect(&self, step: ConnectStep) {
        self.shared.connect_script.lock().unwrap().push_back(step);
    }

    pub fn push_read(&self, step: ReadStep) {
        self.shared.read_script.lock().unwrap().push_back(step);
    }

    pub fn push_read_failures(&self, kind: FailKind, n: usize) {
        for _ in 0..n {
            self.push_read(ReadStep::Fail(kind));
        }
    }

    pub fn push_write_failure(&self, kind: FailKind) {
        self.shared.write_script.lock().unwrap().push_back(kind);
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.shared.writes.lock().unwrap().clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Highest number of transactions ever observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeDevice {
    async fn connect(&self) -> Result<Box<dyn ModbusSession>, ConnectError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = self.shared.connect_script.lock().unwrap().pop_front();
        match step {
            None => Ok(Box::new(FakeSession {
                shared: self.shared.clone(),
                latency: self.latency,
            })),
            Some(ConnectStep::Dns) => Err(ConnectError::Dns {
                host: "fake.invalid:502".to_string(),
                reason: "name not known".to_string(),
            }),
            Some(ConnectStep::Refused) => Err(ConnectError::Unreachable(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))),
        }
    }

    fn describe(&self) -> String {
        "fake device".to_string()
    }
}

struct FakeSession {
    shared: Arc<Shared>,
    latency: Duration,
}

impl FakeSession {
    async fn transaction(&self) {
        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModbusSession for FakeSession {
    async fn read_input_registers(
        &mut self,
        _address: u16,
        _quantity: u16,
    ) -> Result<InputFrame, ProtocolError> {
        self.transaction().await;
        self.shared.reads.fetch_add(1, Ordering::SeqCst);

        let step = self.shared.read_script.lock().unwrap().pop_front();
        let (received_at, values) = match step {
            Some(ReadStep::Frame {
                received_at,
                values,
            }) => (received_at, values),
            Some(ReadStep::Fail(kind)) => return Err(kind.into_error()),
            None => (
                current_timestamp_millis(),
                self.shared.values.lock().unwrap().clone(),
            ),
        };

        let values: Vec<Option<f32>> = values.into_iter().map(Some).collect();
        Ok(InputFrame {
            received_at,
            words: codec::encode_registers(&values),
        })
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        words: &[u16],
    ) -> Result<(), ProtocolError> {
        self.transaction().await;

        if let Some(kind) = self.shared.write_script.lock().unwrap().pop_front() {
            return Err(kind.into_error());
        }
        self.shared
            .writes
            .lock()
            .unwrap()
            .push((address, words.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Device settings suited to the fake: 10 samples/s, two values, five retries.
pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        host: "fake.invalid".to_string(),
        port: 502,
        unit_id: 1,
        sample_rate: 10.0,
        retry_interval_ms: 1000,
        retries: 5,
        timeout_ms: 1000,
        read: ReadConfig::default(),
        write_address: 0,
    }
}
