//! Fan-out of device events to live subscribers.
//!
//! The connection manager and the poller push [`DeviceEvent`]s into an
//! unbounded channel. [`BroadcastHub::run`] drains it and serializes each
//! event once, handing the same payload to every subscriber. A subscriber
//! whose send fails is dropped on the spot.
//!
//! When the last subscriber leaves, the hub writes a neutral setpoint so the
//! controller is not left running an operator's settings unattended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pidscope_common::{DeviceEvent, InboundMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::InboundError;
use crate::gateway::WriteGateway;

/// Producer side of the device event channel.
pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;

/// Consumer side of the device event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Setpoint written when the last subscriber leaves, in register order:
/// target frequency, proportional factor, integration time, differentiation time.
pub const NEUTRAL_SETPOINT: [f32; 4] = [0.0, 0.07, 0.5, 0.65];

pub type SubscriberId = u64;

/// Why a payload could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("subscriber buffer full")]
    Full,
    #[error("subscriber disconnected")]
    Closed,
}

/// Something that accepts serialized events.
///
/// `send` must not block; the hub calls it while fanning out to everyone.
pub trait Subscriber: Send + Sync {
    fn send(&self, payload: &Arc<str>) -> Result<(), SendError>;
}

/// Subscriber backed by a bounded channel.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSubscriber {
    /// Subscriber plus the receiver its transport task should drain.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn send(&self, payload: &Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(payload.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Registry of subscribers and entry point for their inbound messages.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
    gateway: Arc<WriteGateway>,
}

impl BroadcastHub {
    pub fn new(gateway: Arc<WriteGateway>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            gateway,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<dyn Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber under a fresh id.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribe_with_id(id, subscriber);
        id
    }

    /// Register a subscriber under a caller-chosen id.
    ///
    /// Returns `false`, leaving the set unchanged, if the id is taken.
    pub fn subscribe_with_id(&self, id: SubscriberId, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut subscribers = self.lock();
        if subscribers.contains_key(&id) {
            warn!(subscriber = id, "Subscriber id already registered");
            return false;
        }
        subscribers.insert(id, subscriber);
        debug!(subscriber = id, total = subscribers.len(), "Subscriber joined");
        true
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    ///
    /// If this empties the set, the neutral setpoint is written before
    /// returning.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let remaining = {
            let mut subscribers = self.lock();
            if subscribers.remove(&id).is_none() {
                return false;
            }
            subscribers.len()
        };

        debug!(subscriber = id, total = remaining, "Subscriber left");
        if remaining == 0 {
            reset_device(&self.gateway).await;
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver an event to every subscriber. Returns the number reached.
    ///
    /// Subscribers that fail to accept the event are removed. If that leaves
    /// no one, the neutral setpoint write is started in the background.
    pub fn publish(&self, event: &DeviceEvent) -> usize {
        let payload: Arc<str> = match event.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(kind = event.kind(), error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .lock()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        if snapshot.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, subscriber) in snapshot {
            match subscriber.send(&payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(subscriber = id, error = %e, "Dropping subscriber");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut emptied = false;
            {
                let mut subscribers = self.lock();
                for id in &failed {
                    if subscribers.remove(id).is_some() {
                        emptied = subscribers.is_empty();
                    }
                }
                info!(
                    dropped = failed.len(),
                    total = subscribers.len(),
                    "Removed unreachable subscribers"
                );
            }

            if emptied {
                let gateway = self.gateway.clone();
                tokio::spawn(async move { reset_device(&gateway).await });
            }
        }

        delivered
    }

    /// Handle a raw message from a subscriber.
    pub async fn handle_inbound(
        &self,
        from: Option<SubscriberId>,
        raw: &str,
    ) -> Result<(), InboundError> {
        let message = InboundMessage::parse(raw).inspect_err(|e| {
            warn!(subscriber = ?from, error = %e, "Rejected inbound message");
        })?;

        match message {
            InboundMessage::Write { data } => {
                debug!(subscriber = ?from, ?data, "Setpoint write requested");
                self.gateway.write_setpoint(&data).await?;
            }
        }
        Ok(())
    }

    /// Publish every event from `events` until all senders are gone.
    pub async fn run(&self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let reached = self.publish(&event);
            debug!(kind = event.kind(), subscribers = reached, "Event published");
        }
        debug!("Event channel closed; hub pump exiting");
    }
}

async fn reset_device(gateway: &WriteGateway) {
    info!("Last subscriber left; writing neutral setpoint");
    let values = NEUTRAL_SETPOINT.map(Some);
    if let Err(e) = gateway.write(&values).await {
        warn!(error = %e, "Failed to write neutral setpoint");
    }
}
