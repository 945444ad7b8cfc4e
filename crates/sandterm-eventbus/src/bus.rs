use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::envelope::{SessionEvent, SessionEventEnvelope};

pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEventBusConfig {
    pub buffer_capacity: usize,
}

impl Default for SessionEventBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionEventBusPerfSnapshot {
    pub published_total: u64,
    pub delivered_total: u64,
    pub dropped_without_subscribers_total: u64,
    pub subscriber_count: usize,
}

#[derive(Debug)]
pub struct SessionEventBus {
    next_sequence: AtomicU64,
    boot_instant: Instant,
    sender: broadcast::Sender<SessionEventEnvelope>,
    published_total: AtomicU64,
    delivered_total: AtomicU64,
    dropped_without_subscribers_total: AtomicU64,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(SessionEventBusConfig::default())
    }
}

impl SessionEventBus {
    pub fn new(config: SessionEventBusConfig) -> Self {
        assert!(
            config.buffer_capacity > 0,
            "buffer_capacity must be greater than 0"
        );

        let (sender, _receiver) = broadcast::channel(config.buffer_capacity);
        Self {
            next_sequence: AtomicU64::new(0),
            boot_instant: Instant::now(),
            sender,
            published_total: AtomicU64::new(0),
            delivered_total: AtomicU64::new(0),
            dropped_without_subscribers_total: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> SessionEventSubscription {
        SessionEventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: SessionEvent) -> SessionEventEnvelope {
        let envelope = SessionEventEnvelope {
            sequence: self.next_sequence(),
            received_at_monotonic_nanos: self.monotonic_nanos_since_bus_bootstrap(),
            event,
        };

        self.published_total.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(envelope.clone()) {
            Ok(receivers) => {
                self.delivered_total
                    .fetch_add(receivers as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_without_subscribers_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        envelope
    }

    pub fn perf_snapshot(&self) -> SessionEventBusPerfSnapshot {
        SessionEventBusPerfSnapshot {
            published_total: self.published_total.load(Ordering::Relaxed),
            delivered_total: self.delivered_total.load(Ordering::Relaxed),
            dropped_without_subscribers_total: self
                .dropped_without_subscribers_total
                .load(Ordering::Relaxed),
            subscriber_count: self.sender.receiver_count(),
        }
    }

    fn next_sequence(&self) -> u64 {
        let mut current = self.next_sequence.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(1)
                .expect("session event sequence exhausted");
            match self.next_sequence.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    fn monotonic_nanos_since_bus_bootstrap(&self) -> u64 {
        let nanos = self.boot_instant.elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventRecvError {
    Lagged(u64),
}

pub struct SessionEventSubscription {
    receiver: broadcast::Receiver<SessionEventEnvelope>,
}

impl SessionEventSubscription {
    /// Next envelope, or `None` once the bus is dropped.
    pub async fn next_event(
        &mut self,
    ) -> Result<Option<SessionEventEnvelope>, SessionEventRecvError> {
        match self.receiver.recv().await {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvError::Closed) => Ok(None),
            Err(RecvError::Lagged(skipped)) => Err(SessionEventRecvError::Lagged(skipped)),
        }
    }

    /// Drains whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<SessionEventEnvelope> {
        let mut drained = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => drained.push(envelope),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        drained
    }
}
