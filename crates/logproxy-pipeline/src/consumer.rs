//! Per-viewer state owned by the broadcaster registry, and the handle the
//! transport holds for the lifetime of one connection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use logproxy_core::ConsumerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Payload};

/// Result of one non-blocking push into a consumer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    Queued,
    /// Queue full; the event was dropped for this consumer. Carries the
    /// number of consecutive drops including this one.
    Dropped(u32),
    /// Receiver gone: the transport has disconnected.
    Closed,
}

/// Registry entry for one connected viewer.
#[derive(Debug)]
pub(crate) struct Consumer {
    id: ConsumerId,
    sender: mpsc::Sender<Payload>,
    connected_at: DateTime<Utc>,
    consecutive_drops: AtomicU32,
    dropped_total: AtomicU64,
}

impl Consumer {
    pub(crate) fn new(id: ConsumerId, sender: mpsc::Sender<Payload>) -> Self {
        Self {
            id,
            sender,
            connected_at: Utc::now(),
            consecutive_drops: AtomicU32::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    pub(crate) fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Never waits: a full queue is a drop, not backpressure.
    pub(crate) fn push(&self, payload: Payload) -> Push {
        match self.sender.try_send(payload) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                Push::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                Push::Dropped(self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Push::Closed,
        }
    }
}

/// The transport's handle on a registered consumer.
///
/// Dropping it deregisters the consumer, so a connection task that ends
/// for any reason (client gone, write error, shutdown) releases its queue.
#[derive(Debug)]
pub struct Subscription {
    id: ConsumerId,
    receiver: mpsc::Receiver<Payload>,
    cancel: CancellationToken,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub(crate) fn new(
        id: ConsumerId,
        receiver: mpsc::Receiver<Payload>,
        cancel: CancellationToken,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            id,
            receiver,
            cancel,
            broadcaster,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next queued payload. `None` once the consumer was evicted or the
    /// broadcaster shut down; cancellation wins over queued payloads.
    pub async fn recv(&mut self) -> Option<Payload> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            payload = self.receiver.recv() => payload,
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.receiver.try_recv().ok()
    }

    /// Payloads queued and not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.deregister(self.id);
    }
}
