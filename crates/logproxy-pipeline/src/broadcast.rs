//! Fan-out of bus events to every registered consumer.
//!
//! The registry is the only state shared between the drain loop and the
//! connection tasks. A broadcast pass holds the read lock for the whole
//! event, so registration and deregistration (write lock) land either
//! before or after it. Nothing under the lock touches the network: a push
//! is a `try_send` into the consumer's bounded queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use logproxy_core::config::{BroadcastConfig, StartMode};
use logproxy_core::{ConsumerId, LogEvent, LogproxyError, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::BusReceiver;
use crate::consumer::{Consumer, Push, Subscription};

/// One serialized event, as queued for a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Broadcast sequence number, starting at 1.
    pub seq: u64,
    pub json: String,
}

/// Lifecycle of the single drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Idle,
    Running,
    /// Bus closed (end of input) or shutdown; no further events.
    Finished,
}

/// What a single broadcast pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub disconnected: usize,
}

/// Point-in-time counters for `/health` and tests.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub consumers: usize,
    pub drain: DrainState,
    pub events: u64,
    pub deliveries: u64,
    pub drops: u64,
    pub evictions: u64,
    pub serialize_failures: u64,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub connected_at: DateTime<Utc>,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy)]
enum Departure {
    Evicted,
    Disconnected,
}

#[derive(Debug)]
pub struct Broadcaster {
    registry: RwLock<HashMap<ConsumerId, Consumer>>,
    queue_depth: usize,
    max_consumers: usize,
    evict_after_drops: Option<u32>,
    start_mode: StartMode,
    /// Parked bus receiver; taken exactly once by `start`.
    bus: Mutex<Option<BusReceiver>>,
    drain: watch::Sender<DrainState>,
    shutdown: CancellationToken,
    seq: AtomicU64,
    deliveries: AtomicU64,
    drops: AtomicU64,
    evictions: AtomicU64,
    serialize_failures: AtomicU64,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig, bus: BusReceiver) -> Arc<Self> {
        let (drain, _) = watch::channel(DrainState::Idle);
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            queue_depth: config.queue_depth.max(1),
            max_consumers: config.max_consumers,
            evict_after_drops: config.evict_after_drops,
            start_mode: config.start,
            bus: Mutex::new(Some(bus)),
            drain,
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            serialize_failures: AtomicU64::new(0),
        })
    }

    /// Spawn the drain loop. Only the first call (from any task) spawns it;
    /// every other call returns `false`. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let bus = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(bus) = bus else {
            return false;
        };
        self.drain.send_replace(DrainState::Running);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain_loop(bus).await });
        true
    }

    async fn drain_loop(self: Arc<Self>, mut bus: BusReceiver) {
        info!("broadcast drain loop started");
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(backlog = bus.backlog(), "drain loop cancelled");
                    break;
                }
                event = bus.recv() => event,
            };
            match event {
                Some(event) => {
                    self.broadcast(&event);
                }
                None => {
                    info!(
                        events = self.seq.load(Ordering::Relaxed),
                        "event bus closed, no further events will be broadcast"
                    );
                    break;
                }
            }
        }
        self.drain.send_replace(DrainState::Finished);
    }

    /// Push one event to every registered consumer.
    pub fn broadcast(&self, event: &LogEvent) -> BroadcastOutcome {
        self.fan_out(event.to_json())
    }

    /// Fan out an already-encoded record. An encoding failure drops the
    /// event for everyone and is counted.
    fn fan_out(&self, encoded: Result<String>) -> BroadcastOutcome {
        let json = match encoded {
            Ok(json) => json,
            Err(e) => {
                self.serialize_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "dropping event that failed to serialize");
                return BroadcastOutcome::default();
            }
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        let mut outcome = BroadcastOutcome::default();
        let mut departures: Vec<(ConsumerId, Departure)> = Vec::new();
        {
            let registry = self.read();
            for consumer in registry.values() {
                let payload = Payload {
                    seq,
                    json: json.clone(),
                };
                match consumer.push(payload) {
                    Push::Queued => outcome.delivered += 1,
                    Push::Dropped(streak) => {
                        outcome.dropped += 1;
                        debug!(consumer_id = %consumer.id(), seq, streak, "consumer queue full, event dropped");
                        if self.evict_after_drops.is_some_and(|limit| streak >= limit) {
                            departures.push((consumer.id(), Departure::Evicted));
                        }
                    }
                    Push::Closed => departures.push((consumer.id(), Departure::Disconnected)),
                }
            }
        }

        for (id, departure) in departures {
            if !self.remove(id) {
                continue;
            }
            match departure {
                Departure::Evicted => {
                    outcome.evicted += 1;
                    warn!(consumer_id = %id, "consumer evicted for falling behind");
                }
                Departure::Disconnected => {
                    outcome.disconnected += 1;
                    debug!(consumer_id = %id, "consumer queue closed, deregistered");
                }
            }
        }

        self.deliveries
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.drops.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        self.evictions
            .fetch_add(outcome.evicted as u64, Ordering::Relaxed);
        outcome
    }

    /// Add a consumer. It receives only events broadcast from now on.
    pub fn register(self: &Arc<Self>) -> Result<Subscription> {
        let id = ConsumerId::new();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let consumers = {
            let mut registry = self.write();
            if self.shutdown.is_cancelled() {
                return Err(LogproxyError::ShuttingDown);
            }
            if registry.len() >= self.max_consumers {
                return Err(LogproxyError::TooManyConsumers {
                    max: self.max_consumers,
                });
            }
            registry.insert(id, Consumer::new(id, tx));
            registry.len()
        };
        info!(consumer_id = %id, consumers, "consumer registered");

        if self.start_mode == StartMode::Lazy && self.start() {
            debug!(consumer_id = %id, "drain loop started by first registration");
        }

        Ok(Subscription::new(
            id,
            rx,
            self.shutdown.child_token(),
            Arc::clone(self),
        ))
    }

    /// Remove a consumer and release its queue. Returns `false` if it was
    /// already gone (evicted, or removed by shutdown).
    pub fn deregister(&self, id: ConsumerId) -> bool {
        let removed = self.remove(id);
        if removed {
            info!(consumer_id = %id, consumers = self.consumer_count(), "consumer deregistered");
        }
        removed
    }

    fn remove(&self, id: ConsumerId) -> bool {
        self.write().remove(&id).is_some()
    }

    /// Stop the drain loop, end every open stream, and refuse new consumers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        // Never started: no drain loop will ever report Finished.
        let parked = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if parked.is_some() {
            self.drain.send_replace(DrainState::Finished);
        }
        let released = std::mem::take(&mut *self.write());
        info!(released = released.len(), "broadcaster shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on [`Broadcaster::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.read().len()
    }

    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.read()
            .values()
            .map(|c| ConsumerInfo {
                id: c.id(),
                connected_at: c.connected_at(),
                dropped: c.dropped_total(),
            })
            .collect()
    }

    pub fn drain_state(&self) -> DrainState {
        *self.drain.borrow()
    }

    /// Resolves once the drain loop has finished (bus closed or shutdown).
    pub async fn drained(&self) {
        let mut rx = self.drain.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped.
        let _ = rx.wait_for(|state| *state == DrainState::Finished).await;
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            consumers: self.consumer_count(),
            drain: self.drain_state(),
            events: self.seq.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            serialize_failures: self.serialize_failures.load(Ordering::Relaxed),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConsumerId, Consumer>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConsumerId, Consumer>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}
