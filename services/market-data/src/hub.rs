//! Subscriber Hub
//!
//! Tracks which live connections want which token, fans computed views out
//! to them and reaps the ones that died.
//!
//! A connection's lifecycle is `subscribe` → pushes → `mark_dead` → reaped.
//! Only the [`Reaper`] removes a connection from the registry and closes it,
//! so a connection is closed exactly once no matter how many times it was
//! reported dead.
//!
//! The hub knows nothing about sockets: a connection is any [`StatsSink`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::bucket::Stats;

use crate::engine::StatsPublisher;

/// Identifier of a registered connection.
pub type ConnectionId = u64;

/// Default capacity of the dead-connection queue.
pub const DEFAULT_DEAD_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Connection closed")]
    Closed,

    #[error("Connection outbound buffer full")]
    Full,

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Outbound half of a live connection.
pub trait StatsSink: Send + Sync {
    /// Queue `stats` for delivery without blocking.
    fn push(&self, stats: &Stats) -> Result<(), SinkError>;

    /// Tear the connection down. Called once, by the reaper.
    fn close(&self);
}

struct Subscriber {
    token: String,
    sink: Arc<dyn StatsSink>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Subscriber>,
    by_token: HashMap<String, BTreeSet<ConnectionId>>,
}

impl Registry {
    fn remove(&mut self, id: ConnectionId) -> Option<Subscriber> {
        let subscriber = self.connections.remove(&id)?;
        if let Some(ids) = self.by_token.get_mut(&subscriber.token) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_token.remove(&subscriber.token);
            }
        }
        Some(subscriber)
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Hub ─────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to the subscriber registry.
#[derive(Clone)]
pub struct SubscriberHub {
    registry: SharedRegistry,
    next_id: Arc<AtomicU64>,
    dead_tx: mpsc::Sender<ConnectionId>,
}

impl SubscriberHub {
    /// Build a hub and the reaper that drains its dead-connection queue.
    ///
    /// The reaper stops once every hub handle has been dropped.
    pub fn new(dead_queue_capacity: usize) -> (SubscriberHub, Reaper) {
        let registry: SharedRegistry = Arc::default();
        let (dead_tx, dead_rx) = mpsc::channel(dead_queue_capacity.max(1));
        let hub = SubscriberHub {
            registry: Arc::clone(&registry),
            next_id: Arc::new(AtomicU64::new(1)),
            dead_tx,
        };
        (hub, Reaper { registry, dead_rx })
    }

    /// Register `sink` for `token`, then push it the view built by
    /// `snapshot`.
    ///
    /// The connection is registered before `snapshot` runs, so any event
    /// applied after the view was computed is also broadcast to it. The
    /// registry lock is released before `snapshot` runs; it may take other
    /// locks. If the push fails the connection is removed and closed.
    pub fn subscribe<F>(
        &self,
        token: &str,
        sink: Arc<dyn StatsSink>,
        snapshot: F,
    ) -> Result<ConnectionId, SinkError>
    where
        F: FnOnce() -> Stats,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = lock(&self.registry);
            registry.connections.insert(
                id,
                Subscriber {
                    token: token.to_string(),
                    sink: Arc::clone(&sink),
                },
            );
            registry.by_token.entry(token.to_string()).or_default().insert(id);
        }

        let view = snapshot();
        if let Err(e) = sink.push(&view) {
            // A concurrent reap may already have closed it.
            if lock(&self.registry).remove(id).is_some() {
                sink.close();
            }
            return Err(e);
        }

        debug!(connection = id, token, "Subscribed");
        Ok(id)
    }

    /// Push `stats` to every connection subscribed to `stats.token`.
    ///
    /// Best effort: a failed push marks the connection dead and moves on.
    /// Returns how many connections accepted the message.
    pub fn broadcast(&self, stats: &Stats) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn StatsSink>)> = {
            let registry = lock(&self.registry);
            let Some(ids) = registry.by_token.get(&stats.token) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| {
                    registry
                        .connections
                        .get(id)
                        .map(|s| (*id, Arc::clone(&s.sink)))
                })
                .collect()
        };

        let mut delivered = 0;
        for (id, sink) in targets {
            match sink.push(stats) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(connection = id, token = %stats.token, error = %e, "Push failed");
                    self.mark_dead(id);
                }
            }
        }
        delivered
    }

    /// Queue `id` for removal. Never blocks; drops the request when the
    /// queue is full.
    pub fn mark_dead(&self, id: ConnectionId) {
        match self.dead_tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = id, "Dead-connection queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = id, "Reaper stopped, ignoring dead connection");
            }
        }
    }

    /// Connections currently subscribed to `token`.
    pub fn subscriber_count(&self, token: &str) -> usize {
        lock(&self.registry).by_token.get(token).map_or(0, BTreeSet::len)
    }

    /// All registered connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.registry).connections.len()
    }
}

impl StatsPublisher for SubscriberHub {
    fn publish(&self, stats: &Stats) {
        self.broadcast(stats);
    }
}

// ── Reaper ──────────────────────────────────────────────────────────

/// Single owner of connection teardown.
pub struct Reaper {
    registry: SharedRegistry,
    dead_rx: mpsc::Receiver<ConnectionId>,
}

impl Reaper {
    /// Drain the dead-connection queue until every hub handle is gone.
    pub async fn run(mut self) {
        info!("Reaper started");
        while self.reap_next().await.is_some() {}
        info!("Reaper stopped");
    }

    /// Handle one queued connection.
    ///
    /// Returns `None` once the queue is closed, otherwise the id together
    /// with whether it was still registered (and has now been closed).
    pub async fn reap_next(&mut self) -> Option<(ConnectionId, bool)> {
        let id = self.dead_rx.recv().await?;
        let removed = lock(&self.registry).remove(id);
        let closed = match removed {
            Some(subscriber) => {
                subscriber.sink.close();
                debug!(connection = id, token = %subscriber.token, "Reaped connection");
                true
            }
            None => false,
        };
        Some((id, closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockSink {
        received: Mutex<Vec<Stats>>,
        fail_with: Mutex<Option<SinkError>>,
        closes: AtomicUsize,
    }

    impl MockSink {
        fn failing(err: SinkError) -> Arc<Self> {
            let sink = MockSink::default();
            *sink.fail_with.lock().unwrap() = Some(err);
            Arc::new(sink)
        }

        fn received(&self) -> Vec<Stats> {
            self.received.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl StatsSink for MockSink {
        fn push(&self, stats: &Stats) -> Result<(), SinkError> {
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            self.received.lock().unwrap().push(stats.clone());
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stats(token: &str, count: u64) -> Stats {
        let mut st = Stats::empty(token, 1_708_123_456);
        for _ in 0..count {
            st.window_5m.record(10.0, 1.0);
        }
        st
    }

    #[test]
    fn test_subscribe_sends_snapshot_first() {
        let (hub, _reaper) = SubscriberHub::new(8);
        let sink = Arc::new(MockSink::default());

        hub.subscribe("BTC", sink.clone(), || stats("BTC", 0)).unwrap();
        hub.broadcast(&stats("BTC", 1));

        let got = sink.received();
        assert_eq!(got.len(), 2);
        assert!(got[0].is_empty());
        assert_eq!(got[1].window_5m.count, 1);
    }

    #[test]
    fn test_snapshot_built_after_registration() {
        let (hub, _reaper) = SubscriberHub::new(8);
        let sink = Arc::new(MockSink::default());
        let observer = hub.clone();

        hub.subscribe("BTC", sink.clone(), || {
            // The connection is already visible while the view is computed.
            assert_eq!(observer.subscriber_count("BTC"), 1);
            stats("BTC", 0)
        })
        .unwrap();
        assert_eq!(sink.received().len(), 1);
    }

    #[test]
    fn test_failed_snapshot_does_not_register() {
        let (hub, _reaper) = SubscriberHub::new(8);
        let sink = MockSink::failing(SinkError::Closed);

        let err = hub.subscribe("BTC", sink.clone(), || stats("BTC", 0)).unwrap_err();
        assert_eq!(err, SinkError::Closed);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(sink.closes(), 1);
    }

    #[test]
    fn test_broadcast_only_reaches_token_subscribers() {
        let (hub, _reaper) = SubscriberHub::new(8);
        let btc_a = Arc::new(MockSink::default());
        let btc_b = Arc::new(MockSink::default());
        let eth = Arc::new(MockSink::default());
        hub.subscribe("BTC", btc_a.clone(), || stats("BTC", 0)).unwrap();
        hub.subscribe("BTC", btc_b.clone(), || stats("BTC", 0)).unwrap();
        hub.subscribe("ETH", eth.clone(), || stats("ETH", 0)).unwrap();

        assert_eq!(hub.broadcast(&stats("BTC", 2)), 2);
        assert_eq!(hub.broadcast(&stats("SOL", 2)), 0);

        assert_eq!(btc_a.received().len(), 2);
        assert_eq!(btc_b.received().len(), 2);
        assert_eq!(eth.received().len(), 1);
        assert_eq!(hub.subscriber_count("BTC"), 2);
        assert_eq!(hub.connection_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_push_is_reaped_once() {
        let (hub, mut reaper) = SubscriberHub::new(8);
        let healthy = Arc::new(MockSink::default());
        let broken = Arc::new(MockSink::default());
        hub.subscribe("BTC", healthy.clone(), || stats("BTC", 0)).unwrap();
        let broken_id = hub.subscribe("BTC", broken.clone(), || stats("BTC", 0)).unwrap();

        *broken.fail_with.lock().unwrap() = Some(SinkError::Full);
        assert_eq!(hub.broadcast(&stats("BTC", 1)), 1);
        // Still registered until the reaper runs.
        assert_eq!(hub.subscriber_count("BTC"), 2);

        // The read loop reports the same connection again.
        hub.mark_dead(broken_id);

        assert_eq!(reaper.reap_next().await, Some((broken_id, true)));
        assert_eq!(reaper.reap_next().await, Some((broken_id, false)));
        assert_eq!(broken.closes(), 1);
        assert_eq!(healthy.closes(), 0);
        assert_eq!(hub.subscriber_count("BTC"), 1);
    }

    #[tokio::test]
    async fn test_reaper_stops_when_hub_dropped() {
        let (hub, reaper) = SubscriberHub::new(8);
        let sink = Arc::new(MockSink::default());
        let id = hub.subscribe("ETH", sink.clone(), || stats("ETH", 0)).unwrap();
        hub.mark_dead(id);
        drop(hub);

        reaper.run().await;
        assert_eq!(sink.closes(), 1);
    }

    #[test]
    fn test_mark_dead_drops_when_queue_full() {
        let (hub, _reaper) = SubscriberHub::new(1);
        hub.mark_dead(1);
        // Second report does not block.
        hub.mark_dead(2);
    }

    #[test]
    fn test_publisher_broadcasts() {
        let (hub, _reaper) = SubscriberHub::new(8);
        let sink = Arc::new(MockSink::default());
        hub.subscribe("SOL", sink.clone(), || stats("SOL", 0)).unwrap();

        let publisher: Arc<dyn StatsPublisher> = Arc::new(hub.clone());
        publisher.publish(&stats("SOL", 3));
        assert_eq!(sink.received().last().unwrap().window_5m.count, 3);
    }
}
