//! Broadcast hub: owns the subscriber set and fans records out to it

use super::queue::{Delivery, DeliveryQueue, EnqueueOutcome, ResyncReason};
use super::{EventKind, EventRecord};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Connection style of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sse,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Sse => f.write_str("sse"),
            Transport::WebSocket => f.write_str("websocket"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which events a subscriber wants; empty means everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub resource_id: Option<String>,
}

impl SubscriberFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&record.kind()) {
                return false;
            }
        }
        if let Some(ref id) = self.resource_id {
            if id != record.resource_id() {
                return false;
            }
        }
        true
    }
}

/// What the hub needs from a subscriber
///
/// The hub never looks at the transport behind a sink: it only enqueues and
/// closes. Both must be cheap and must never wait on the connection.
pub trait EventSink: Send + Sync {
    fn id(&self) -> SubscriberId;

    fn transport(&self) -> Transport;

    /// Hand over one record; O(1), non-blocking
    fn enqueue(&self, record: &Arc<EventRecord>);

    /// Stop accepting records and wake the drain loop so it can terminate
    fn close(&self);
}

/// Queue-backed subscriber shared by the SSE and WebSocket adapters
///
/// The hub enqueues; the owning adapter drains via [`Subscriber::recv`] and
/// records progress with [`Subscriber::mark_sent`].
pub struct Subscriber {
    id: SubscriberId,
    transport: Transport,
    filter: SubscriberFilter,
    queue: DeliveryQueue,
    last_sequence_sent: AtomicU64,
    last_acked: AtomicU64,
    alive: AtomicBool,
}

impl Subscriber {
    pub fn new(
        transport: Transport,
        filter: SubscriberFilter,
        queue_capacity: usize,
        gap_threshold: u64,
    ) -> Self {
        Self {
            id: SubscriberId::new(),
            transport,
            filter,
            queue: DeliveryQueue::new(queue_capacity, gap_threshold),
            last_sequence_sent: AtomicU64::new(0),
            last_acked: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }

    pub fn filter(&self) -> &SubscriberFilter {
        &self.filter
    }

    /// Seed catch-up records that pass the filter
    pub(crate) fn seed(&self, records: Vec<Arc<EventRecord>>) {
        self.queue
            .seed(records.into_iter().filter(|r| self.filter.matches(r)));
    }

    pub(crate) fn signal_resync(&self, reason: ResyncReason) {
        self.queue.signal_resync(reason);
    }

    pub async fn recv(&self) -> Option<Delivery> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.queue.try_recv()
    }

    pub fn mark_sent(&self, sequence: u64) {
        self.last_sequence_sent.fetch_max(sequence, Ordering::Relaxed);
    }

    pub fn last_sequence_sent(&self) -> u64 {
        self.last_sequence_sent.load(Ordering::Relaxed)
    }

    pub fn ack(&self, sequence: u64) {
        self.last_acked.fetch_max(sequence, Ordering::Relaxed);
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked.load(Ordering::Relaxed)
    }

    pub fn gaps(&self) -> u64 {
        self.queue.gaps()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl EventSink for Subscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn enqueue(&self, record: &Arc<EventRecord>) {
        if !self.filter.matches(record) {
            return;
        }
        match self.queue.push(record) {
            EnqueueOutcome::Queued | EnqueueOutcome::Ignored => {}
            EnqueueOutcome::Overflowed { gaps } => {
                debug!(
                    subscriber_id = %self.id,
                    transport = %self.transport,
                    sequence = record.sequence(),
                    gaps,
                    "Subscriber queue full, dropped oldest event"
                );
            }
            EnqueueOutcome::Escalated { gaps } => {
                warn!(
                    subscriber_id = %self.id,
                    transport = %self.transport,
                    gaps,
                    "Subscriber exceeded gap threshold, forcing resync"
                );
            }
        }
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.queue.close();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("filter", &self.filter)
            .field("last_sequence_sent", &self.last_sequence_sent())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// The set of live subscribers
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: DashMap<SubscriberId, Arc<dyn EventSink>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = sink.id();
        debug!(subscriber_id = %id, transport = %sink.transport(), "Subscriber registered");
        self.subscribers.insert(id, sink);
        id
    }

    /// Remove and close a subscriber; returns false if it was already gone
    pub fn unregister(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, sink)) => {
                sink.close();
                debug!(subscriber_id = %id, transport = %sink.transport(), "Subscriber unregistered");
                true
            }
            None => false,
        }
    }

    /// Enqueue `record` on every registered subscriber
    ///
    /// Iterates a snapshot of the set, so registrations and removals running
    /// concurrently neither block the fan-out nor see a record twice. A sink
    /// removed after the snapshot is already closed and drops the record.
    pub fn publish(&self, record: &Arc<EventRecord>) -> usize {
        let targets: Vec<Arc<dyn EventSink>> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for sink in &targets {
            sink.enqueue(record);
        }

        debug!(
            sequence = record.sequence(),
            kind = %record.kind(),
            resource_id = %record.resource_id(),
            subscribers = targets.len(),
            "Event published"
        );
        targets.len()
    }

    /// Close and drop every subscriber (server shutdown)
    pub fn close_all(&self) -> usize {
        let ids: Vec<SubscriberId> = self.subscribers.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.unregister(*id)).count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn record(seq: u64, kind: EventKind, id: &str) -> Arc<EventRecord> {
        Arc::new(EventRecord::from_draft(
            EventDraft::new(kind, id, Some(serde_json::json!({"seq": seq}))),
            seq,
            Utc::now(),
        ))
    }

    fn subscriber(filter: SubscriberFilter) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(Transport::Sse, filter, 16, 4))
    }

    fn received(sub: &Subscriber) -> Vec<u64> {
        std::iter::from_fn(|| sub.try_recv())
            .filter_map(|d| match d {
                Delivery::Event(r) => Some(r.sequence()),
                _ => None,
            })
            .collect()
    }

    /// Sink that takes its time on every enqueue
    struct SluggishSink {
        id: SubscriberId,
        delay: Duration,
        seen: Mutex<Vec<u64>>,
    }

    impl EventSink for SluggishSink {
        fn id(&self) -> SubscriberId {
            self.id
        }
        fn transport(&self) -> Transport {
            Transport::WebSocket
        }
        fn enqueue(&self, record: &Arc<EventRecord>) {
            std::thread::sleep(self.delay);
            self.seen.lock().unwrap().push(record.sequence());
        }
        fn close(&self) {}
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub = BroadcastHub::new();
        let a = subscriber(SubscriberFilter::default());
        let b = subscriber(SubscriberFilter::default());
        hub.register(a.clone());
        hub.register(b.clone());

        for seq in 1..=3 {
            assert_eq!(hub.publish(&record(seq, EventKind::Created, "r1")), 2);
        }
        assert_eq!(received(&a), vec![1, 2, 3]);
        assert_eq!(received(&b), vec![1, 2, 3]);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.publish(&record(1, EventKind::Deleted, "r1")), 0);
    }

    #[test]
    fn test_unregister_is_idempotent_and_closes() {
        let hub = BroadcastHub::new();
        let sub = subscriber(SubscriberFilter::default());
        let id = hub.register(sub.clone());

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(!sub.is_alive());
        assert_eq!(hub.subscriber_count(), 0);

        // A stale handle held by a publisher is a no-op
        sub.enqueue(&record(1, EventKind::Created, "r1"));
        assert!(received(&sub).is_empty());
    }

    #[test]
    fn test_filter_by_kind_and_resource() {
        let hub = BroadcastHub::new();
        let deletes = subscriber(SubscriberFilter {
            kinds: Some([EventKind::Deleted].into_iter().collect()),
            resource_id: None,
        });
        let r2_only = subscriber(SubscriberFilter {
            kinds: None,
            resource_id: Some("r2".into()),
        });
        hub.register(deletes.clone());
        hub.register(r2_only.clone());

        hub.publish(&record(1, EventKind::Created, "r1"));
        hub.publish(&record(2, EventKind::Created, "r2"));
        hub.publish(&record(3, EventKind::Deleted, "r1"));

        assert_eq!(received(&deletes), vec![3]);
        assert_eq!(received(&r2_only), vec![2]);
    }

    #[test]
    fn test_stalled_subscriber_does_not_block_others() {
        let hub = BroadcastHub::new();
        // Never drained: overflows and escalates, but publish keeps going
        let stalled = Arc::new(Subscriber::new(Transport::Sse, SubscriberFilter::default(), 2, 3));
        let healthy = subscriber(SubscriberFilter::default());
        hub.register(stalled.clone());
        hub.register(healthy.clone());

        for seq in 1..=10 {
            hub.publish(&record(seq, EventKind::Updated, "r1"));
            assert_eq!(received(&healthy), vec![seq]);
        }
        assert!(matches!(
            stalled.try_recv(),
            Some(Delivery::Resync(ResyncReason::GapThreshold { gaps: 3 }))
        ));
        assert!(stalled.try_recv().is_none());
    }

    #[test]
    fn test_concurrent_unregister_during_publish() {
        let hub = Arc::new(BroadcastHub::new());
        let subs: Vec<Arc<Subscriber>> = (0..32)
            .map(|_| subscriber(SubscriberFilter::default()))
            .collect();
        for sub in &subs {
            hub.register(sub.clone());
        }

        let publisher = {
            let hub = hub.clone();
            std::thread::spawn(move || {
                for seq in 1..=200 {
                    hub.publish(&record(seq, EventKind::Updated, "r1"));
                }
            })
        };
        let remover = {
            let hub = hub.clone();
            let ids: Vec<SubscriberId> = subs.iter().map(|s| s.id()).collect();
            std::thread::spawn(move || {
                for id in ids {
                    hub.unregister(id);
                    hub.unregister(id);
                }
            })
        };
        publisher.join().unwrap();
        remover.join().unwrap();

        assert_eq!(hub.subscriber_count(), 0);
        for sub in &subs {
            // Whatever was delivered before removal is ordered and unique
            let seqs = received(sub);
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_publish_cost_independent_of_slow_sink_count() {
        let hub = BroadcastHub::new();
        let sluggish = Arc::new(SluggishSink {
            id: SubscriberId::new(),
            delay: Duration::from_millis(1),
            seen: Mutex::new(Vec::new()),
        });
        hub.register(sluggish.clone());
        for _ in 0..100 {
            hub.register(subscriber(SubscriberFilter::default()));
        }

        let started = Instant::now();
        hub.publish(&record(1, EventKind::Created, "r1"));
        // One slow enqueue costs its own delay, not one per subscriber
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(*sluggish.seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_close_all() {
        let hub = BroadcastHub::new();
        let a = subscriber(SubscriberFilter::default());
        let b = subscriber(SubscriberFilter::default());
        hub.register(a.clone());
        hub.register(b.clone());
        assert_eq!(hub.close_all(), 2);
        assert!(!a.is_alive() && !b.is_alive());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
