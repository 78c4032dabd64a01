//! Mutation-to-notification pipeline
//!
//! [`EventPipeline`] ties the sequencer, the replay window and the hub
//! together behind one ordering lock:
//!
//! - committing a mutation assigns its sequence, retains it and fans it out
//!   in a single critical section, so the hub sees records strictly in
//!   sequence order;
//! - subscribing reads the catch-up from the window and registers the
//!   subscriber under the same lock, so no record can fall between the
//!   replay and the live stream, and none can appear in both.
//!
//! The fan-out inside the lock is one O(1) enqueue per subscriber; socket
//! writes happen in the per-connection drain loops.

use super::hub::{BroadcastHub, EventSink, Subscriber, SubscriberFilter, SubscriberId, Transport};
use super::queue::{Delivery, ResyncReason, DEFAULT_GAP_THRESHOLD, DEFAULT_QUEUE_CAPACITY};
use super::replay::{ReplayWindow, WindowStats, DEFAULT_REPLAY_CAPACITY, DEFAULT_REPLAY_MAX_AGE};
use super::{EventDraft, EventEmitter, EventKind, EventRecord, Sequencer};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Sizing of the replay window and subscriber queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub replay_capacity: usize,
    pub replay_max_age: Duration,
    pub queue_capacity: usize,
    pub gap_threshold: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            replay_max_age: DEFAULT_REPLAY_MAX_AGE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            gap_threshold: DEFAULT_GAP_THRESHOLD,
        }
    }
}

/// Counters reported by `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub latest_sequence: u64,
    pub subscribers: usize,
    pub retained: usize,
    pub oldest_sequence: Option<u64>,
}

pub struct EventPipeline {
    sequencer: Mutex<Sequencer>,
    hub: Arc<BroadcastHub>,
    config: PipelineConfig,
}

impl EventPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let window = ReplayWindow::new(config.replay_capacity, config.replay_max_age);
        Self {
            sequencer: Mutex::new(Sequencer::new(window)),
            hub: Arc::new(BroadcastHub::new()),
            config,
        }
    }

    /// Sequence a committed mutation and publish it
    pub fn commit(&self, draft: EventDraft) -> Arc<EventRecord> {
        let mut sequencer = self.lock();
        let record = sequencer.next(draft);
        self.hub.publish(&record);
        record
    }

    /// Register a subscriber, optionally resuming after `resume_from`
    ///
    /// A resume point inside the window seeds the queue with every later
    /// record; one outside it queues a resync signal instead. Either way the
    /// subscriber is live from the current sequence on.
    pub fn subscribe(
        &self,
        transport: Transport,
        filter: SubscriberFilter,
        resume_from: Option<u64>,
    ) -> Subscription {
        let subscriber = Arc::new(Subscriber::new(
            transport,
            filter,
            self.config.queue_capacity,
            self.config.gap_threshold,
        ));

        let sequencer = self.lock();
        let latest_sequence = sequencer.latest_sequence();
        if let Some(after) = resume_from {
            match sequencer.window().since(after) {
                Ok(records) => {
                    debug!(
                        subscriber_id = %subscriber.id(),
                        resume_from = after,
                        catch_up = records.len(),
                        "Seeding subscriber from replay window"
                    );
                    subscriber.seed(records);
                }
                Err(e) => {
                    info!(
                        subscriber_id = %subscriber.id(),
                        transport = %transport,
                        "Resume rejected, resync required: {}",
                        e
                    );
                    subscriber.signal_resync(ResyncReason::from(e));
                }
            }
        }
        self.hub.register(subscriber.clone());
        drop(sequencer);

        Subscription {
            subscriber,
            hub: self.hub.clone(),
            latest_sequence,
        }
    }

    /// Replay read without registering (snapshot-consistent)
    pub fn since(&self, after: u64) -> Result<Vec<Arc<EventRecord>>, super::ResumeError> {
        self.lock().window().since(after)
    }

    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.hub.unregister(id)
    }

    /// Close every subscriber so long-lived streams end
    pub fn shutdown(&self) -> usize {
        let closed = self.hub.close_all();
        info!(subscribers = closed, "Event pipeline closed all subscribers");
        closed
    }

    pub fn latest_sequence(&self) -> u64 {
        self.lock().latest_sequence()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn stats(&self) -> PipelineStats {
        let WindowStats {
            retained,
            oldest_sequence,
            latest_sequence,
        } = self.lock().window().stats();
        PipelineStats {
            latest_sequence,
            subscribers: self.hub.subscriber_count(),
            retained,
            oldest_sequence,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl EventEmitter for EventPipeline {
    fn on_mutation_committed(
        &self,
        kind: EventKind,
        resource_id: &str,
        payload: Option<serde_json::Value>,
    ) {
        self.commit(EventDraft::new(kind, resource_id, payload));
    }
}

/// A registered subscriber; unregisters itself when dropped
///
/// Dropping happens when the client disconnects, the request is cancelled
/// or the drain loop ends, so every exit path releases the queue.
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    hub: Arc<BroadcastHub>,
    latest_sequence: u64,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Latest sequence at registration time
    pub fn latest_sequence(&self) -> u64 {
        self.latest_sequence
    }

    pub async fn recv(&self) -> Option<Delivery> {
        self.subscriber.recv().await
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.subscriber.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.subscriber.id());
    }
}
