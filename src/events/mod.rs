//! Change event system for real-time SSE and WebSocket notifications
//!
//! This module provides:
//! - `EventRecord`: immutable, sequenced description of one mutation
//! - `Sequencer`: single authority for sequence numbers and timestamps
//! - `ReplayWindow`: bounded history used to resume reconnecting clients
//! - `BroadcastHub`: subscriber registry and non-blocking fan-out
//! - `EventPipeline`: the lock that ties the three together, and the
//!   `EventEmitter` the item store reports mutations to

mod hub;
mod pipeline;
mod queue;
mod replay;
mod sequencer;
mod types;

pub use hub::{BroadcastHub, EventSink, Subscriber, SubscriberFilter, SubscriberId, Transport};
pub use pipeline::{EventPipeline, PipelineConfig, PipelineStats, Subscription};
pub use queue::{
    Delivery, DeliveryQueue, EnqueueOutcome, ResyncReason, DEFAULT_GAP_THRESHOLD,
    DEFAULT_QUEUE_CAPACITY,
};
pub use replay::{
    ReplayWindow, ResumeError, WindowStats, DEFAULT_REPLAY_CAPACITY, DEFAULT_REPLAY_MAX_AGE,
};
pub use sequencer::Sequencer;
pub use types::{EventDraft, EventEmitter, EventKind, EventRecord};
