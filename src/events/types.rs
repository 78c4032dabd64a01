//! Change event types shared by the sequencer, the hub and both transports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The mutation that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    /// Wire name, also used as the SSE `event:` field
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" => Ok(EventKind::Created),
            "updated" => Ok(EventKind::Updated),
            "deleted" => Ok(EventKind::Deleted),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// A mutation that has been committed but not yet sequenced
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub kind: EventKind,
    pub resource_id: String,
    pub payload: Option<serde_json::Value>,
}

impl EventDraft {
    pub fn new(
        kind: EventKind,
        resource_id: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        // Deletions never carry a snapshot
        let payload = match kind {
            EventKind::Deleted => None,
            _ => payload,
        };
        Self {
            kind,
            resource_id: resource_id.into(),
            payload,
        }
    }

    pub fn created(resource_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(EventKind::Created, resource_id, Some(payload))
    }

    pub fn updated(resource_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(EventKind::Updated, resource_id, Some(payload))
    }

    pub fn deleted(resource_id: impl Into<String>) -> Self {
        Self::new(EventKind::Deleted, resource_id, None)
    }
}

/// A sequenced change event
///
/// Only the [`Sequencer`](super::Sequencer) builds these. Records are shared
/// as `Arc<EventRecord>` between the replay window and every subscriber
/// queue, so fields are read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    sequence: u64,
    kind: EventKind,
    resource_id: String,
    payload: Option<serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub(crate) fn from_draft(draft: EventDraft, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            kind: draft.kind,
            resource_id: draft.resource_id,
            payload: draft.payload,
            timestamp,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Receiver of committed mutations
///
/// The item store calls this once per successful mutation, after the new
/// state is readable and before it releases its write lock. Implementations
/// must not block: the mutation path never waits on subscribers.
pub trait EventEmitter: Send + Sync {
    /// Sequence, retain and publish one mutation
    fn on_mutation_committed(
        &self,
        kind: EventKind,
        resource_id: &str,
        payload: Option<serde_json::Value>,
    );

    fn emit_created(&self, resource_id: &str, payload: serde_json::Value) {
        self.on_mutation_committed(EventKind::Created, resource_id, Some(payload));
    }

    fn emit_updated(&self, resource_id: &str, payload: serde_json::Value) {
        self.on_mutation_committed(EventKind::Updated, resource_id, Some(payload));
    }

    fn emit_deleted(&self, resource_id: &str) {
        self.on_mutation_committed(EventKind::Deleted, resource_id, None);
    }
}
