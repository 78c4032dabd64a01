//! Bounded replay window of recently sequenced events
//!
//! Keeps the most recent records, bounded by count and by age, so that a
//! reconnecting subscriber can resume from its last seen sequence. A resume
//! point that has already been evicted is reported as [`ResumeError`] and
//! must be answered with a full resync, never with a partial replay.

use super::EventRecord;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of records retained
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// Default retention age
pub const DEFAULT_REPLAY_MAX_AGE: Duration = Duration::from_secs(300);

/// Why a resume point cannot be served from the window
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResumeError {
    /// Events after `requested` were already evicted
    #[error("resume point {requested} predates the oldest retained event {oldest}")]
    TooOld { requested: u64, oldest: u64 },
    /// The client claims to have seen events that were never sequenced
    #[error("resume point {requested} is ahead of the latest sequence {latest}")]
    Ahead { requested: u64, latest: u64 },
}

/// Snapshot of window occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub retained: usize,
    pub oldest_sequence: Option<u64>,
    pub latest_sequence: u64,
}

/// Ring buffer of `(appended_at, record)` ordered by sequence
#[derive(Debug)]
pub struct ReplayWindow {
    records: VecDeque<(Instant, Arc<EventRecord>)>,
    capacity: usize,
    max_age: Duration,
    latest_sequence: u64,
}

impl ReplayWindow {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
            latest_sequence: 0,
        }
    }

    /// Append the next record in sequence order
    pub fn append(&mut self, record: Arc<EventRecord>) {
        self.append_at(record, Instant::now());
    }

    pub(crate) fn append_at(&mut self, record: Arc<EventRecord>, now: Instant) {
        debug_assert!(record.sequence() > self.latest_sequence);
        self.latest_sequence = record.sequence();
        self.records.push_back((now, record));
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
        self.evict_expired(now);
    }

    /// Drop every record older than the age bound
    pub fn evict_expired(&mut self, now: Instant) {
        let first_live = self.first_live(now);
        self.records.drain(..first_live);
    }

    /// All retained records with `sequence > after`, oldest first
    pub fn since(&self, after: u64) -> Result<Vec<Arc<EventRecord>>, ResumeError> {
        self.since_at(after, Instant::now())
    }

    /// Expired records are treated as absent without mutating the window, so
    /// a read never races an eviction.
    pub(crate) fn since_at(
        &self,
        after: u64,
        now: Instant,
    ) -> Result<Vec<Arc<EventRecord>>, ResumeError> {
        if after > self.latest_sequence {
            return Err(ResumeError::Ahead {
                requested: after,
                latest: self.latest_sequence,
            });
        }
        if after == self.latest_sequence {
            return Ok(Vec::new());
        }

        let first_live = self.first_live(now);
        let oldest = match self.records.get(first_live) {
            Some((_, record)) => record.sequence(),
            None => {
                return Err(ResumeError::TooOld {
                    requested: after,
                    oldest: self.latest_sequence + 1,
                })
            }
        };
        if after + 1 < oldest {
            return Err(ResumeError::TooOld {
                requested: after,
                oldest,
            });
        }

        // Retained sequences are contiguous, so the start index is direct
        let start = first_live + (after + 1 - oldest) as usize;
        Ok(self
            .records
            .range(start..)
            .map(|(_, record)| record.clone())
            .collect())
    }

    pub fn stats(&self) -> WindowStats {
        self.stats_at(Instant::now())
    }

    /// Occupancy as a resuming client would see it at `now`
    pub(crate) fn stats_at(&self, now: Instant) -> WindowStats {
        let first_live = self.first_live(now);
        WindowStats {
            retained: self.records.len() - first_live,
            oldest_sequence: self.records.get(first_live).map(|(_, r)| r.sequence()),
            latest_sequence: self.latest_sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest_sequence(&self) -> u64 {
        self.latest_sequence
    }

    fn first_live(&self, now: Instant) -> usize {
        self.records
            .partition_point(|(at, _)| now.saturating_duration_since(*at) > self.max_age)
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY, DEFAULT_REPLAY_MAX_AGE)
    }
}
