//! Per-subscriber bounded delivery queue
//!
//! Overflow policy is drop-oldest-and-mark-gap: the oldest queued record is
//! evicted, a gap is counted and the next delivery reports how many records
//! were lost. Once the gap count reaches the threshold the queue is cleared
//! and replaced by a single terminal resync signal.

use super::{EventRecord, ResumeError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Default live queue capacity per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of dropped records before forcing a resync
pub const DEFAULT_GAP_THRESHOLD: u64 = 8;

/// Why a subscriber must re-fetch full state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ResyncReason {
    /// The resume point was evicted from the replay window
    ResumeTooOld { requested: u64, oldest: u64 },
    /// The resume point is beyond anything sequenced in this process
    ResumeAhead { requested: u64, latest: u64 },
    /// The subscriber fell too far behind and lost `gaps` records
    GapThreshold { gaps: u64 },
}

impl ResyncReason {
    /// Terminal resyncs end the stream after being delivered
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResyncReason::GapThreshold { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::ResumeTooOld { .. } => "resume_too_old",
            ResyncReason::ResumeAhead { .. } => "resume_ahead",
            ResyncReason::GapThreshold { .. } => "gap_threshold",
        }
    }
}

impl From<ResumeError> for ResyncReason {
    fn from(err: ResumeError) -> Self {
        match err {
            ResumeError::TooOld { requested, oldest } => {
                ResyncReason::ResumeTooOld { requested, oldest }
            }
            ResumeError::Ahead { requested, latest } => {
                ResyncReason::ResumeAhead { requested, latest }
            }
        }
    }
}

/// One item handed to a transport drain loop
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Arc<EventRecord>),
    Gap { missed: u64 },
    Resync(ResyncReason),
}

/// Result of a single enqueue, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest record; `gaps` is the running total
    Overflowed { gaps: u64 },
    /// The gap threshold was reached and the queue now holds a resync
    Escalated { gaps: u64 },
    /// Closed, already awaiting a terminal resync, or an old sequence
    Ignored,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Replay records seeded at registration, drained before `live`
    backlog: VecDeque<Arc<EventRecord>>,
    live: VecDeque<Arc<EventRecord>>,
    resync: Option<ResyncReason>,
    unreported_gap: u64,
    gaps: u64,
    last_enqueued: u64,
    closed: bool,
}

/// Bounded single-consumer queue with async wake-up
#[derive(Debug)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    gap_threshold: u64,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, gap_threshold: u64) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            gap_threshold: gap_threshold.max(1),
        }
    }

    /// Seed catch-up records; not subject to the live capacity bound
    pub fn seed(&self, records: impl IntoIterator<Item = Arc<EventRecord>>) {
        let mut state = self.lock();
        for record in records {
            if record.sequence() > state.last_enqueued {
                state.last_enqueued = record.sequence();
                state.backlog.push_back(record);
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a resync signal ahead of any pending record
    pub fn signal_resync(&self, reason: ResyncReason) {
        let mut state = self.lock();
        if reason.is_terminal() {
            state.backlog.clear();
            state.live.clear();
            state.unreported_gap = 0;
        }
        state.resync = Some(reason);
        drop(state);
        self.notify.notify_one();
    }

    /// Constant-time, never blocks on the consumer
    pub fn push(&self, record: &Arc<EventRecord>) -> EnqueueOutcome {
        let mut state = self.lock();
        if state.closed
            || state.resync.as_ref().is_some_and(ResyncReason::is_terminal)
            || record.sequence() <= state.last_enqueued
        {
            return EnqueueOutcome::Ignored;
        }

        let mut outcome = EnqueueOutcome::Queued;
        if state.live.len() >= self.capacity {
            state.live.pop_front();
            state.gaps += 1;
            state.unreported_gap += 1;
            if state.gaps >= self.gap_threshold {
                let gaps = state.gaps;
                state.backlog.clear();
                state.live.clear();
                state.unreported_gap = 0;
                state.resync = Some(ResyncReason::GapThreshold { gaps });
                drop(state);
                self.notify.notify_one();
                return EnqueueOutcome::Escalated { gaps };
            }
            outcome = EnqueueOutcome::Overflowed { gaps: state.gaps };
        }

        state.last_enqueued = record.sequence();
        state.live.push_back(record.clone());
        drop(state);
        self.notify.notify_one();
        outcome
    }

    /// Take the next delivery without waiting
    pub fn try_recv(&self) -> Option<Delivery> {
        let mut state = self.lock();
        Self::pop(&mut state)
    }

    /// Wait for the next delivery; `None` once closed and drained
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            {
                let mut state = self.lock();
                if let Some(delivery) = Self::pop(&mut state) {
                    return Some(delivery);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost
            self.notify.notified().await;
        }
    }

    /// Stop accepting records; pending ones are discarded
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.backlog.clear();
        state.live.clear();
        drop(state);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn gaps(&self) -> u64 {
        self.lock().gaps
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.backlog.len() + state.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(state: &mut QueueState) -> Option<Delivery> {
        if state.closed {
            return None;
        }
        if let Some(reason) = state.resync.take() {
            if reason.is_terminal() {
                // Nothing is delivered after a terminal resync
                state.closed = true;
            }
            return Some(Delivery::Resync(reason));
        }
        if state.unreported_gap > 0 && state.backlog.is_empty() {
            let missed = std::mem::take(&mut state.unreported_gap);
            return Some(Delivery::Gap { missed });
        }
        state
            .backlog
            .pop_front()
            .or_else(|| state.live.pop_front())
            .map(Delivery::Event)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_GAP_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use chrono::Utc;
    use std::time::Duration;

    fn record(seq: u64) -> Arc<EventRecord> {
        Arc::new(EventRecord::from_draft(
            EventDraft::deleted(format!("r{}", seq)),
            seq,
            Utc::now(),
        ))
    }

    fn drain(queue: &DeliveryQueue) -> Vec<Delivery> {
        std::iter::from_fn(|| queue.try_recv()).collect()
    }

    fn event_seqs(deliveries: &[Delivery]) -> Vec<u64> {
        deliveries
            .iter()
            .filter_map(|d| match d {
                Delivery::Event(r) => Some(r.sequence()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_push_and_drain_in_order() {
        let queue = DeliveryQueue::new(8, 4);
        for seq in 1..=3 {
            assert_eq!(queue.push(&record(seq)), EnqueueOutcome::Queued);
        }
        assert_eq!(event_seqs(&drain(&queue)), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_and_marks_gap() {
        let queue = DeliveryQueue::new(2, 10);
        queue.push(&record(1));
        queue.push(&record(2));
        assert_eq!(
            queue.push(&record(3)),
            EnqueueOutcome::Overflowed { gaps: 1 }
        );

        let deliveries = drain(&queue);
        assert_eq!(deliveries[0], Delivery::Gap { missed: 1 });
        assert_eq!(event_seqs(&deliveries), vec![2, 3]);
        assert_eq!(queue.gaps(), 1);
    }

    #[test]
    fn test_gap_threshold_escalates_to_terminal_resync() {
        let queue = DeliveryQueue::new(1, 3);
        let outcomes: Vec<_> = (1..=4).map(|seq| queue.push(&record(seq))).collect();
        assert_eq!(outcomes[3], EnqueueOutcome::Escalated { gaps: 3 });

        // No partial events after escalation
        assert_eq!(queue.push(&record(5)), EnqueueOutcome::Ignored);
        assert_eq!(
            drain(&queue),
            vec![Delivery::Resync(ResyncReason::GapThreshold { gaps: 3 })]
        );
        assert!(queue.is_closed());
    }

    #[test]
    fn test_seed_then_live_without_duplicates() {
        let queue = DeliveryQueue::new(2, 2);
        queue.seed((2..=6).map(record));
        // Already covered by the backlog
        assert_eq!(queue.push(&record(6)), EnqueueOutcome::Ignored);
        queue.push(&record(7));
        assert_eq!(event_seqs(&drain(&queue)), vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(queue.gaps(), 0);
    }

    #[test]
    fn test_non_terminal_resync_precedes_live_events() {
        let queue = DeliveryQueue::default();
        queue.signal_resync(ResyncReason::ResumeTooOld {
            requested: 1,
            oldest: 50,
        });
        queue.push(&record(60));
        let deliveries = drain(&queue);
        assert!(matches!(
            deliveries[0],
            Delivery::Resync(ResyncReason::ResumeTooOld { .. })
        ));
        assert_eq!(event_seqs(&deliveries), vec![60]);
        assert!(!queue.is_closed());
    }

    #[test]
    fn test_resync_reason_wire_format() {
        let json = serde_json::to_value(ResyncReason::ResumeTooOld {
            requested: 2,
            oldest: 9,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"reason": "resume_too_old", "requested": 2, "oldest": 9})
        );
    }

    #[test]
    fn test_closed_queue_ignores_pushes() {
        let queue = DeliveryQueue::default();
        queue.push(&record(1));
        queue.close();
        assert_eq!(queue.push(&record(2)), EnqueueOutcome::Ignored);
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::default());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(&record(1));

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivery, Some(Delivery::Event(r)) if r.sequence() == 1));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let queue = Arc::new(DeliveryQueue::default());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(delivery.is_none());
    }
}
