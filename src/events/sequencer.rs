//! Global ordering authority for change events

use super::{EventDraft, EventRecord, ReplayWindow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Assigns gap-free sequence numbers and retains every record
///
/// Takes `&mut self`: the owner keeps it behind one lock so that assignment,
/// retention and fan-out form a single critical section (see
/// [`EventPipeline`](super::EventPipeline)).
#[derive(Debug)]
pub struct Sequencer {
    last_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    window: ReplayWindow,
}

impl Sequencer {
    pub fn new(window: ReplayWindow) -> Self {
        Self {
            last_sequence: 0,
            last_timestamp: None,
            window,
        }
    }

    /// Turn a draft into the next record and append it to the replay window
    pub fn next(&mut self, draft: EventDraft) -> Arc<EventRecord> {
        self.next_at(draft, Utc::now(), Instant::now())
    }

    pub(crate) fn next_at(
        &mut self,
        draft: EventDraft,
        wall_clock: DateTime<Utc>,
        now: Instant,
    ) -> Arc<EventRecord> {
        self.last_sequence += 1;

        // Wall clocks can step backwards; timestamps must not
        let timestamp = match self.last_timestamp {
            Some(last) if wall_clock < last => last,
            _ => wall_clock,
        };
        self.last_timestamp = Some(timestamp);

        let record = Arc::new(EventRecord::from_draft(
            draft,
            self.last_sequence,
            timestamp,
        ));
        self.window.append_at(record.clone(), now);
        record
    }

    pub fn latest_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn window(&self) -> &ReplayWindow {
        &self.window
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(ReplayWindow::default())
    }
}
