//! Server-Sent Events stream of item changes
//!
//! Frame mapping:
//! - change event: `id` = sequence, `event` = kind, `data` = item snapshot
//!   (`{"resource_id": ..}` for deletions)
//! - `event: gap`, `data: {"missed": n}` when records were dropped
//! - `event: resync`, `data: {"reason": ..}` when the client must re-fetch
//! - `: keep-alive` comments while idle
//!
//! Reconnecting clients resume with the `Last-Event-ID` header (or the
//! `last_event_id` query parameter, which the header overrides).

use super::handlers::{AppError, LiveState};
use super::query::{parse_last_event_id, StreamQuery};
use crate::events::{Delivery, EventKind, EventRecord, ResyncReason, Subscription, Transport};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tracing::{debug, info};

const LAST_EVENT_ID: &str = "last-event-id";

/// Lifecycle of one SSE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseState {
    Connecting,
    Streaming,
    /// The response body was dropped before the queue ended
    ClientDisconnected,
    /// The queue closed: terminal resync or server shutdown
    ServerClosing,
    Terminated,
}

/// Owns the subscription for as long as the response body is alive
struct SseSession {
    subscription: Subscription,
    state: SseState,
}

impl SseSession {
    fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            state: SseState::Connecting,
        }
    }

    fn transition(&mut self, next: SseState) {
        debug!(
            subscriber_id = %self.subscription.id(),
            from = ?self.state,
            to = ?next,
            "SSE session state change"
        );
        self.state = next;
    }

    async fn next_frame(&mut self) -> Option<Event> {
        if self.state == SseState::Connecting {
            self.transition(SseState::Streaming);
        }
        match self.subscription.recv().await {
            Some(Delivery::Event(record)) => {
                let frame = event_frame(&record);
                self.subscription.subscriber().mark_sent(record.sequence());
                Some(frame)
            }
            Some(Delivery::Gap { missed }) => Some(gap_frame(missed)),
            Some(Delivery::Resync(reason)) => {
                info!(
                    subscriber_id = %self.subscription.id(),
                    reason = reason.as_str(),
                    "SSE subscriber told to resync"
                );
                Some(resync_frame(&reason))
            }
            None => {
                self.transition(SseState::ServerClosing);
                None
            }
        }
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        if self.state != SseState::ServerClosing {
            self.transition(SseState::ClientDisconnected);
        }
        self.transition(SseState::Terminated);
        // `subscription` drops next and unregisters from the hub
    }
}

fn event_frame(record: &EventRecord) -> Event {
    let data = match (record.kind(), record.payload()) {
        (EventKind::Deleted, _) | (_, None) => {
            serde_json::json!({ "resource_id": record.resource_id() })
        }
        (_, Some(payload)) => payload.clone(),
    };
    Event::default()
        .id(record.sequence().to_string())
        .event(record.kind().as_str())
        .data(data.to_string())
}

fn gap_frame(missed: u64) -> Event {
    Event::default()
        .event("gap")
        .data(serde_json::json!({ "missed": missed }).to_string())
}

fn resync_frame(reason: &ResyncReason) -> Event {
    let data = serde_json::to_string(reason)
        .unwrap_or_else(|_| format!(r#"{{"reason":"{}"}}"#, reason.as_str()));
    Event::default().event("resync").data(data)
}

/// Header wins over the query parameter; a malformed header is ignored
fn resume_point(headers: &HeaderMap, query: &StreamQuery) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_last_event_id)
        .or(query.last_event_id)
}

/// GET /events
pub async fn sse_events(
    State(state): State<LiveState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    open_stream(state, &headers, query)
}

/// GET /items/{item_id}/events
pub async fn item_sse_events(
    State(state): State<LiveState>,
    Path(item_id): Path<u64>,
    headers: HeaderMap,
    Query(mut query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    query.resource_id = Some(item_id.to_string());
    open_stream(state, &headers, query)
}

fn open_stream(
    state: LiveState,
    headers: &HeaderMap,
    query: StreamQuery,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let filter = query.filter().map_err(AppError::BadRequest)?;
    let resume_from = resume_point(headers, &query);

    let subscription = state
        .pipeline
        .subscribe(Transport::Sse, filter, resume_from);
    debug!(
        subscriber_id = %subscription.id(),
        resume_from = ?resume_from,
        latest_sequence = subscription.latest_sequence(),
        "SSE client subscribed"
    );

    let session = SseSession::new(subscription);
    let stream = stream::unfold(session, |mut session| async move {
        let frame = session.next_frame().await?;
        Some((Ok(frame), session))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.sse_keep_alive())
            .text("keep-alive"),
    ))
}
