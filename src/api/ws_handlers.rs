//! WebSocket stream of item changes
//!
//! Connection phases:
//! 0. Optional resume: the first client message may be
//!    `{"resume_from": n}`, read within the configured handshake timeout.
//!    Without one, the stream starts from the sequence current at upgrade
//! 1. Registration, answered with a `subscribed` frame
//! 2. Streaming: catch-up then live frames, periodic pings, and control
//!    messages (`ping`, `ack`) handled by a separate reader task
//!
//! Every write is bounded by the ping interval; a client that stops reading
//! is disconnected instead of stalling the connection task.

use super::handlers::{AppError, LiveState};
use super::query::StreamQuery;
use crate::events::{
    Delivery, EventRecord, EventSink, ResyncReason, Subscriber, SubscriberFilter, SubscriberId,
    Transport,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Pending control replies (pong, error) per connection
const CONTROL_QUEUE_CAPACITY: usize = 32;

/// Frames sent to the client, tagged by `type`
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    Subscribed {
        subscriber_id: SubscriberId,
        latest_sequence: u64,
    },
    Event(&'a EventRecord),
    Gap {
        missed: u64,
    },
    ResyncRequired(&'a ResyncReason),
    Pong,
    Error {
        message: String,
    },
}

impl<'a> ServerFrame<'a> {
    fn from_delivery(delivery: &'a Delivery) -> Self {
        match delivery {
            Delivery::Event(record) => ServerFrame::Event(record.as_ref()),
            Delivery::Gap { missed } => ServerFrame::Gap { missed: *missed },
            Delivery::Resync(reason) => ServerFrame::ResyncRequired(reason),
        }
    }
}

impl ServerFrame<'static> {
    fn error(message: impl Into<String>) -> ServerFrame<'static> {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Messages accepted from the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Resume { resume_from: u64 },
    Control(ControlMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    Ack { sequence: u64 },
}

/// Failures while writing to the socket
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket send failed: {0}")]
    Send(#[from] axum::Error),
    #[error("websocket write timed out after {0:?}")]
    Timeout(Duration),
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

async fn send_message(
    sender: &mut WsSender,
    message: Message,
    write_timeout: Duration,
) -> Result<(), TransportError> {
    timeout(write_timeout, sender.send(message))
        .await
        .map_err(|_| TransportError::Timeout(write_timeout))??;
    Ok(())
}

async fn send_frame(
    sender: &mut WsSender,
    frame: &ServerFrame<'_>,
    write_timeout: Duration,
) -> Result<(), TransportError> {
    let json = serde_json::to_string(frame)?;
    send_message(sender, Message::Text(json.into()), write_timeout).await
}

/// WebSocket upgrade handler for `/events/ws`
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<LiveState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = query.filter().map_err(AppError::BadRequest)?;
    let upgraded_at = state.pipeline.latest_sequence();
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, state, filter, upgraded_at)))
}

/// Outcome of the resume phase
#[derive(Debug, Default)]
struct Handshake {
    resume_from: Option<u64>,
    /// A first message that was not a resume request, handled once registered
    pending: Option<String>,
}

/// Wait for an optional `resume_from` message; `None` if the client left
async fn await_handshake(receiver: &mut WsReceiver, wait: Duration) -> Option<Handshake> {
    match timeout(wait, receiver.next()).await {
        Err(_) => Some(Handshake::default()),
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => None,
        Ok(Some(Err(e))) => {
            debug!("WS events: error during handshake: {}", e);
            None
        }
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Resume { resume_from }) => Some(Handshake {
                resume_from: Some(resume_from),
                pending: None,
            }),
            _ => Some(Handshake {
                resume_from: None,
                pending: Some(text.as_str().to_owned()),
            }),
        },
        Ok(Some(Ok(_))) => Some(Handshake::default()),
    }
}

/// Handle one client text message after registration
fn handle_client_text(
    text: &str,
    subscriber: &Subscriber,
    control_tx: &mpsc::Sender<ServerFrame<'static>>,
) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Control(ControlMessage::Ping)) => Some(ServerFrame::Pong),
        Ok(ClientMessage::Control(ControlMessage::Ack { sequence })) => {
            subscriber.ack(sequence);
            None
        }
        Ok(ClientMessage::Resume { .. }) => Some(ServerFrame::error(
            "resume_from is only accepted as the first message",
        )),
        Err(e) => Some(ServerFrame::error(format!("invalid message: {}", e))),
    };
    if let Some(frame) = reply {
        if control_tx.try_send(frame).is_err() {
            debug!(subscriber_id = %subscriber.id(), "WS events: control reply dropped");
        }
    }
}

/// Inbound half: runs until the client closes or the socket errors
async fn read_client(
    mut receiver: WsReceiver,
    subscriber: Arc<Subscriber>,
    control_tx: mpsc::Sender<ServerFrame<'static>>,
    outstanding_pings: Arc<AtomicU32>,
) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Pong(_)) => {
                outstanding_pings.store(0, Ordering::Release);
            }
            Ok(Message::Text(text)) => handle_client_text(text.as_str(), &subscriber, &control_tx),
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary frames are ignored; pings are answered by the socket
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
}

/// Handle an individual WebSocket connection
///
/// `upgraded_at` is the latest sequence when the upgrade was accepted; a
/// client that sends no resume point still receives everything after it.
async fn handle_ws(
    socket: WebSocket,
    state: LiveState,
    filter: SubscriberFilter,
    upgraded_at: u64,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let write_timeout = state.config.ws_ping_interval();

    // ========================================================================
    // Phase 0: optional resume point from the first message
    // ========================================================================
    let Some(handshake) = await_handshake(&mut ws_receiver, state.config.ws_resume_timeout()).await
    else {
        debug!("WS events: client left before registering");
        return;
    };

    // ========================================================================
    // Phase 1: register
    // ========================================================================
    let resume_from = handshake.resume_from.unwrap_or(upgraded_at);
    let subscription = state
        .pipeline
        .subscribe(Transport::WebSocket, filter, Some(resume_from));
    let subscriber = subscription.subscriber().clone();

    let welcome = ServerFrame::Subscribed {
        subscriber_id: subscription.id(),
        latest_sequence: subscription.latest_sequence(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &welcome, write_timeout).await {
        debug!(subscriber_id = %subscription.id(), "WS events: {}", e);
        return;
    }
    debug!(
        subscriber_id = %subscription.id(),
        resume_from,
        latest_sequence = subscription.latest_sequence(),
        "WebSocket events client subscribed"
    );

    // ========================================================================
    // Phase 2: stream
    // ========================================================================
    let (control_tx, mut control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
    if let Some(text) = handshake.pending.as_deref() {
        handle_client_text(text, &subscriber, &control_tx);
    }
    let outstanding_pings = Arc::new(AtomicU32::new(0));
    let mut reader = tokio::spawn(read_client(
        ws_receiver,
        subscriber.clone(),
        control_tx,
        outstanding_pings.clone(),
    ));

    let max_missed_pongs = state.config.ws_max_missed_pongs;
    let mut ping_interval = interval(state.config.ws_ping_interval());
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ping_interval.tick().await;

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let Some(delivery) = delivery else {
                    debug!(subscriber_id = %subscription.id(), "WS events: queue closed");
                    let _ = send_message(&mut ws_sender, Message::Close(None), write_timeout).await;
                    break;
                };

                let frame = ServerFrame::from_delivery(&delivery);
                if let Err(e) = send_frame(&mut ws_sender, &frame, write_timeout).await {
                    debug!(subscriber_id = %subscription.id(), "WS events: {}", e);
                    break;
                }
                match &delivery {
                    Delivery::Event(record) => subscriber.mark_sent(record.sequence()),
                    Delivery::Resync(reason) if reason.is_terminal() => {
                        info!(
                            subscriber_id = %subscription.id(),
                            reason = reason.as_str(),
                            "WS events: closing after terminal resync"
                        );
                        let _ = send_message(&mut ws_sender, Message::Close(None), write_timeout).await;
                        break;
                    }
                    _ => {}
                }
            }

            Some(frame) = control_rx.recv() => {
                if let Err(e) = send_frame(&mut ws_sender, &frame, write_timeout).await {
                    debug!(subscriber_id = %subscription.id(), "WS events: {}", e);
                    break;
                }
            }

            // Send periodic pings to detect dead clients
            _ = ping_interval.tick() => {
                let missed = outstanding_pings.load(Ordering::Acquire);
                if missed >= max_missed_pongs {
                    warn!(
                        subscriber_id = %subscription.id(),
                        missed,
                        "WS events: client stopped answering pings"
                    );
                    break;
                }
                let ping = Message::Ping(Vec::new().into());
                if let Err(e) = send_message(&mut ws_sender, ping, write_timeout).await {
                    debug!(subscriber_id = %subscription.id(), "WS events: ping failed: {}", e);
                    break;
                }
                outstanding_pings.fetch_add(1, Ordering::AcqRel);
            }

            _ = &mut reader => {
                debug!(subscriber_id = %subscription.id(), "WebSocket client disconnected");
                break;
            }
        }
    }

    reader.abort();
    debug!(
        subscriber_id = %subscription.id(),
        last_sequence_sent = subscriber.last_sequence_sent(),
        last_acked = subscriber.last_acked(),
        "WebSocket connection closed"
    );
}
