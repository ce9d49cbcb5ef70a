#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::dispatcher::Dispatcher;
use super::protocol::{self, AckReply, ServerEvent};
use crate::error::SignalError;
use crate::room::cleanup;
use crate::room::roles::Role;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection state consulted by every handler. Holds ids only;
/// the resources themselves live in the registry.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: String,
    pub role: Role,
    pub room_id: Option<String>,
}

impl ConnectionContext {
    pub fn new(id: String) -> Self {
        Self {
            id,
            role: Role::Unassigned,
            room_id: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RateDecision {
    Allowed,
    /// Over the limit; `notify` is true for the first rejection of a burst
    Limited { notify: bool },
}

struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    fn check(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = u64::try_from(now.duration_since(self.last_refill).as_micros()).unwrap_or(u64::MAX);
        self.last_refill = now;
        // Refill: RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allowed
        } else {
            let notify = !self.warned;
            self.warned = true;
            RateDecision::Limited { notify }
        }
    }
}

/// Serializes a message and queues it as pre-serialized JSON
fn send_json<T: Serialize>(sender: &mpsc::Sender<Arc<String>>, msg: &T) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Decodes and dispatches one text frame. Returns the message to send back:
/// the ack reply when the frame carried an ack, an `error` push when it
/// failed without one, nothing otherwise.
pub async fn handle_text(dispatcher: &Dispatcher, ctx: &mut ConnectionContext, text: &str) -> Option<String> {
    let metrics = dispatcher.rooms().metrics();

    let inbound = match protocol::decode(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!("Invalid message format from {}: {}", ctx.id, e);
            metrics.inc_errors();
            return to_json(&ServerEvent::Error { message: e.to_string() });
        }
    };

    let start = Instant::now();
    let result = match inbound.event {
        Ok(event) => {
            let name = event.name();
            debug!("{} -> {}", ctx.id, name);
            let result = dispatcher.dispatch(ctx, event).await;
            if let Err(e) = &result {
                warn!("{} from {} failed ({}): {}", name, ctx.id, e.code(), e);
            }
            result
        }
        Err(e) => {
            warn!("Rejected payload from {}: {}", ctx.id, e);
            Err(e)
        }
    };
    metrics.observe_message_handling(start.elapsed());
    if result.is_err() {
        metrics.inc_errors();
    }

    match (inbound.ack, result) {
        (Some(ack), result) => to_json(&AckReply::new(ack, result)),
        (None, Err(e)) => to_json(&ServerEvent::Error { message: e.to_string() }),
        (None, Ok(_)) => None,
    }
}

/// Reply for a frame the limiter rejected. Acked frames are always answered
/// with an error; the rest get one `error` push per burst.
fn rate_limited_reply(text: &str, notify: bool) -> Option<String> {
    let err = SignalError::RateLimited {
        per_second: RATE_LIMIT_REFILL_RATE,
    };
    match protocol::decode(text).ok().and_then(|inbound| inbound.ack) {
        Some(ack) => to_json(&AckReply::new(ack, Err(err))),
        None if notify => to_json(&ServerEvent::Error { message: err.to_string() }),
        None => None,
    }
}

fn to_json<T: Serialize>(msg: &T) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize reply: {}", e);
            None
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, _permit: OwnedSemaphorePermit) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let metrics = dispatcher.rooms().metrics().clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_id);
    });

    let closer = dispatcher.peers().register(&connection_id, tx.clone());
    let _ = send_json(
        &tx,
        &ServerEvent::Connected {
            socket_id: connection_id.clone(),
        },
    );

    let mut ctx = ConnectionContext::new(connection_id.clone());
    let mut limiter = RateLimiter::new(Instant::now());

    loop {
        let next = tokio::select! {
            _ = closer.cancelled() => break,
            next = tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()) => next,
        };
        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                let reply = match limiter.check(Instant::now()) {
                    // Handled in order; the next frame waits for this one's reply
                    RateDecision::Allowed => handle_text(&dispatcher, &mut ctx, text.as_str()).await,
                    RateDecision::Limited { notify } => {
                        if notify {
                            warn!("Rate limit exceeded for connection {}", connection_id);
                        }
                        metrics.inc_errors();
                        rate_limited_reply(text.as_str(), notify)
                    }
                };

                // Replies wait for queue space instead of being dropped
                if let Some(reply) = reply {
                    let queued = tokio::select! {
                        _ = closer.cancelled() => false,
                        sent = tx.send(Arc::new(reply)) => sent.is_ok(),
                    };
                    if !queued {
                        break;
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!("Unexpected binary message from client {}", connection_id);
            }
        }
    }

    cleanup::connection_lost(dispatcher.rooms(), dispatcher.peers(), &connection_id);

    drop(tx);
    if closer.is_cancelled() {
        // The client stopped reading; its backlog is not flushed
        info!("Closing lagging connection {}", connection_id);
        send_task.abort();
    } else {
        let _ = send_task.await;
    }

    info!("Connection handler finished for connection: {}", connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::engine_events;
    use crate::media::fake::FakeEngine;
    use crate::metrics::ServerMetrics;
    use crate::room::RoomManager;
    use crate::turn::PublicStun;
    use serde_json::{json, Value};

    fn dispatcher() -> Dispatcher {
        let (tx, _rx) = engine_events();
        let rooms = RoomManager::new(
            Arc::new(FakeEngine::new(tx)),
            Arc::new(PublicStun),
            ServerMetrics::new(),
            "default",
        );
        Dispatcher::new(Arc::new(rooms))
    }

    fn parse(reply: Option<String>) -> Value {
        serde_json::from_str(&reply.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn acked_frames_get_exactly_one_reply() {
        let dispatcher = dispatcher();
        let mut ctx = ConnectionContext::new("c1".into());

        let reply = parse(handle_text(&dispatcher, &mut ctx, r#"{"event":"joinRoom","data":"r1","ack":1}"#).await);
        assert_eq!(reply, json!({ "ack": 1, "data": { "roomId": "r1" } }));
        assert_eq!(ctx.role, Role::Guest);
        assert_eq!(ctx.room_id.as_deref(), Some("r1"));

        let reply = parse(handle_text(&dispatcher, &mut ctx, r#"{"event":"getRoomStats","data":"r1","ack":2}"#).await);
        assert_eq!(reply["ack"], 2);
        assert_eq!(reply["data"]["error"], "Unauthorized: requires admin role");
    }

    #[tokio::test]
    async fn bad_payload_still_answers_the_ack() {
        let dispatcher = dispatcher();
        let mut ctx = ConnectionContext::new("c1".into());

        let reply = parse(handle_text(&dispatcher, &mut ctx, r#"{"event":"pauseConsumer","data":{},"ack":5}"#).await);
        assert_eq!(reply["ack"], 5);
        assert!(reply["data"]["error"].as_str().unwrap().contains("pauseConsumer"));

        let reply = parse(handle_text(&dispatcher, &mut ctx, r#"{"event":"teleport","ack":6}"#).await);
        assert_eq!(reply["ack"], 6);
        assert!(reply["data"]["error"].is_string());
    }

    #[tokio::test]
    async fn failures_without_ack_become_error_pushes() {
        let dispatcher = dispatcher();
        let mut ctx = ConnectionContext::new("c1".into());

        let pushed = parse(handle_text(&dispatcher, &mut ctx, r#"{"event":"getRouterRtpCapabilities"}"#).await);
        assert_eq!(pushed["event"], "error");
        assert_eq!(pushed["data"]["message"], "Room not found: default");

        let pushed = parse(handle_text(&dispatcher, &mut ctx, "not json").await);
        assert_eq!(pushed["event"], "error");

        // Successful fire-and-forget events send nothing back
        assert!(handle_text(&dispatcher, &mut ctx, r#"{"event":"joinAdmin"}"#).await.is_none());
        assert_eq!(ctx.role, Role::Admin);
    }

    #[test]
    fn rate_limited_acks_are_answered_with_an_error() {
        let reply = parse(rate_limited_reply(r#"{"event":"getProgram","ack":7}"#, false));
        assert_eq!(
            reply,
            json!({ "ack": 7, "data": { "error": "Rate limit exceeded: max 100 messages/second" } })
        );

        let pushed = parse(rate_limited_reply(r#"{"event":"getProgram"}"#, true));
        assert_eq!(pushed["event"], "error");
        assert!(rate_limited_reply(r#"{"event":"getProgram"}"#, false).is_none());
        assert!(rate_limited_reply("not json", false).is_none());
    }

    #[test]
    fn rate_limiter_allows_a_burst_then_notifies_once() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert_eq!(limiter.check(start), RateDecision::Allowed);
        }
        assert_eq!(limiter.check(start), RateDecision::Limited { notify: true });
        assert_eq!(limiter.check(start), RateDecision::Limited { notify: false });

        // 10ms refills one token at 100/s
        let later = start + Duration::from_millis(10);
        assert_eq!(limiter.check(later), RateDecision::Allowed);
        assert_eq!(limiter.check(later), RateDecision::Limited { notify: true });
    }
}
