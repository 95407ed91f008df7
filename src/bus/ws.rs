//! WebSocket endpoint for the real-time channel.
//!
//! The HTTP auth middleware runs before the upgrade, so the socket starts
//! with verified claims. Outbound sends carry a write timeout; a consumer
//! that can't keep up is disconnected rather than backing up the bus.

use crate::bus::registry::SubscriptionFilter;
use crate::bus::{DomainEvent, EventBus};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        filters: SubscriptionFilter,
    },
    Ping,
    Replay {
        #[serde(rename = "fromTimestamp")]
        from_timestamp: i64,
        #[serde(rename = "eventTypes")]
        event_types: Option<Vec<String>>,
        limit: Option<usize>,
    },
}

const REPLAY_DEFAULT_LIMIT: usize = 500;

pub async fn run_session(
    mut socket: WebSocket,
    bus: Arc<EventBus>,
    user_id: String,
    role: crate::auth::Role,
    send_timeout: Duration,
) {
    let session_id = Uuid::new_v4().to_string();
    let mut rx = bus.registry.register(&session_id, &user_id, role);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    // Registry dropped us (reaper or slow-consumer cut).
                    break;
                };
                if !send_event(&mut socket, &event, send_timeout).await {
                    break;
                }
            }
            maybe_msg = socket.recv() => {
                let Some(Ok(msg)) = maybe_msg else {
                    break;
                };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                bus.registry.record_ping(&session_id);
                                let pong = json!({
                                    "type": "pong",
                                    "timestamp": Utc::now().timestamp_millis(),
                                });
                                if socket.send(Message::Text(pong.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Subscribe { filters }) => {
                                bus.registry.update_filter(&session_id, filters);
                            }
                            Ok(ClientMessage::Replay { from_timestamp, event_types, limit }) => {
                                let limit = limit.unwrap_or(REPLAY_DEFAULT_LIMIT);
                                let events = bus.replay(
                                    &session_id,
                                    from_timestamp,
                                    event_types.as_deref(),
                                    limit,
                                );
                                debug!(session_id, count = events.len(), "replaying events");
                                let mut ok = true;
                                for event in &events {
                                    if !send_event(&mut socket, event, send_timeout).await {
                                        ok = false;
                                        break;
                                    }
                                }
                                if !ok {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(session_id, "ignoring unparseable client message: {e}");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    bus.registry.remove(&session_id);
    debug!(session_id, "websocket session ended");
}

/// Send one event with the write timeout. Returns false when the session
/// should be torn down.
async fn send_event(socket: &mut WebSocket, event: &DomainEvent, send_timeout: Duration) -> bool {
    let msg = json!({ "type": "event", "data": event }).to_string();
    match timeout(send_timeout, socket.send(Message::Text(msg))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("websocket send failed: {e}");
            false
        }
        Err(_) => {
            warn!("websocket send timed out, disconnecting slow consumer");
            false
        }
    }
}
