//! WebSocket handler: subscription intents, driver status updates, keepalive and cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::{
    generate_connection_id, Envelope, Identity, MessageType, StatusUpdate, SubscriptionAction,
    Topic,
};
use crate::services::dispatcher::ConnectionSender;
use crate::services::notifier::{notify_detached, Notification};

/// Server ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A socket silent for this long is treated as dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

/// Upgrade HTTP to WebSocket. A `token` query parameter is verified when an identity secret is configured.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = match (params.get("token"), state.identity.as_ref()) {
        (Some(token), Some(secret)) => Some(secret.validate(token)?),
        _ => None,
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, identity)))
}

fn send_envelope(tx: &ConnectionSender, envelope: &Envelope) {
    match envelope.to_json() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text));
        }
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

async fn handle_socket(state: AppState, socket: WebSocket, identity: Option<Identity>) {
    let connection_id = generate_connection_id();
    let user_id = identity.as_ref().map(|i| i.user_id.clone()).unwrap_or_default();
    info!(connection_id = %connection_id, user_id = %user_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    state
        .dispatcher
        .register(&connection_id, tx.clone(), identity)
        .await;
    send_envelope(&tx, &Envelope::success("connected", None));

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(msg)) = frame else { break };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = handle_text(&state, &connection_id, &text).await {
                            send_envelope(&tx, &reply);
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > IDLE_TIMEOUT {
                    warn!(connection_id = %connection_id, "ws idle timeout");
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        }
    }

    let topics = state.dispatcher.remove_connection(&connection_id).await;
    send_task.abort();
    info!(connection_id = %connection_id, topics, "ws disconnected");
}

/// Handle one text frame from a client; returns the reply to send back, if any.
pub(crate) async fn handle_text(state: &AppState, connection_id: &str, text: &str) -> Option<Envelope> {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "malformed frame");
            return Some(Envelope::error("malformed message"));
        }
    };
    let Some(kind) = envelope.message_type() else {
        debug!(connection_id = %connection_id, kind = %envelope.kind, "ignoring unknown message type");
        return None;
    };

    if kind.is_intent() {
        let Some((action, topic)) = Topic::from_intent(&envelope) else {
            return Some(Envelope::error(format!("{} requires an id", kind)));
        };
        let reply = match action {
            SubscriptionAction::Subscribe => {
                if !state.dispatcher.subscribe(connection_id, topic).await {
                    return Some(Envelope::error("connection is not registered"));
                }
                "subscribed"
            }
            SubscriptionAction::Unsubscribe => {
                state.dispatcher.unsubscribe(connection_id, topic).await;
                "unsubscribed"
            }
        };
        return Some(Envelope::success(reply, Some(topic.to_string())));
    }

    match kind {
        MessageType::StatusUpdate => Some(handle_status_update(state, connection_id, &envelope).await),
        _ => {
            debug!(connection_id = %connection_id, kind = %kind, "ignoring server-side message type");
            None
        }
    }
}

async fn handle_status_update(state: &AppState, connection_id: &str, envelope: &Envelope) -> Envelope {
    let update: StatusUpdate = match envelope.payload_as() {
        Ok(update) => update,
        Err(e) => return Envelope::error(format!("invalid status_update: {}", e)),
    };

    match state
        .store()
        .set_driver_status(update.driver_id, &update.status, update.destination.as_deref())
        .await
    {
        Ok(true) => {}
        Ok(false) => return Envelope::error(format!("unknown driver {}", update.driver_id)),
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "driver status update failed");
            return Envelope::error("status update failed");
        }
    }
    info!(driver_id = update.driver_id, status = %update.status, "driver status updated");

    match state.store().passengers_for_driver(update.driver_id).await {
        Ok(recipients) => notify_detached(
            state.notifier.clone(),
            Notification {
                data: json!({ "type": MessageType::StatusUpdate.as_str(), "payload": envelope.payload }),
                recipients,
            },
        ),
        Err(e) => warn!(driver_id = update.driver_id, error = %e, "recipient lookup failed"),
    }

    Envelope::success("status updated", None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryFleetStore;
    use crate::models::TripStatus;
    use crate::services::{Dispatcher, LogNotifier};
    use std::sync::Arc;

    async fn state_with_connection() -> (AppState, MemoryFleetStore) {
        let store = MemoryFleetStore::new();
        store.insert_trip(42, 7, TripStatus::Scheduled).await;
        let state = AppState::new(
            "key".to_string(),
            Dispatcher::new(),
            Arc::new(store.clone()),
            Arc::new(LogNotifier),
        );
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.dispatcher.register("c1", tx, None).await;
        (state, store)
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_intents() {
        let (state, _) = state_with_connection().await;

        let reply = handle_text(&state, "c1", r#"{"type":"subscribe_trip","payload":{"tripId":42}}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Success));
        assert_eq!(reply.payload["topic"], "trip:42");
        assert_eq!(state.dispatcher.topics_of("c1").await, vec![Topic::Trip(42)]);

        handle_text(&state, "c1", r#"{"type":"unsubscribe_trip","payload":{"tripId":42}}"#).await;
        assert!(state.dispatcher.topics_of("c1").await.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames() {
        let (state, _) = state_with_connection().await;

        let reply = handle_text(&state, "c1", "not json").await.unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Error));

        let reply = handle_text(&state, "c1", r#"{"type":"subscribe_trip","payload":42}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Error));
        assert!(state.dispatcher.topics_of("c1").await.is_empty());

        assert!(handle_text(&state, "c1", r#"{"type":"driver_joined","payload":{}}"#)
            .await
            .is_none());
        assert!(handle_text(&state, "c1", r#"{"type":"trip_update","payload":{"tripId":1}}"#)
            .await
            .is_none());

        let reply = handle_text(&state, "c1", r#"{"type":"subscribe_location","payload":{}}"#)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Error));
    }

    #[tokio::test]
    async fn status_update_is_stored() {
        let (state, store) = state_with_connection().await;
        let reply = handle_text(
            &state,
            "c1",
            r#"{"type":"status_update","payload":{"status":"in_transit","driverId":7,"destination":"Depot"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Success));
        let driver = store.driver(7).await.unwrap();
        assert_eq!(driver.status, "in_transit");
        assert_eq!(driver.destination.as_deref(), Some("Depot"));

        let reply = handle_text(
            &state,
            "c1",
            r#"{"type":"status_update","payload":{"status":"offline","driverId":99}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Error));
    }
}
