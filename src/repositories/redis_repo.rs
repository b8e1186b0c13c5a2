//! Redis pub/sub relay so that every dispatcher node sees every published update.

use crate::error::{AppError, AppResult};
use crate::models::Envelope;
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Single channel carrying all topic events between nodes.
const BACKPLANE_CHANNEL: &str = "fleetcast:events";

/// One relayed event: the topic key and the envelope to deliver on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneMessage {
    pub topic: String,
    pub envelope: Envelope,
}

/// Relay between dispatcher nodes. Every node, the publisher included, receives each
/// message once and delivers it to its own sockets.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Relay an event; returns the number of nodes it reached.
    async fn publish(&self, message: &BackplaneMessage) -> AppResult<u64>;
}

#[derive(Clone)]
pub struct RedisRepository {
    client: Arc<redis::Client>,
}

impl RedisRepository {
    /// Create repository from Redis URL.
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get a multiplexed connection for commands.
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Subscribe to the backplane; every relayed event (including this node's own) arrives on the receiver.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<BackplaneMessage>, AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(BACKPLANE_CHANNEL).await?;
        info!(channel = BACKPLANE_CHANNEL, "subscribed to backplane");

        let (tx, rx) = broadcast::channel(256);
        let mut stream = pubsub.into_on_message();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<BackplaneMessage>(&payload) {
                    Ok(message) => {
                        let _ = tx.send(message);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed backplane message"),
                }
            }
            warn!("backplane subscription ended");
        });

        Ok(rx)
    }
}

#[async_trait]
impl Backplane for RedisRepository {
    async fn publish(&self, message: &BackplaneMessage) -> AppResult<u64> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        let nodes: u64 = conn.publish(BACKPLANE_CHANNEL, payload).await?;
        debug!(topic = %message.topic, nodes, "relayed to backplane");
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backplane_message_round_trips_envelope() {
        let message = BackplaneMessage {
            topic: "trip:42".to_string(),
            envelope: Envelope::subscribe_trip(42),
        };
        let text = serde_json::to_string(&message).unwrap();
        let back: BackplaneMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.topic, "trip:42");
        assert_eq!(back.envelope, message.envelope);
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(
            RedisRepository::new("not a url"),
            Err(AppError::Redis(_))
        ));
    }
}
