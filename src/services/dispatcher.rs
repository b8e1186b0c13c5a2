//! Server-side topic registry: which sockets listen to which topic, and fan-out to them.

use axum::extract::ws::{CloseFrame, Message};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{ConnectionId, Envelope, Identity, Topic};
use crate::repositories::{Backplane, BackplaneMessage};

/// Sender half of a socket's outbound queue. Cloned into the registry so any task can push to it.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

struct ConnectionRecord {
    sender: ConnectionSender,
    topics: HashSet<Topic>,
    identity: Option<Identity>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<Topic, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

impl Registry {
    fn detach(&mut self, id: &str, topic: &Topic) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// Tracks live connections and their topic memberships.
///
/// Invariant: a connection id appears in a topic's set iff the connection is registered
/// and that topic is in its record. Every socket task calls [`Dispatcher::remove_connection`]
/// on exit, whatever the reason.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    backplane: Option<Arc<dyn Backplane>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route publishes through a backplane so every node delivers to its own sockets.
    /// Relayed messages come back through [`crate::services::TripWatcher::spawn_backplane_listener`].
    pub fn with_backplane<B: Backplane + 'static>(mut self, backplane: B) -> Self {
        self.backplane = Some(Arc::new(backplane));
        self
    }

    pub async fn register(&self, id: &str, sender: ConnectionSender, identity: Option<Identity>) {
        let mut registry = self.registry.write().await;
        registry.connections.insert(
            id.to_string(),
            ConnectionRecord {
                sender,
                topics: HashSet::new(),
                identity,
            },
        );
        debug!(connection_id = %id, "connection registered");
    }

    /// Returns `false` when the connection is not registered.
    pub async fn subscribe(&self, id: &str, topic: Topic) -> bool {
        let mut registry = self.registry.write().await;
        let Some(record) = registry.connections.get_mut(id) else {
            return false;
        };
        record.topics.insert(topic);
        registry
            .topics
            .entry(topic)
            .or_default()
            .insert(id.to_string());
        debug!(connection_id = %id, topic = %topic, "subscribed");
        true
    }

    /// Returns `true` when the connection was a member of the topic.
    pub async fn unsubscribe(&self, id: &str, topic: Topic) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(id)
            .map(|record| record.topics.remove(&topic))
            .unwrap_or(false);
        registry.detach(id, &topic);
        debug!(connection_id = %id, topic = %topic, was_member, "unsubscribed");
        was_member
    }

    /// Forget a connection and drop it from every topic. Returns how many topics it was in.
    pub async fn remove_connection(&self, id: &str) -> usize {
        let mut registry = self.registry.write().await;
        let Some(record) = registry.connections.remove(id) else {
            return 0;
        };
        for topic in &record.topics {
            registry.detach(id, topic);
        }
        let user_id = record.identity.as_ref().map(|i| i.user_id.as_str()).unwrap_or("-");
        debug!(connection_id = %id, user_id, topics = record.topics.len(), "connection removed");
        record.topics.len()
    }

    /// Ask a socket to close. Its task performs the registry cleanup when it exits.
    pub async fn close_connection(&self, id: &str, reason: &str) -> bool {
        let registry = self.registry.read().await;
        let Some(record) = registry.connections.get(id) else {
            return false;
        };
        let frame = CloseFrame {
            code: 1001,
            reason: reason.to_string().into(),
        };
        record.sender.send(Message::Close(Some(frame))).is_ok()
    }

    /// Publish an update to a topic.
    ///
    /// Returns the number of local subscribers reached, or, with a backplane, the number of
    /// nodes the event was relayed to.
    pub async fn publish(&self, topic: Topic, envelope: &Envelope) -> AppResult<u64> {
        if let Some(backplane) = &self.backplane {
            let message = BackplaneMessage {
                topic: topic.to_string(),
                envelope: envelope.clone(),
            };
            return backplane.publish(&message).await;
        }
        let delivered = self.deliver_local(topic, envelope).await?;
        Ok(delivered as u64)
    }

    /// Push an envelope to this node's subscribers of `topic`. Dead sockets are pruned.
    pub async fn deliver_local(&self, topic: Topic, envelope: &Envelope) -> AppResult<usize> {
        let text = envelope.to_json()?;
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().await;
            if let Some(members) = registry.topics.get(&topic) {
                for id in members {
                    let sent = registry
                        .connections
                        .get(id)
                        .map(|record| record.sender.send(Message::Text(text.clone())).is_ok())
                        .unwrap_or(false);
                    if sent {
                        delivered += 1;
                    } else {
                        dead.push(id.clone());
                    }
                }
            }
        }
        for id in &dead {
            warn!(connection_id = %id, topic = %topic, "pruning closed connection");
            self.remove_connection(id).await;
        }
        info!(topic = %topic, event = %envelope.kind, delivered, "published");
        Ok(delivered)
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .read()
            .await
            .topics
            .get(&topic)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub async fn subscribers(&self, topic: Topic) -> Vec<ConnectionId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<ConnectionId> = registry
            .topics
            .get(&topic)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn topics_of(&self, id: &str) -> Vec<Topic> {
        let registry = self.registry.read().await;
        let mut topics: Vec<Topic> = registry
            .connections
            .get(id)
            .map(|r| r.topics.iter().copied().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Topics that currently have at least one subscriber.
    pub async fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.registry.read().await.topics.keys().copied().collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageType, TripStatus, TripUpdate};

    fn trip_update(trip_id: i64) -> Envelope {
        Envelope::new(
            MessageType::TripUpdate,
            &TripUpdate {
                trip_id,
                status: TripStatus::InProgress,
                timestamp: 1,
            },
        )
        .unwrap()
    }

    async fn connect(dispatcher: &Dispatcher, id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.register(id, tx, None).await;
        rx
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut a = connect(&dispatcher, "a").await;
        let mut b = connect(&dispatcher, "b").await;
        assert!(dispatcher.subscribe("a", Topic::Trip(42)).await);
        assert!(dispatcher.subscribe("b", Topic::Trip(43)).await);

        let delivered = dispatcher.publish(Topic::Trip(42), &trip_update(42)).await.unwrap();
        assert_eq!(delivered, 1);

        match a.try_recv() {
            Ok(Message::Text(text)) => {
                let env = Envelope::parse(&text).unwrap();
                assert_eq!(env.message_type(), Some(MessageType::TripUpdate));
            }
            other => panic!("expected text frame, got {:?}", other),
        }
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_requires_registered_connection() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.subscribe("ghost", Topic::Trip(1)).await);
        assert_eq!(dispatcher.subscriber_count(Topic::Trip(1)).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_membership() {
        let dispatcher = Dispatcher::new();
        let mut a = connect(&dispatcher, "a").await;
        dispatcher.subscribe("a", Topic::Reservations(7)).await;
        assert!(dispatcher.unsubscribe("a", Topic::Reservations(7)).await);
        assert!(!dispatcher.unsubscribe("a", Topic::Reservations(7)).await);

        let delivered = dispatcher
            .publish(Topic::Reservations(7), &Envelope::error("x"))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(a.try_recv().is_err());
        assert!(dispatcher.active_topics().await.is_empty());
    }

    #[tokio::test]
    async fn remove_connection_clears_every_topic() {
        let dispatcher = Dispatcher::new();
        let _a = connect(&dispatcher, "a").await;
        let _b = connect(&dispatcher, "b").await;
        dispatcher.subscribe("a", Topic::Trip(42)).await;
        dispatcher.subscribe("a", Topic::Reservations(7)).await;
        dispatcher.subscribe("a", Topic::Location(7)).await;
        dispatcher.subscribe("b", Topic::Trip(42)).await;

        assert_eq!(dispatcher.remove_connection("a").await, 3);
        assert_eq!(dispatcher.subscriber_count(Topic::Trip(42)).await, 1);
        assert_eq!(dispatcher.active_topics().await, vec![Topic::Trip(42)]);
        assert_eq!(dispatcher.connection_count().await, 1);
        assert!(dispatcher.topics_of("a").await.is_empty());
        assert_eq!(dispatcher.remove_connection("a").await, 0);
    }

    #[tokio::test]
    async fn dead_sockets_are_pruned_on_publish() {
        let dispatcher = Dispatcher::new();
        let rx = connect(&dispatcher, "a").await;
        dispatcher.subscribe("a", Topic::Location(7)).await;
        drop(rx);

        let delivered = dispatcher
            .publish(Topic::Location(7), &Envelope::error("x"))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(dispatcher.connection_count().await, 0);
        assert_eq!(dispatcher.subscriber_count(Topic::Location(7)).await, 0);
    }

    #[tokio::test]
    async fn close_connection_sends_close_frame() {
        let dispatcher = Dispatcher::new();
        let mut rx = connect(&dispatcher, "a").await;
        assert!(dispatcher.close_connection("a", "maintenance").await);
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(_)))));
        assert!(!dispatcher.close_connection("ghost", "x").await);
    }
}
