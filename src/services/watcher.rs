//! Periodic push: trip status changes for watched trips and reservation counts for subscribed drivers.
//!
//! With a backplane, trip changes go out once from the node whose poll saw them; the relay
//! marks them published on every other node. Reservation counts are computed per node for
//! that node's own subscribers and never relayed.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use crate::db::FleetStore;
use crate::error::AppResult;
use crate::models::{Envelope, MessageType, ReservationUpdate, Topic, TripStatus, TripUpdate};
use crate::repositories::BackplaneMessage;

#[derive(Clone)]
pub struct TripWatcher {
    store: Arc<dyn FleetStore>,
    dispatcher: Dispatcher,
    /// trip_id -> last status published (or seen at watch time).
    trips: Arc<RwLock<HashMap<i64, TripStatus>>>,
    /// driver_id -> last reservation count published.
    reservation_counts: Arc<RwLock<HashMap<i64, i64>>>,
}

impl TripWatcher {
    pub fn new(store: Arc<dyn FleetStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            trips: Arc::new(RwLock::new(HashMap::new())),
            reservation_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start watching a trip whose current status is `status`. Terminal trips are not watched.
    pub async fn watch(&self, trip_id: i64, status: TripStatus) -> bool {
        if status.is_terminal() {
            return false;
        }
        self.trips.write().await.insert(trip_id, status);
        info!(trip_id, status = %status, "watching trip");
        true
    }

    pub async fn is_watching(&self, trip_id: i64) -> bool {
        self.trips.read().await.contains_key(&trip_id)
    }

    /// Record a status already published elsewhere, so the next poll does not repeat it.
    pub async fn note_published(&self, trip_id: i64, status: TripStatus) {
        let mut trips = self.trips.write().await;
        if status.is_terminal() {
            trips.remove(&trip_id);
        } else if let Some(seen) = trips.get_mut(&trip_id) {
            *seen = status;
        }
    }

    /// One pass over watched trips and subscribed reservation topics. Returns events published.
    pub async fn poll_once(&self) -> AppResult<usize> {
        let mut published = 0;

        let watched: Vec<(i64, TripStatus)> = self
            .trips
            .read()
            .await
            .iter()
            .map(|(id, status)| (*id, *status))
            .collect();
        for (trip_id, last) in watched {
            let current = match self.store.trip_status(trip_id).await? {
                Some(status) => status,
                None => {
                    warn!(trip_id, "watched trip disappeared from store");
                    self.trips.write().await.remove(&trip_id);
                    continue;
                }
            };
            if current == last {
                continue;
            }
            let envelope = trip_update_envelope(trip_id, current)?;
            self.dispatcher.publish(Topic::Trip(trip_id), &envelope).await?;
            self.note_published(trip_id, current).await;
            published += 1;
        }

        let drivers: Vec<i64> = self
            .dispatcher
            .active_topics()
            .await
            .into_iter()
            .filter_map(|topic| match topic {
                Topic::Reservations(driver_id) => Some(driver_id),
                _ => None,
            })
            .collect();
        for driver_id in drivers {
            let count = self.store.reservation_count(driver_id).await?;
            let changed = self.reservation_counts.write().await.insert(driver_id, count) != Some(count);
            if !changed {
                continue;
            }
            let envelope = Envelope::new(
                MessageType::ReservationUpdate,
                &ReservationUpdate {
                    driver_id,
                    reservation_count: count,
                },
            )?;
            self.dispatcher
                .deliver_local(Topic::Reservations(driver_id), &envelope)
                .await?;
            published += 1;
        }

        debug!(published, "watcher pass complete");
        Ok(published)
    }

    /// Run `poll_once` forever at `interval`. Errors are logged and the loop continues.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    warn!(error = %e, "watcher pass failed");
                }
            }
        })
    }

    /// Deliver relayed events to this node's sockets.
    ///
    /// A relayed `trip_update` is recorded before delivery, so this node's next poll
    /// does not publish the same change again.
    pub fn spawn_backplane_listener(
        &self,
        mut rx: broadcast::Receiver<BackplaneMessage>,
    ) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => watcher.relay(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "backplane listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn relay(&self, message: BackplaneMessage) {
        let Ok(topic) = message.topic.parse::<Topic>() else {
            warn!(topic = %message.topic, "backplane message for unknown topic");
            return;
        };
        if message.envelope.message_type() == Some(MessageType::TripUpdate) {
            if let Ok(update) = message.envelope.payload_as::<TripUpdate>() {
                self.note_published(update.trip_id, update.status).await;
            }
        }
        if let Err(e) = self.dispatcher.deliver_local(topic, &message.envelope).await {
            warn!(error = %e, "backplane delivery failed");
        }
    }
}

pub fn trip_update_envelope(trip_id: i64, status: TripStatus) -> AppResult<Envelope> {
    Ok(Envelope::new(
        MessageType::TripUpdate,
        &TripUpdate {
            trip_id,
            status,
            timestamp: Utc::now().timestamp_millis(),
        },
    )?)
}
