//! Subscription topics and their naming conventions.

use std::fmt;
use std::str::FromStr;

use super::envelope::{id_field, Envelope, MessageType};

/// Derived routing key: `trip:<id>`, `reservations:<driverId>`, `location:<driverId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Trip(i64),
    Reservations(i64),
    Location(i64),
}

/// Whether an intent adds or removes the sender from a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl Topic {
    /// Map a `subscribe_*` / `unsubscribe_*` envelope to its action and topic.
    ///
    /// `None` when the envelope is not an intent or lacks the id it needs.
    pub fn from_intent(envelope: &Envelope) -> Option<(SubscriptionAction, Topic)> {
        use SubscriptionAction::{Subscribe, Unsubscribe};
        let payload = &envelope.payload;
        match envelope.message_type()? {
            MessageType::SubscribeTrip => Some((Subscribe, Topic::Trip(id_field(payload, "tripId")?))),
            MessageType::UnsubscribeTrip => {
                Some((Unsubscribe, Topic::Trip(id_field(payload, "tripId")?)))
            }
            MessageType::SubscribeReservations => Some((
                Subscribe,
                Topic::Reservations(id_field(payload, "driverId")?),
            )),
            MessageType::UnsubscribeReservations => Some((
                Unsubscribe,
                Topic::Reservations(id_field(payload, "driverId")?),
            )),
            MessageType::SubscribeLocation => {
                Some((Subscribe, Topic::Location(id_field(payload, "driverId")?)))
            }
            MessageType::UnsubscribeLocation => {
                Some((Unsubscribe, Topic::Location(id_field(payload, "driverId")?)))
            }
            _ => None,
        }
    }

    /// Topic an update event is routed to.
    pub fn for_update(envelope: &Envelope) -> Option<Topic> {
        let payload = &envelope.payload;
        match envelope.message_type()? {
            MessageType::TripUpdate => Some(Topic::Trip(id_field(payload, "tripId")?)),
            MessageType::ReservationUpdate => {
                Some(Topic::Reservations(id_field(payload, "driverId")?))
            }
            MessageType::LocationUpdate => Some(Topic::Location(id_field(payload, "driverId")?)),
            _ => None,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Topic::Trip(id) | Topic::Reservations(id) | Topic::Location(id) => *id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Trip(id) => write!(f, "trip:{}", id),
            Topic::Reservations(id) => write!(f, "reservations:{}", id),
            Topic::Location(id) => write!(f, "location:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s.split_once(':').ok_or_else(|| s.to_string())?;
        let id: i64 = id.parse().map_err(|_| s.to_string())?;
        match prefix {
            "trip" => Ok(Topic::Trip(id)),
            "reservations" => Ok(Topic::Reservations(id)),
            "location" => Ok(Topic::Location(id)),
            _ => Err(s.to_string()),
        }
    }
}
