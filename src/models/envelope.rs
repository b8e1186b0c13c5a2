//! Wire envelope `{ "type": .., "payload": {..} }` and the typed payloads it carries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// The fixed message vocabulary. Frames with any other `type` are ignored by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    SubscribeTrip,
    UnsubscribeTrip,
    SubscribeReservations,
    UnsubscribeReservations,
    SubscribeLocation,
    UnsubscribeLocation,
    TripUpdate,
    ReservationUpdate,
    LocationUpdate,
    StatusUpdate,
    Success,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::SubscribeTrip,
        MessageType::UnsubscribeTrip,
        MessageType::SubscribeReservations,
        MessageType::UnsubscribeReservations,
        MessageType::SubscribeLocation,
        MessageType::UnsubscribeLocation,
        MessageType::TripUpdate,
        MessageType::ReservationUpdate,
        MessageType::LocationUpdate,
        MessageType::StatusUpdate,
        MessageType::Success,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SubscribeTrip => "subscribe_trip",
            MessageType::UnsubscribeTrip => "unsubscribe_trip",
            MessageType::SubscribeReservations => "subscribe_reservations",
            MessageType::UnsubscribeReservations => "unsubscribe_reservations",
            MessageType::SubscribeLocation => "subscribe_location",
            MessageType::UnsubscribeLocation => "unsubscribe_location",
            MessageType::TripUpdate => "trip_update",
            MessageType::ReservationUpdate => "reservation_update",
            MessageType::LocationUpdate => "location_update",
            MessageType::StatusUpdate => "status_update",
            MessageType::Success => "success",
            MessageType::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == raw)
    }

    /// `subscribe_*` and `unsubscribe_*` requests.
    pub fn is_intent(&self) -> bool {
        matches!(
            self,
            MessageType::SubscribeTrip
                | MessageType::UnsubscribeTrip
                | MessageType::SubscribeReservations
                | MessageType::UnsubscribeReservations
                | MessageType::SubscribeLocation
                | MessageType::UnsubscribeLocation
        )
    }

    /// Update events pushed by the dispatcher to topic subscribers.
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            MessageType::TripUpdate | MessageType::ReservationUpdate | MessageType::LocationUpdate
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of wire communication.
///
/// `kind` stays a plain string so that frames with types this build does not know
/// still decode and can be skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_payload", deserialize_with = "payload_or_empty")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// `null` reads as `{}`; any other non-object payload makes the frame malformed.
fn payload_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(empty_payload()),
        value @ Value::Object(_) => Ok(value),
        _ => Err(serde::de::Error::custom("payload must be a JSON object")),
    }
}

impl Envelope {
    pub fn new<P: Serialize>(kind: MessageType, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn from_value(kind: MessageType, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `None` for types outside the vocabulary.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn success(message: impl Into<String>, topic: Option<String>) -> Self {
        let mut payload = json!({ "message": message.into() });
        if let Some(topic) = topic {
            payload["topic"] = Value::String(topic);
        }
        Self::from_value(MessageType::Success, payload)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::from_value(MessageType::Error, json!({ "message": message.into() }))
    }

    pub fn subscribe_trip(trip_id: i64) -> Self {
        Self::from_value(MessageType::SubscribeTrip, json!({ "tripId": trip_id }))
    }

    pub fn unsubscribe_trip(trip_id: i64) -> Self {
        Self::from_value(MessageType::UnsubscribeTrip, json!({ "tripId": trip_id }))
    }

    pub fn subscribe_reservations(driver_id: i64) -> Self {
        Self::from_value(MessageType::SubscribeReservations, json!({ "driverId": driver_id }))
    }

    pub fn unsubscribe_reservations(driver_id: i64) -> Self {
        Self::from_value(
            MessageType::UnsubscribeReservations,
            json!({ "driverId": driver_id }),
        )
    }

    pub fn subscribe_location(driver_id: i64) -> Self {
        Self::from_value(MessageType::SubscribeLocation, json!({ "driverId": driver_id }))
    }

    pub fn unsubscribe_location(driver_id: i64) -> Self {
        Self::from_value(MessageType::UnsubscribeLocation, json!({ "driverId": driver_id }))
    }
}

/// Lifecycle status of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "scheduled",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scheduled" => Some(TripStatus::Scheduled),
            "in_progress" => Some(TripStatus::InProgress),
            "completed" => Some(TripStatus::Completed),
            "cancelled" => Some(TripStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed and cancelled trips produce no further interesting updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripUpdate {
    pub trip_id: i64,
    pub status: TripStatus,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationUpdate {
    pub driver_id: i64,
    pub reservation_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub driver_id: i64,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Driver-initiated broadcast (offline, in transit, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: String,
    pub driver_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// Read an integer id field that may arrive as a number or a numeric string.
pub fn id_field(payload: &Value, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_names_are_stable() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::parse("driver_joined"), None);
        assert!(MessageType::TripUpdate.is_update());
        assert!(!MessageType::SubscribeTrip.is_update());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::subscribe_trip(42);
        let text = env.to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "type": "subscribe_trip", "payload": { "tripId": 42 } }));
    }

    #[test]
    fn envelope_tolerates_unknown_type_and_missing_payload() {
        let env = Envelope::parse(r#"{"type":"driver_joined"}"#).unwrap();
        assert_eq!(env.message_type(), None);
        assert_eq!(env.payload, json!({}));

        let env = Envelope::parse(r#"{"type":"success","payload":null}"#).unwrap();
        assert_eq!(env.message_type(), Some(MessageType::Success));
        assert_eq!(env.payload, json!({}));
    }

    #[test]
    fn envelope_rejects_frames_without_type() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn envelope_rejects_non_object_payloads() {
        for frame in [
            r#"{"type":"trip_update","payload":5}"#,
            r#"{"type":"trip_update","payload":"completed"}"#,
            r#"{"type":"subscribe_trip","payload":[42]}"#,
            r#"{"type":"success","payload":true}"#,
        ] {
            assert!(Envelope::parse(frame).is_err(), "{} should be malformed", frame);
        }
    }

    #[test]
    fn trip_update_uses_camel_case() {
        let update: TripUpdate = serde_json::from_value(json!({
            "tripId": 42, "status": "in_progress", "timestamp": 1700000000000i64
        }))
        .unwrap();
        assert_eq!(update.trip_id, 42);
        assert_eq!(update.status, TripStatus::InProgress);
        assert!(!update.status.is_terminal());
        assert!(TripStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_update_destination_is_optional() {
        let update: StatusUpdate =
            serde_json::from_value(json!({ "status": "offline", "driverId": 7 })).unwrap();
        assert_eq!(update.destination, None);
        let value = serde_json::to_value(&update).unwrap();
        assert!(value.get("destination").is_none());
    }

    #[test]
    fn id_field_accepts_numbers_and_numeric_strings() {
        assert_eq!(id_field(&json!({ "tripId": 42 }), "tripId"), Some(42));
        assert_eq!(id_field(&json!({ "tripId": "42" }), "tripId"), Some(42));
        assert_eq!(id_field(&json!({ "tripId": "x" }), "tripId"), None);
        assert_eq!(id_field(&json!({}), "tripId"), None);
    }
}
