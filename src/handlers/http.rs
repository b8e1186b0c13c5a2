//! HTTP handlers: webhook registration, on-event publish triggers, health.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::auth::JwtSecret;
use crate::db::FleetStore;
use crate::error::AppError;
use crate::models::{Envelope, LocationUpdate, MessageType, Topic, TripStatus, TripUpdate};
use crate::services::watcher::trip_update_envelope;
use crate::services::{Dispatcher, Notifier, TripWatcher};

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub app_key: String,
    pub dispatcher: Dispatcher,
    pub watcher: TripWatcher,
    pub store: Arc<dyn FleetStore>,
    pub notifier: Arc<dyn Notifier>,
    pub identity: Option<JwtSecret>,
}

impl AppState {
    pub fn new(
        app_key: String,
        dispatcher: Dispatcher,
        store: Arc<dyn FleetStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let watcher = TripWatcher::new(store.clone(), dispatcher.clone());
        Self {
            app_key,
            dispatcher,
            watcher,
            store,
            notifier,
            identity: None,
        }
    }

    pub fn with_identity(mut self, secret: JwtSecret) -> Self {
        self.identity = Some(secret);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
    pub fn store(&self) -> &dyn FleetStore {
        self.store.as_ref()
    }
}

const HEADER_APP_KEY: &str = "x-app-key";

fn require_app_key(headers: &HeaderMap, app_key: &str) -> Result<(), AppError> {
    let key = headers
        .get(HEADER_APP_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if key.is_empty() || key != app_key {
        return Err(AppError::Auth("invalid or missing x-app-key".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TripWebhookRequest {
    #[validate(range(min = 1))]
    pub trip_id: i64,
}

/// POST /api/setup-trip-webhook — register server-side interest in a trip's status.
pub async fn setup_trip_webhook(
    State(state): State<AppState>,
    Json(body): Json<TripWebhookRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    body.validate()?;
    let status = state
        .store()
        .trip_status(body.trip_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {}", body.trip_id)))?;
    let watching = state.watcher.watch(body.trip_id, status).await;

    Ok(Json(json!({
        "ok": true,
        "tripId": body.trip_id,
        "status": status,
        "watching": watching
    })))
}

/// POST /api/broadcast — publish an update envelope to the topic its payload names.
/// Requires header: x-app-key.
pub async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_app_key(&headers, &state.app_key)?;

    let kind = envelope
        .message_type()
        .filter(MessageType::is_update)
        .ok_or_else(|| AppError::Validation(format!("not an update type: {}", envelope.kind)))?;
    let topic = Topic::for_update(&envelope)
        .ok_or_else(|| AppError::InvalidTopic(format!("{} payload names no topic", kind)))?;
    if kind == MessageType::TripUpdate {
        let update: TripUpdate = envelope.payload_as()?;
        state.watcher.note_published(update.trip_id, update.status).await;
    }

    let count = state.dispatcher().publish(topic, &envelope).await?;

    Ok(Json(json!({
        "ok": true,
        "topic": topic.to_string(),
        "type": kind.as_str(),
        "subscriber_count": count
    })))
}

#[derive(Debug, Deserialize)]
pub struct TripStatusRequest {
    pub status: TripStatus,
}

/// POST /api/trips/:id/status — persist a status change and push it to the trip's subscribers.
/// Requires header: x-app-key.
pub async fn update_trip_status(
    State(state): State<AppState>,
    Path(trip_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<TripStatusRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_app_key(&headers, &state.app_key)?;

    if !state.store().set_trip_status(trip_id, body.status).await? {
        return Err(AppError::NotFound(format!("trip {}", trip_id)));
    }
    let envelope = trip_update_envelope(trip_id, body.status)?;
    let count = state.dispatcher().publish(Topic::Trip(trip_id), &envelope).await?;
    state.watcher.note_published(trip_id, body.status).await;
    info!(trip_id, status = %body.status, count, "trip status changed");

    Ok(Json(json!({
        "ok": true,
        "tripId": trip_id,
        "status": body.status,
        "subscriber_count": count
    })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LocationRequest {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

/// POST /api/drivers/:id/location — push a location ping to the driver's location subscribers.
/// Requires header: x-app-key.
pub async fn update_driver_location(
    State(state): State<AppState>,
    Path(driver_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<LocationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_app_key(&headers, &state.app_key)?;
    body.validate()?;

    let envelope = Envelope::new(
        MessageType::LocationUpdate,
        &LocationUpdate {
            driver_id,
            latitude: body.latitude,
            longitude: body.longitude,
        },
    )?;
    let count = state
        .dispatcher()
        .publish(Topic::Location(driver_id), &envelope)
        .await?;

    Ok(Json(json!({
        "ok": true,
        "driverId": driver_id,
        "subscriber_count": count
    })))
}

/// GET /health — liveness probe.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let connections = state.dispatcher().connection_count().await;
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "fleetcast", "connections": connections })),
    )
}
