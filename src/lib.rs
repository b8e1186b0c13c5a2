//! Real-time trip and fleet update broker.
//!
//! Server side: a WebSocket dispatcher that keeps per-topic subscriber sets
//! (`trip:<id>`, `reservations:<driverId>`, `location:<driverId>`) and fans
//! updates out to exactly the subscribed sockets. Client side: a reconnecting
//! [`client::Connection`], a callback-routing [`client::MessageHandler`] and the
//! [`client::Broker`] facade dashboards talk to.

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::{BrokerConfig, Config};
pub use error::{AppError, BrokerError};
pub use handlers::http::AppState;
pub use services::Dispatcher;

use axum::routing::{get, post};
use handlers::http;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router (ws, publish triggers, webhook, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let api_routes = axum::Router::new()
        .route("/setup-trip-webhook", post(http::setup_trip_webhook))
        .route("/broadcast", post(http::broadcast))
        .route("/trips/:id/status", post(http::update_trip_status))
        .route("/drivers/:id/location", post(http::update_driver_location));

    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(http::health))
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
