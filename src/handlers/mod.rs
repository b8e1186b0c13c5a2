//! Axum handlers: the `/ws` socket endpoint and the `/api` publish triggers.

pub mod http;
pub mod ws;

pub use http::{
    broadcast, health, setup_trip_webhook, update_driver_location, update_trip_status, AppState,
};
pub use ws::ws_handler;
