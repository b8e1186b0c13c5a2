//! Error types: `AppError` for the dispatcher server, `BrokerError` for the client broker.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Server-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("JWT error: {0}")]
    Jwt(String),

    #[error("Notification delivery failed: {0}")]
    Notify(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<crate::config::ConfigLoadError> for AppError {
    fn from(e: crate::config::ConfigLoadError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Redis(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis error: {}", e),
            ),
            AppError::Db(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {}", e),
            ),
            AppError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid payload: {}", e),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidTopic(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Jwt(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Notify(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Client broker errors. Routine transport conditions (disconnects, malformed frames)
/// never surface here; they are logged and reflected through connection state.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("WebSocket URL is not configured")]
    MissingUrl,

    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid number in {name}: {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("API URL is not configured")]
    MissingApiUrl,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook setup rejected with status {status}")]
    WebhookRejected { status: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoadError;

    #[test]
    fn config_load_errors_become_config_errors() {
        let err: AppError = ConfigLoadError::InvalidNumber("POLL_INTERVAL_MS").into();
        assert!(matches!(&err, AppError::Config(msg) if msg == "Invalid number in POLL_INTERVAL_MS"));
        assert_eq!(err.to_string(), "Configuration error: Invalid number in POLL_INTERVAL_MS");
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
