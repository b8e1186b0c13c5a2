//! Outbound notification delivery (external service): `{data, recipients}`, fire-and-forget.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Bound on one delivery request, connect through response.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub data: serde_json::Value,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> AppResult<()>;
}

/// Used when no delivery service is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> AppResult<()> {
        info!(
            recipients = notification.recipients.len(),
            data = %notification.data,
            "notification (log only)"
        );
        Ok(())
    }
}

/// POSTs the notification as JSON to the delivery service.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> AppResult<Self> {
        Self::with_timeout(url, NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("notification client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| AppError::Notify(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::Notify(format!(
                "delivery service answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Deliver in the background; failures are only logged.
pub fn notify_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    if notification.recipients.is_empty() {
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            warn!(error = %e, "notification delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, notification: &Notification) -> AppResult<()> {
            self.seen.lock().push(notification.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn detached_delivery_skips_empty_recipient_lists() {
        let recording = Arc::new(Recording::default());
        notify_detached(
            recording.clone(),
            Notification {
                data: json!({}),
                recipients: vec![],
            },
        );
        notify_detached(
            recording.clone(),
            Notification {
                data: json!({ "status": "offline" }),
                recipients: vec!["ana".to_string()],
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = recording.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].recipients, vec!["ana".to_string()]);
    }

    #[tokio::test]
    async fn log_notifier_accepts_everything() {
        tokio_test::assert_ok!(
            LogNotifier
                .notify(&Notification {
                    data: json!({ "x": 1 }),
                    recipients: vec!["a".to_string()],
                })
                .await
        );
    }

    #[tokio::test]
    async fn http_notifier_reports_unreachable_service() {
        let notifier = HttpNotifier::new("http://127.0.0.1:9/notify").unwrap();
        let result = notifier
            .notify(&Notification {
                data: json!({}),
                recipients: vec!["a".to_string()],
            })
            .await;
        assert!(matches!(result, Err(AppError::Notify(_))));
    }

    #[tokio::test]
    async fn http_notifier_gives_up_on_a_stalled_service() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let notifier =
            HttpNotifier::with_timeout(format!("http://{}/notify", addr), Duration::from_millis(200))
                .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.notify(&Notification {
                data: json!({ "status": "offline" }),
                recipients: vec!["ana".to_string()],
            }),
        )
        .await
        .expect("notify must not hang on a stalled service");
        assert!(matches!(result, Err(AppError::Notify(_))));
    }
}
