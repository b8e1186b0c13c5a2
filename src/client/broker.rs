//! Process-wide facade over one [`MessageHandler`] and its [`Connection`].

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::connection::{Connection, ConnectionEvent};
use crate::client::handler::{CallbackRegistry, MessageHandler, Subscription};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::models::{Envelope, MessageType, StatusUpdate};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_KEY: &str = "reconnect";

pub struct Broker {
    config: BrokerConfig,
    handler: MessageHandler,
    http: reqwest::Client,
    reconnect_hooks: Arc<CallbackRegistry<()>>,
    diagnostics: Mutex<Option<Vec<Subscription>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Build a broker. Fails only on configuration that can never connect.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let http = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            handler: MessageHandler::new(&config),
            config,
            http,
            reconnect_hooks: CallbackRegistry::new(),
            diagnostics: Mutex::new(None),
            event_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn handler(&self) -> &MessageHandler {
        &self.handler
    }

    pub fn connection(&self) -> &Connection {
        self.handler.connection()
    }

    pub fn is_connected(&self) -> bool {
        self.handler.connection().is_connected()
    }

    /// Connect, installing the logging subscriptions and the reconnect watcher on first call.
    /// Calling again after [`Broker::disconnect`] reconnects.
    pub async fn initialize(&self) {
        self.install_diagnostics();
        self.spawn_event_watcher();
        info!(url = %self.config.url, "initializing broker");
        self.handler.connect().await;
    }

    fn install_diagnostics(&self) {
        let mut diagnostics = self.diagnostics.lock();
        if diagnostics.is_some() {
            return;
        }
        let subs = vec![
            self.handler.subscribe(MessageType::Success.as_str(), |payload: &Value| {
                info!(reply = %payload["message"], topic = %payload["topic"], "server ack");
            }),
            self.handler.subscribe(MessageType::Error.as_str(), |payload: &Value| {
                warn!(reply = %payload["message"], "server error");
            }),
            self.handler.subscribe(MessageType::TripUpdate.as_str(), |payload: &Value| {
                debug!(trip_id = %payload["tripId"], status = %payload["status"], "trip update");
            }),
            self.handler.subscribe(MessageType::ReservationUpdate.as_str(), |payload: &Value| {
                debug!(
                    driver_id = %payload["driverId"],
                    count = %payload["reservationCount"],
                    "reservation update"
                );
            }),
        ];
        *diagnostics = Some(subs);
    }

    fn spawn_event_watcher(&self) {
        let mut slot = self.event_task.lock();
        if slot.is_some() {
            return;
        }
        let mut events = self.connection().events();
        let hooks = self.reconnect_hooks.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Reconnected) => {
                        let ran = hooks.emit(RECONNECT_KEY, &());
                        info!(hooks = ran, "reconnected; subscriptions must be resent");
                    }
                    Ok(ConnectionEvent::GaveUp { attempts }) => {
                        warn!(attempts, "broker disconnected for good");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handler.subscribe(event_type, callback)
    }

    pub fn send(&self, envelope: &Envelope) -> bool {
        self.handler.send(envelope)
    }

    /// Run `callback` after every successful re-open. The server forgets a socket's
    /// topics when it closes, so this is where callers resend their subscribes.
    pub fn on_reconnect<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reconnect_hooks.register(RECONNECT_KEY, move |_: &()| callback())
    }

    pub fn subscribe_to_trip(&self, trip_id: i64) -> bool {
        self.send(&Envelope::subscribe_trip(trip_id))
    }

    pub fn unsubscribe_from_trip(&self, trip_id: i64) -> bool {
        self.send(&Envelope::unsubscribe_trip(trip_id))
    }

    pub fn subscribe_to_reservations(&self, driver_id: i64) -> bool {
        self.send(&Envelope::subscribe_reservations(driver_id))
    }

    pub fn unsubscribe_from_reservations(&self, driver_id: i64) -> bool {
        self.send(&Envelope::unsubscribe_reservations(driver_id))
    }

    pub fn subscribe_to_location(&self, driver_id: i64) -> bool {
        self.send(&Envelope::subscribe_location(driver_id))
    }

    pub fn unsubscribe_from_location(&self, driver_id: i64) -> bool {
        self.send(&Envelope::unsubscribe_location(driver_id))
    }

    /// Broadcast a driver status such as `offline` or `in_transit`.
    pub fn send_status_message(&self, status: &str, driver_id: i64, destination: Option<&str>) -> bool {
        let update = StatusUpdate {
            status: status.to_string(),
            driver_id,
            destination: destination.map(str::to_string),
        };
        match Envelope::new(MessageType::StatusUpdate, &update) {
            Ok(envelope) => self.send(&envelope),
            Err(e) => {
                warn!(driver_id, error = %e, "failed to encode status update");
                false
            }
        }
    }

    /// Ask the HTTP API to start watching a trip. Callers treat failure as a warning.
    pub async fn setup_trip_webhook(&self, trip_id: i64) -> Result<(), BrokerError> {
        let api = self
            .config
            .api_url
            .as_deref()
            .ok_or(BrokerError::MissingApiUrl)?;
        let url = format!("{}/api/setup-trip-webhook", api.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({ "tripId": trip_id }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::WebhookRejected {
                status: status.as_u16(),
            });
        }
        debug!(trip_id, "trip webhook registered");
        Ok(())
    }

    /// Close the socket. The broker stays usable; [`Broker::initialize`] reconnects it.
    pub fn disconnect(&self) {
        self.handler.disconnect();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }
}

/// Holder of the one broker a process uses.
///
/// The first configuration wins: later calls to [`BrokerRegistry::get_instance`] get the
/// existing broker whatever config they pass.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    slot: Arc<Mutex<Option<Arc<Broker>>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static BrokerRegistry {
        static GLOBAL: OnceLock<BrokerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BrokerRegistry::new)
    }

    pub fn get_instance(&self, config: BrokerConfig) -> Result<Arc<Broker>, BrokerError> {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.config() != &config {
                debug!(
                    active = %existing.config().url,
                    ignored = %config.url,
                    "broker already created; ignoring new config"
                );
            }
            return Ok(existing.clone());
        }
        let broker = Arc::new(Broker::new(config)?);
        *slot = Some(broker.clone());
        Ok(broker)
    }

    pub fn current(&self) -> Option<Arc<Broker>> {
        self.slot.lock().clone()
    }

    /// Disconnect and forget the current broker; the next `get_instance` builds a fresh one.
    pub fn reset(&self) {
        if let Some(broker) = self.slot.lock().take() {
            broker.disconnect();
        }
    }
}
