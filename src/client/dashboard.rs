//! Trip dashboard contract: what a screen watching one trip does on mount and unmount,
//! and how it reacts to updates.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::broker::Broker;
use crate::client::handler::Subscription;
use crate::models::{LocationUpdate, MessageType, ReservationUpdate, TripStatus, TripUpdate};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Success,
    Error,
    Info,
    Warning,
}

/// Transient user notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    pub fn new(level: ToastLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

pub fn toast_for_status(status: TripStatus) -> Toast {
    match status {
        TripStatus::Completed => Toast::new(ToastLevel::Success, "Trip completed"),
        TripStatus::Cancelled => Toast::new(ToastLevel::Error, "Trip cancelled"),
        other => Toast::new(ToastLevel::Info, format!("Trip status: {}", other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionPhase {
    #[default]
    Idle,
    /// Subscribe intents sent, no relevant update seen yet.
    Subscribing,
    Subscribed,
    Unsubscribed,
}

/// Local view state of the watched trip. Stale values are kept while disconnected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TripView {
    pub phase: SubscriptionPhase,
    pub status: Option<TripStatus>,
    /// Timestamp of the last applied trip update, in ms.
    pub last_update: Option<i64>,
    pub reservation_count: Option<i64>,
    pub location: Option<(f64, f64)>,
    pub connected: bool,
    pub reconnect_exhausted: bool,
}

impl TripView {
    fn finished(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

#[derive(Clone)]
struct Shared {
    trip_id: i64,
    driver_id: i64,
    view: Arc<Mutex<TripView>>,
    toasts: mpsc::UnboundedSender<Toast>,
}

impl Shared {
    fn toast(&self, toast: Toast) {
        let _ = self.toasts.send(toast);
    }

    fn on_trip_update(&self, payload: &Value) {
        let update: TripUpdate = match serde_json::from_value(payload.clone()) {
            Ok(update) => update,
            Err(e) => {
                debug!(error = %e, "ignoring unreadable trip update");
                return;
            }
        };
        if update.trip_id != self.trip_id {
            return;
        }
        {
            let mut view = self.view.lock();
            if view.finished() {
                return;
            }
            view.status = Some(update.status);
            view.last_update = Some(update.timestamp);
            view.phase = SubscriptionPhase::Subscribed;
        }
        info!(trip_id = self.trip_id, status = %update.status, "trip status changed");
        self.toast(toast_for_status(update.status));
    }

    fn on_reservation_update(&self, payload: &Value) {
        let Ok(update) = serde_json::from_value::<ReservationUpdate>(payload.clone()) else {
            return;
        };
        if update.driver_id != self.driver_id {
            return;
        }
        {
            let mut view = self.view.lock();
            if view.finished() {
                return;
            }
            view.reservation_count = Some(update.reservation_count);
            view.phase = SubscriptionPhase::Subscribed;
        }
        self.toast(Toast::new(
            ToastLevel::Info,
            format!("Reservations: {}", update.reservation_count),
        ));
    }

    fn on_location_update(&self, payload: &Value) {
        let Ok(update) = serde_json::from_value::<LocationUpdate>(payload.clone()) else {
            return;
        };
        if update.driver_id != self.driver_id {
            return;
        }
        let mut view = self.view.lock();
        if view.finished() {
            return;
        }
        view.location = Some((update.latitude, update.longitude));
        view.phase = SubscriptionPhase::Subscribed;
    }
}

/// Watches one trip and its driver for the lifetime of a screen.
///
/// `mount` subscribes, `unmount` (or drop) unsubscribes and disconnects the broker.
pub struct TripMonitor {
    broker: Arc<Broker>,
    shared: Shared,
    poll_interval: Duration,
    subscriptions: Vec<Subscription>,
    indicator: Option<JoinHandle<()>>,
    mounted: bool,
}

impl TripMonitor {
    pub fn new(
        broker: Arc<Broker>,
        trip_id: i64,
        driver_id: i64,
    ) -> (Self, mpsc::UnboundedReceiver<Toast>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            broker,
            shared: Shared {
                trip_id,
                driver_id,
                view: Arc::new(Mutex::new(TripView::default())),
                toasts: tx,
            },
            poll_interval: DEFAULT_POLL_INTERVAL,
            subscriptions: Vec::new(),
            indicator: None,
            mounted: false,
        };
        (monitor, rx)
    }

    /// Period of the connection indicator poll.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn view(&self) -> TripView {
        self.shared.view.lock().clone()
    }

    pub fn trip_id(&self) -> i64 {
        self.shared.trip_id
    }

    pub fn driver_id(&self) -> i64 {
        self.shared.driver_id
    }

    pub async fn mount(&mut self) {
        if self.mounted {
            return;
        }
        self.mounted = true;
        let (trip_id, driver_id) = (self.shared.trip_id, self.shared.driver_id);

        self.broker.initialize().await;

        if let Err(e) = self.broker.setup_trip_webhook(trip_id).await {
            warn!(trip_id, error = %e, "trip webhook setup failed");
            self.shared.toast(Toast::new(
                ToastLevel::Warning,
                format!("Live trip tracking may be delayed: {}", e),
            ));
        }

        let shared = self.shared.clone();
        self.subscriptions.push(
            self.broker
                .subscribe(MessageType::TripUpdate.as_str(), move |p| shared.on_trip_update(p)),
        );
        let shared = self.shared.clone();
        self.subscriptions.push(self.broker.subscribe(
            MessageType::ReservationUpdate.as_str(),
            move |p| shared.on_reservation_update(p),
        ));
        let shared = self.shared.clone();
        self.subscriptions.push(self.broker.subscribe(
            MessageType::LocationUpdate.as_str(),
            move |p| shared.on_location_update(p),
        ));

        send_subscribes(&self.broker, trip_id, driver_id);
        {
            let mut view = self.shared.view.lock();
            view.phase = SubscriptionPhase::Subscribing;
            view.connected = self.broker.is_connected();
        }

        let broker = Arc::downgrade(&self.broker);
        self.subscriptions.push(self.broker.on_reconnect(move || {
            if let Some(broker) = broker.upgrade() {
                debug!(trip_id, driver_id, "resubscribing after reconnect");
                send_subscribes(&broker, trip_id, driver_id);
            }
        }));

        self.indicator = Some(spawn_indicator(
            self.broker.clone(),
            self.shared.clone(),
            self.poll_interval,
        ));
    }

    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        let (trip_id, driver_id) = (self.shared.trip_id, self.shared.driver_id);

        self.broker.unsubscribe_from_trip(trip_id);
        self.broker.unsubscribe_from_reservations(driver_id);
        self.broker.unsubscribe_from_location(driver_id);
        for mut subscription in self.subscriptions.drain(..) {
            subscription.close();
        }
        if let Some(task) = self.indicator.take() {
            task.abort();
        }
        self.broker.disconnect();
        self.shared.view.lock().phase = SubscriptionPhase::Unsubscribed;
        debug!(trip_id, driver_id, "trip monitor unmounted");
    }
}

impl Drop for TripMonitor {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn send_subscribes(broker: &Broker, trip_id: i64, driver_id: i64) {
    broker.subscribe_to_trip(trip_id);
    broker.subscribe_to_reservations(driver_id);
    broker.subscribe_to_location(driver_id);
}

/// Poll the connection state and surface transitions as toasts.
fn spawn_indicator(broker: Arc<Broker>, shared: Shared, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let connected = broker.is_connected();
            let exhausted = broker.connection().reconnect_exhausted();
            let (was_connected, was_exhausted) = {
                let mut view = shared.view.lock();
                let previous = (view.connected, view.reconnect_exhausted);
                view.connected = connected;
                view.reconnect_exhausted = exhausted;
                previous
            };

            if connected && !was_connected {
                shared.toast(Toast::new(ToastLevel::Success, "Connected"));
            } else if !connected && was_connected {
                shared.toast(Toast::new(ToastLevel::Warning, "Connection lost, reconnecting..."));
            }
            if exhausted && !was_exhausted {
                shared.toast(Toast::new(
                    ToastLevel::Error,
                    "Disconnected. Live updates are unavailable.",
                ));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    /// Broker pointed at a port nobody listens on; mount completes offline.
    fn offline_broker() -> Arc<Broker> {
        let port = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let config = BrokerConfig::new(format!("ws://127.0.0.1:{}", port))
            .with_reconnect(Duration::from_millis(20), 1);
        Arc::new(Broker::new(config).unwrap())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Toast>) -> Vec<Toast> {
        let mut toasts = Vec::new();
        while let Ok(toast) = rx.try_recv() {
            toasts.push(toast);
        }
        toasts
    }

    fn update_toasts(toasts: Vec<Toast>) -> Vec<Toast> {
        toasts
            .into_iter()
            .filter(|t| t.message.starts_with("Trip") || t.message.starts_with("Reservations"))
            .collect()
    }

    #[test]
    fn status_toasts() {
        assert_eq!(toast_for_status(TripStatus::Completed).level, ToastLevel::Success);
        assert_eq!(toast_for_status(TripStatus::Cancelled).level, ToastLevel::Error);
        assert_eq!(toast_for_status(TripStatus::InProgress).level, ToastLevel::Info);
        assert_eq!(toast_for_status(TripStatus::Scheduled).level, ToastLevel::Info);
    }

    #[tokio::test]
    async fn updates_for_other_trips_are_ignored() {
        let broker = offline_broker();
        let (mut monitor, mut toasts) = TripMonitor::new(broker.clone(), 42, 7);
        monitor.mount().await;
        assert_eq!(monitor.view().phase, SubscriptionPhase::Subscribing);
        drain(&mut toasts);

        broker.handler().dispatch_frame(
            r#"{"type":"trip_update","payload":{"tripId":43,"status":"completed","timestamp":5}}"#,
        );
        broker.handler().dispatch_frame(
            r#"{"type":"reservation_update","payload":{"driverId":8,"reservationCount":3}}"#,
        );
        let view = monitor.view();
        assert_eq!(view.status, None);
        assert_eq!(view.reservation_count, None);
        assert_eq!(view.phase, SubscriptionPhase::Subscribing);
        assert!(update_toasts(drain(&mut toasts)).is_empty());

        broker.handler().dispatch_frame(
            r#"{"type":"trip_update","payload":{"tripId":42,"status":"in_progress","timestamp":9}}"#,
        );
        let view = monitor.view();
        assert_eq!(view.status, Some(TripStatus::InProgress));
        assert_eq!(view.last_update, Some(9));
        assert_eq!(view.phase, SubscriptionPhase::Subscribed);
        assert_eq!(
            update_toasts(drain(&mut toasts)),
            vec![Toast::new(ToastLevel::Info, "Trip status: in_progress")]
        );
    }

    #[tokio::test]
    async fn reservation_update_sets_count_and_toasts() {
        let broker = offline_broker();
        let (mut monitor, mut toasts) = TripMonitor::new(broker.clone(), 42, 7);
        monitor.mount().await;
        drain(&mut toasts);

        broker.handler().dispatch_frame(
            r#"{"type":"reservation_update","payload":{"driverId":7,"reservationCount":12}}"#,
        );
        assert_eq!(monitor.view().reservation_count, Some(12));
        assert_eq!(
            update_toasts(drain(&mut toasts)),
            vec![Toast::new(ToastLevel::Info, "Reservations: 12")]
        );

        broker.handler().dispatch_frame(
            r#"{"type":"location_update","payload":{"driverId":7,"latitude":52.5,"longitude":13.4}}"#,
        );
        assert_eq!(monitor.view().location, Some((52.5, 13.4)));
    }

    #[tokio::test]
    async fn terminal_status_stops_reacting() {
        let broker = offline_broker();
        let (mut monitor, mut toasts) = TripMonitor::new(broker.clone(), 42, 7);
        monitor.mount().await;
        drain(&mut toasts);

        broker.handler().dispatch_frame(
            r#"{"type":"trip_update","payload":{"tripId":42,"status":"cancelled","timestamp":1}}"#,
        );
        broker.handler().dispatch_frame(
            r#"{"type":"trip_update","payload":{"tripId":42,"status":"in_progress","timestamp":2}}"#,
        );
        broker.handler().dispatch_frame(
            r#"{"type":"reservation_update","payload":{"driverId":7,"reservationCount":4}}"#,
        );

        let view = monitor.view();
        assert_eq!(view.status, Some(TripStatus::Cancelled));
        assert_eq!(view.last_update, Some(1));
        assert_eq!(view.reservation_count, None);
        assert_eq!(
            update_toasts(drain(&mut toasts)),
            vec![Toast::new(ToastLevel::Error, "Trip cancelled")]
        );
    }

    #[tokio::test]
    async fn webhook_failure_is_a_warning() {
        let broker = offline_broker();
        let (mut monitor, mut toasts) = TripMonitor::new(broker, 42, 7);
        monitor.mount().await;
        let toasts = drain(&mut toasts);
        assert!(toasts.iter().any(|t| t.level == ToastLevel::Warning));
        assert_eq!(monitor.view().phase, SubscriptionPhase::Subscribing);
    }

    #[tokio::test]
    async fn unmount_removes_callbacks() {
        let broker = offline_broker();
        let (mut monitor, _toasts) = TripMonitor::new(broker.clone(), 42, 7);
        monitor.mount().await;
        // One diagnostic logger plus the monitor's own callback.
        assert_eq!(broker.handler().callback_count("trip_update"), 2);

        monitor.unmount();
        assert_eq!(broker.handler().callback_count("trip_update"), 1);
        assert_eq!(broker.handler().callback_count("location_update"), 0);
        assert_eq!(monitor.view().phase, SubscriptionPhase::Unsubscribed);
        assert!(!broker.is_connected());
        monitor.unmount();
    }

    #[tokio::test]
    async fn exhausted_reconnects_raise_a_persistent_error() {
        let broker = offline_broker();
        let (monitor, mut toasts) = TripMonitor::new(broker.clone(), 42, 7);
        let mut monitor = monitor.with_poll_interval(Duration::from_millis(10));
        monitor.mount().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !monitor.view().reconnect_exhausted {
            assert!(tokio::time::Instant::now() < deadline, "reconnects never exhausted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let errors: Vec<Toast> = drain(&mut toasts)
            .into_iter()
            .filter(|t| t.level == ToastLevel::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(!monitor.view().connected);
    }
}
