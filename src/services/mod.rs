//! Dispatcher-side services: topic registry, periodic watcher, notification delivery.

pub mod dispatcher;
pub mod notifier;
pub mod watcher;

pub use dispatcher::{ConnectionSender, Dispatcher};
pub use notifier::{HttpNotifier, LogNotifier, Notification, Notifier};
pub use watcher::TripWatcher;
