//! Client side of the broker: a reconnecting socket, callback routing by message type,
//! the process-wide [`Broker`] facade and the trip dashboard contract built on top of it.

pub mod broker;
pub mod connection;
pub mod dashboard;
pub mod handler;

pub use broker::{Broker, BrokerRegistry};
pub use connection::{Connection, ConnectionEvent, SocketHandle};
pub use dashboard::{toast_for_status, SubscriptionPhase, Toast, ToastLevel, TripMonitor, TripView};
pub use handler::{CallbackRegistry, MessageHandler, Subscription};
