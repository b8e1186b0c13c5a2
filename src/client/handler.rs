//! Routes inbound frames to callbacks registered per message type.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::client::connection::Connection;
use crate::config::BrokerConfig;
use crate::models::Envelope;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Removal side of a registry, type-erased so handles do not carry the argument type.
trait Deregister: Send + Sync {
    fn deregister(&self, key: &str, id: u64) -> bool;
}

/// Multimap of key to callbacks. Several callbacks per key coexist and run in
/// registration order.
pub struct CallbackRegistry<A> {
    callbacks: Mutex<HashMap<String, Vec<(u64, Callback<A>)>>>,
    next_id: AtomicU64,
}

impl<A: 'static> CallbackRegistry<A> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn register<F>(self: &Arc<Self>, key: &str, callback: F) -> Subscription
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        let registry: Weak<dyn Deregister> = Arc::downgrade(self) as Weak<dyn Deregister>;
        Subscription {
            key: key.to_string(),
            id,
            registry: Some(registry),
        }
    }

    /// Invoke every callback for `key`. Returns how many ran.
    ///
    /// Callbacks run outside the lock, so they may register or close handles themselves.
    /// A panicking callback is logged and does not stop the others.
    pub fn emit(&self, key: &str, arg: &A) -> usize {
        let snapshot: Vec<Callback<A>> = match self.callbacks.lock().get(key) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };
        for callback in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(arg))).is_err() {
                error!(key, "callback panicked");
            }
        }
        snapshot.len()
    }

    pub fn count(&self, key: &str) -> usize {
        self.callbacks.lock().get(key).map(Vec::len).unwrap_or(0)
    }
}

impl<A: 'static> Deregister for CallbackRegistry<A> {
    fn deregister(&self, key: &str, id: u64) -> bool {
        let mut callbacks = self.callbacks.lock();
        let Some(list) = callbacks.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(cb_id, _)| *cb_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            callbacks.remove(key);
        }
        removed
    }
}

/// Registration handle. The callback stays registered until [`Subscription::close`]
/// is called or the handle is dropped.
#[must_use = "dropping a Subscription deregisters its callback"]
pub struct Subscription {
    key: String,
    id: u64,
    registry: Option<Weak<dyn Deregister>>,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.key
    }

    /// Deregister now. Closing twice is harmless.
    pub fn close(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            if registry.deregister(&self.key, self.id) {
                trace!(event_type = %self.key, id = self.id, "callback deregistered");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.key)
            .field("id", &self.id)
            .field("active", &self.registry.is_some())
            .finish()
    }
}

/// Parse one frame and run the callbacks for its type. Malformed frames are logged and skipped.
fn dispatch(callbacks: &CallbackRegistry<Value>, text: &str) -> usize {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, frame_len = text.len(), "dropping malformed frame");
            return 0;
        }
    };
    let invoked = callbacks.emit(&envelope.kind, &envelope.payload);
    if invoked == 0 {
        debug!(event_type = %envelope.kind, "no callbacks for message type");
    }
    invoked
}

/// Owns a [`Connection`] and turns its inbound frames into callback invocations.
///
/// Frames are dispatched one at a time by a single task, so callbacks observe
/// the order the server sent them in.
pub struct MessageHandler {
    connection: Connection,
    callbacks: Arc<CallbackRegistry<Value>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageHandler {
    pub fn new(config: &BrokerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connection: Connection::new(config, tx),
            callbacks: CallbackRegistry::new(),
            inbound: Mutex::new(Some(rx)),
            dispatch_task: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Register `callback` for frames whose `type` equals `event_type`.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.callbacks.register(event_type, callback)
    }

    pub fn callback_count(&self, event_type: &str) -> usize {
        self.callbacks.count(event_type)
    }

    /// Serialize and hand to the connection. Fire-and-forget: `false` means the frame was dropped.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.connection.send(text),
            Err(e) => {
                warn!(event_type = %envelope.kind, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    /// Dispatch one raw frame as if it had arrived on the socket. Returns the number of callbacks run.
    pub fn dispatch_frame(&self, text: &str) -> usize {
        dispatch(&self.callbacks, text)
    }

    /// Start the dispatch task on first use, then connect.
    pub async fn connect(&self) {
        if let Some(mut rx) = self.inbound.lock().take() {
            let callbacks = self.callbacks.clone();
            let task = tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    dispatch(&callbacks, &text);
                }
                debug!("dispatch loop finished");
            });
            *self.dispatch_task.lock() = Some(task);
        }
        self.connection.connect().await;
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
    }
}
