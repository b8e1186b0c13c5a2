//! One WebSocket to one URL, with fixed-interval reconnection up to a cap.
//!
//! A background task owns the socket. Outbound frames go through an unbounded queue
//! that only exists while the socket is open; frames sent while disconnected are
//! dropped, never buffered. Inbound text frames are forwarded, in order, to the
//! channel given at construction.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle notifications; the open/close/error hooks of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Open on the very first attempt after `connect()`.
    Opened,
    /// Any later open: after an unexpected close, or after the first attempt failed.
    /// Frames sent before it were dropped, and the server holds no subscriptions for
    /// the new socket.
    Reconnected,
    Closed,
    Error(String),
    Reconnecting { attempt: u32 },
    GaveUp { attempts: u32 },
}

/// Low-level handle to the currently open socket.
#[derive(Clone)]
pub struct SocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    generation: u64,
}

impl SocketHandle {
    /// Queue a raw frame on this socket. `false` once the socket is gone.
    pub fn send_raw(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Increments on every successful open, so handles from before a reconnect can be told apart.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Live {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

struct Run {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    url: String,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    connect_timeout: Duration,
    inbound: mpsc::UnboundedSender<String>,
    live: Mutex<Option<Live>>,
    run: Mutex<Option<Run>>,
    generation: AtomicU64,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn clear_live(&self, generation: u64) {
        let mut live = self.live.lock();
        if live.as_ref().map(|l| l.generation) == Some(generation) {
            *live = None;
        }
    }
}

pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(config: &BrokerConfig, inbound: mpsc::UnboundedSender<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                url: config.url.clone(),
                reconnect_interval: config.reconnect_interval,
                max_reconnect_attempts: config.max_reconnect_attempts,
                connect_timeout: config.connect_timeout,
                inbound,
                live: Mutex::new(None),
                run: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Open the socket and wait for the first attempt to finish.
    ///
    /// Never fails: a refused or broken connection is logged and handed to the reconnect
    /// loop. Check [`Connection::is_connected`] afterwards. No-op while the socket task is
    /// running; after reconnects were exhausted it starts over.
    pub async fn connect(&self) {
        let ready = {
            let mut run = self.shared.run.lock();
            if run.as_ref().map(|r| !r.task.is_finished()).unwrap_or(false) {
                return;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            self.shared.attempts.store(0, Ordering::SeqCst);
            self.shared.exhausted.store(false, Ordering::SeqCst);
            let task = tokio::spawn(run_socket(self.shared.clone(), shutdown_rx, ready_tx));
            *run = Some(Run {
                shutdown: shutdown_tx,
                task,
            });
            ready_rx
        };
        let _ = ready.await;
    }

    /// Close the socket and cancel any pending reconnect. Frames already queued are flushed
    /// before the close frame. Idempotent.
    pub fn disconnect(&self) {
        let run = self.shared.run.lock().take();
        if let Some(run) = run {
            let _ = run.shutdown.send(true);
            info!(url = %self.shared.url, "disconnecting");
        }
        self.shared.live.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .live
            .lock()
            .as_ref()
            .map(|live| !live.outbound.is_closed())
            .unwrap_or(false)
    }

    /// Handle to the open socket, `None` while disconnected.
    pub fn socket(&self) -> Option<SocketHandle> {
        self.shared
            .live
            .lock()
            .as_ref()
            .filter(|live| !live.outbound.is_closed())
            .map(|live| SocketHandle {
                outbound: live.outbound.clone(),
                generation: live.generation,
            })
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Send a text frame. Returns `false`, and drops the frame, when not connected.
    pub fn send(&self, text: String) -> bool {
        let live = self.shared.live.lock();
        match live.as_ref() {
            Some(live) => live.outbound.send(Message::Text(text)).is_ok(),
            None => {
                debug!(url = %self.shared.url, "not connected; dropping frame");
                false
            }
        }
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// `true` once the attempt cap was hit; stays set until the next `connect()`.
    pub fn reconnect_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Lost,
}

async fn run_socket(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    // Set by any open or failed attempt; the next open is then a reconnect.
    let mut resumed = false;

    loop {
        let attempt = tokio::select! {
            result = open(&shared) => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok(ws) => {
                shared.attempts.store(0, Ordering::SeqCst);
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *shared.live.lock() = Some(Live {
                    generation,
                    outbound: out_tx,
                });
                info!(url = %shared.url, generation, "connected");
                shared.emit(if resumed {
                    ConnectionEvent::Reconnected
                } else {
                    ConnectionEvent::Opened
                });
                resumed = true;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }

                let exit = pump(&shared, ws, out_rx, &mut shutdown).await;
                shared.clear_live(generation);
                shared.emit(ConnectionEvent::Closed);
                if exit == Exit::Shutdown {
                    break;
                }
                warn!(url = %shared.url, "connection lost");
            }
            Err(e) => {
                resumed = true;
                warn!(url = %shared.url, error = %e, "connect failed");
                shared.emit(ConnectionEvent::Error(e));
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
        }

        let made = shared.attempts.load(Ordering::SeqCst);
        if made >= shared.max_reconnect_attempts {
            shared.exhausted.store(true, Ordering::SeqCst);
            error!(url = %shared.url, attempts = made, "giving up reconnecting");
            shared.emit(ConnectionEvent::GaveUp { attempts: made });
            break;
        }
        let attempt = made + 1;
        shared.attempts.store(attempt, Ordering::SeqCst);
        info!(
            url = %shared.url,
            attempt,
            max = shared.max_reconnect_attempts,
            delay_ms = shared.reconnect_interval.as_millis() as u64,
            "reconnecting"
        );
        shared.emit(ConnectionEvent::Reconnecting { attempt });

        tokio::select! {
            _ = tokio::time::sleep(shared.reconnect_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(url = %shared.url, "socket task finished");
}

/// One connection attempt, handshake included, bounded by the connect timeout.
async fn open(shared: &Shared) -> Result<WsStream, String> {
    match tokio::time::timeout(shared.connect_timeout, connect_async(shared.url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!(
            "handshake timed out after {}ms",
            shared.connect_timeout.as_millis()
        )),
    }
}

async fn pump(
    shared: &Shared,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                while let Ok(message) = out_rx.try_recv() {
                    if sink.send(message).await.is_err() {
                        return Exit::Shutdown;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }
            Some(message) = out_rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "write failed");
                    return Exit::Lost;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = shared.inbound.send(text);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed the socket");
                    return Exit::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "read failed");
                    return Exit::Lost;
                }
                None => return Exit::Lost,
            },
        }
    }
}
