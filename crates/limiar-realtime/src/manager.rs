//! The self-reconnecting connection manager.
//!
//! One [`ConnectionManager`] owns at most one physical connection at a time
//! and runs one driver task for its current lifetime. The driver connects,
//! pumps frames in both directions, and on an unexpected drop walks the
//! [`ReconnectPolicy`] until it either reconnects or gives up.
//!
//! Every state transition and every inbound envelope is delivered to
//! subscribers synchronously from the driver, under a re-entrant emission
//! lock shared with [`ConnectionManager::close`]. Handlers may therefore call
//! [`send`](ConnectionManager::send) or [`close`](ConnectionManager::close)
//! on their own manager, and no driver transition can be observed after the
//! `Offline` emitted by `close()`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use limiar_core::{Envelope, ReconnectPolicy};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::subscribers::{Handler, Subscribers, Subscription};
use crate::transport::{Connector, Transport};

/// Connection state as broadcast to subscribers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Socket open; `send` transmits.
    Connected,
    /// Connecting, or waiting to retry.
    Reconnecting,
    /// Closed by the caller, out of attempts, or never opened.
    #[default]
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        })
    }
}

/// Default bound on the close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tuning for a [`ConnectionManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Reconnect ceiling and backoff.
    pub reconnect: ReconnectPolicy,
    /// Upper bound on sending the close frame.
    pub close_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

struct Inner {
    url: String,
    log_url: String,
    options: ManagerOptions,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    messages: Arc<Subscribers<Envelope>>,
    states: Arc<Subscribers<ConnectionState>>,
    attempts: AtomicU32,
    closed: AtomicBool,
    running: AtomicBool,
    generation: AtomicU64,
    cancel: Mutex<CancellationToken>,
    emission: ReentrantMutex<()>,
}

/// Cloneable handle to a self-reconnecting connection.
///
/// Created closed; [`open`](Self::open) starts a lifetime (and must be
/// called from within a tokio runtime). A manager lives until
/// [`close`](Self::close) is called, even if every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, for callbacks that must not keep the manager alive.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    /// Upgrade to a strong handle if the manager still exists.
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

enum PumpExit {
    Cancelled,
    Dropped,
}

enum Retry {
    After(Duration),
    Stop,
}

impl ConnectionManager {
    /// A closed manager for `url`.
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, options: ManagerOptions) -> Self {
        let url = url.into();
        let log_url = redact(&url);
        Self {
            inner: Arc::new(Inner {
                url,
                log_url,
                options,
                connector,
                state: Mutex::new(ConnectionState::Offline),
                writer: Mutex::new(None),
                messages: Subscribers::new(),
                states: Subscribers::new(),
                attempts: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
                emission: ReentrantMutex::new(()),
            }),
        }
    }

    /// A manager for `url` that is already connecting.
    pub fn connect(url: impl Into<String>, connector: Arc<dyn Connector>, options: ManagerOptions) -> Self {
        let manager = Self::new(url, connector, options);
        manager.open();
        manager
    }

    /// Start a connection lifetime.
    ///
    /// No-op while a lifetime is running. After [`close`](Self::close) or
    /// attempt exhaustion this starts afresh: the attempt counter is reset
    /// and reconnection is re-enabled.
    ///
    /// The state becomes `Reconnecting` without a notification; use
    /// [`watch_state`](Self::watch_state) to observe it.
    pub fn open(&self) {
        let inner = &self.inner;
        let _emission = inner.emission.lock();
        if inner.running.load(Ordering::SeqCst) && !inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.closed.store(false, Ordering::SeqCst);
        inner.attempts.store(0, Ordering::SeqCst);
        inner.running.store(true, Ordering::SeqCst);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *inner.cancel.lock() = cancel.clone();

        info!(url = %inner.log_url, generation, "opening realtime connection");
        *inner.state.lock() = ConnectionState::Reconnecting;

        drop(tokio::spawn(drive(Arc::clone(inner), generation, cancel)));
    }

    /// Transmit an envelope.
    ///
    /// Returns `false` without error unless the manager is `Connected` with
    /// a live writer. Nothing is queued for later.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let writer = self.inner.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return false;
        };
        match envelope.encode() {
            Ok(text) => tx.send(text).is_ok(),
            Err(err) => {
                warn!(kind = %envelope.kind, error = %err, "failed to encode outbound envelope");
                false
            }
        }
    }

    /// Register a handler for decoded inbound envelopes.
    pub fn subscribe_message(
        &self,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.messages.subscribe(Arc::new(handler))
    }

    /// Register a handler for state transitions.
    pub fn subscribe_state(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.states.subscribe(Arc::new(handler))
    }

    /// Register a state handler and immediately replay the current state to
    /// it. No transition can slip between the replay and the subscription.
    pub fn watch_state(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: Handler<ConnectionState> = Arc::new(handler);
        let _emission = self.inner.emission.lock();
        let subscription = self.inner.states.subscribe(Arc::clone(&handler));
        let current = self.state();
        handler(&current);
        subscription
    }

    /// End the lifetime: disable reconnection, detach the writer, emit
    /// `Offline` (unless already offline) and let the driver send a close
    /// frame and exit.
    pub fn close(&self) {
        let inner = &self.inner;
        let _emission = inner.emission.lock();
        let was_closed = inner.closed.swap(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        inner.cancel.lock().cancel();
        drop(inner.writer.lock().take());
        if !was_closed {
            debug!(url = %inner.log_url, "closing realtime connection");
        }
        inner.transition(ConnectionState::Offline, false);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Target URL, including the token query parameter.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Whether `close()` ended the current lifetime.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Weak handle for use inside callbacks.
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles refer to the same manager.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.log_url)
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .field("message_handlers", &self.inner.messages.len())
            .field("state_handlers", &self.inner.states.len())
            .finish()
    }
}

impl Inner {
    /// Set the state and notify. With `always`, subscribers are notified even
    /// when the state is unchanged. Caller holds the emission lock.
    fn transition(&self, next: ConnectionState, always: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed || always {
            debug!(url = %self.log_url, state = %next, "connection state");
            self.states.emit(&next);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Attach the writer and announce `Connected`. Returns `false` when the
    /// lifetime ended while the handshake was in flight.
    fn on_open(&self, generation: u64, writer: mpsc::UnboundedSender<String>) -> bool {
        let _emission = self.emission.lock();
        if !self.is_current(generation) {
            return false;
        }
        self.attempts.store(0, Ordering::SeqCst);
        *self.writer.lock() = Some(writer);
        info!(url = %self.log_url, "realtime connection open");
        self.transition(ConnectionState::Connected, false);
        true
    }

    /// Forget the writer once the socket is gone, so `send` reports `false`
    /// before the retry is scheduled.
    fn detach_writer(&self, generation: u64) {
        let _emission = self.emission.lock();
        if self.is_current(generation) {
            drop(self.writer.lock().take());
        }
    }

    fn dispatch(&self, generation: u64, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(url = %self.log_url, error = %err, "dropping malformed frame");
                return;
            }
        };
        let _emission = self.emission.lock();
        if self.is_current(generation) {
            self.messages.emit(&envelope);
        }
    }

    /// Decide what happens after a drop or failed attempt.
    fn schedule_retry(&self, generation: u64) -> Retry {
        let _emission = self.emission.lock();
        if !self.is_current(generation) {
            return Retry::Stop;
        }
        drop(self.writer.lock().take());

        let attempts = self.attempts.load(Ordering::SeqCst);
        let policy = self.options.reconnect;
        if !policy.allows(attempts) {
            warn!(url = %self.log_url, attempts, "giving up on realtime connection");
            self.running.store(false, Ordering::SeqCst);
            self.transition(ConnectionState::Offline, false);
            return Retry::Stop;
        }
        let attempt = attempts + 1;
        self.attempts.store(attempt, Ordering::SeqCst);
        let delay = policy.delay_for(attempt);
        info!(
            url = %self.log_url,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        self.transition(ConnectionState::Reconnecting, true);
        Retry::After(delay)
    }
}

/// Driver for one lifetime.
async fn drive(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = inner.connector.connect(&inner.url) => result,
        };

        match attempt {
            Ok(mut transport) => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                if !inner.on_open(generation, tx) {
                    close_transport(&inner, &mut transport).await;
                    return;
                }
                match pump(&inner, generation, &mut transport, &mut rx, &cancel).await {
                    PumpExit::Cancelled => {
                        close_transport(&inner, &mut transport).await;
                        return;
                    }
                    PumpExit::Dropped => {
                        debug!(url = %inner.log_url, "realtime connection dropped");
                    }
                }
            }
            Err(err) => {
                debug!(url = %inner.log_url, error = %err, "connect attempt failed");
            }
        }

        match inner.schedule_retry(generation) {
            Retry::Stop => return,
            Retry::After(delay) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    generation: u64,
    transport: &mut Transport,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> PumpExit {
    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break PumpExit::Cancelled,
            frame = transport.stream.next() => match frame {
                Some(Ok(text)) => inner.dispatch(generation, &text),
                Some(Err(err)) => {
                    debug!(url = %inner.log_url, error = %err, "read failed");
                    break PumpExit::Dropped;
                }
                None => break PumpExit::Dropped,
            },
            text = outbound.recv() => match text {
                Some(text) => {
                    if let Err(err) = transport.sink.send(text).await {
                        debug!(url = %inner.log_url, error = %err, "write failed");
                        break PumpExit::Dropped;
                    }
                }
                None => break PumpExit::Cancelled,
            },
        }
    };
    if matches!(exit, PumpExit::Dropped) {
        inner.detach_writer(generation);
    }
    exit
}

async fn close_transport(inner: &Inner, transport: &mut Transport) {
    let closing = transport.sink.close();
    if tokio::time::timeout(inner.options.close_timeout, closing).await.is_err() {
        debug!(url = %inner.log_url, "close handshake timed out");
    }
}

/// URL with the query string removed, for logs.
fn redact(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_owned(),
    }
}
