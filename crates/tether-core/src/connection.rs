//! Connection synchronization core.
//!
//! Every connector funnels its transport-specific hooks through a
//! [`ConnectionBuilder`] and gets back a [`ChannelConnection`]. The connection
//! multiplexes local and remote events onto one ordered bus, gates outgoing
//! events on the connectivity state machine, and tears down exactly once.
//!
//! ## Event bus
//!
//! ```text
//!   emit(event) ──┐                      ┌──▶ emit_to_store      (every event)
//!                 ├──▶ bus (FIFO, lock) ─┼──▶ events broadcast  (every event)
//!  server_events ─┘                      └──▶ emit_to_server    (local && online)
//! ```
//!
//! Whoever holds the bus runs all three steps for its event before the next
//! event is admitted, so the store, the `events` stream and the server all see
//! the same order. Connectivity transitions take the same lock.

use crate::channel::ChannelConnectionRequest;
use crate::event::Event;
use crate::state::{ConnectionState, DistinctConnectivity, Effect, Signal};
use crate::store::StateStore;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tether_protocol::ChannelInfo;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default capacity of the `events`, `disconnected` and `reconnected` broadcasts.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A connectivity stream was supplied without a way to fetch server state.
    #[error("Connection state stream requires a server state fetcher")]
    MissingServerState,

    /// The remote authority refused the join.
    #[error("Join rejected for channel {channel}: {reason}")]
    JoinRejected {
        /// Requested channel id.
        channel: String,
        /// Reason given by the server.
        reason: String,
    },

    /// A connector's initialization hook failed.
    #[error("Channel initialization failed: {0}")]
    Init(String),

    /// Fetching the authoritative state failed.
    #[error("Server state unavailable: {0}")]
    ServerState(String),

    /// A state value could not be decoded.
    #[error("Invalid state payload: {0}")]
    InvalidState(#[from] serde_json::Error),

    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Future returned by a server state fetcher.
pub type ServerStateFuture<T> = BoxFuture<'static, Result<T, ConnectionError>>;

type ServerStateFn<T> = Arc<dyn Fn() -> ServerStateFuture<T> + Send + Sync>;
type EmitToServerFn = Box<dyn Fn(Event) + Send + Sync>;
type EmitToStoreFn = Box<dyn Fn(&Event) + Send + Sync>;
type CloseFn = Box<dyn FnOnce() + Send>;

/// Collects a connector's hooks, then builds the live connection.
pub struct ConnectionBuilder<T> {
    request: ChannelConnectionRequest<T>,
    server_events: Option<BoxStream<'static, Event>>,
    emit_to_server: Option<EmitToServerFn>,
    emit_to_store: Option<EmitToStoreFn>,
    connection_state: Option<BoxStream<'static, bool>>,
    server_state: Option<ServerStateFn<T>>,
    initially_connected: Option<bool>,
    on_close: Vec<CloseFn>,
    capacity: usize,
}

impl<T> ConnectionBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start building a connection for `request`.
    #[must_use]
    pub fn new(request: ChannelConnectionRequest<T>) -> Self {
        Self {
            request,
            server_events: None,
            emit_to_server: None,
            emit_to_store: None,
            connection_state: None,
            server_state: None,
            initially_connected: None,
            on_close: Vec::new(),
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Events arriving from the remote authority.
    #[must_use]
    pub fn server_events(mut self, events: impl Stream<Item = Event> + Send + 'static) -> Self {
        self.server_events = Some(events.boxed());
        self
    }

    /// Called for each local event emitted while online.
    #[must_use]
    pub fn emit_to_server(mut self, emit: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.emit_to_server = Some(Box::new(emit));
        self
    }

    /// Replace the default `store.process(event)` step.
    #[must_use]
    pub fn emit_to_store(mut self, apply: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.emit_to_store = Some(Box::new(apply));
        self
    }

    /// Raw transport connectivity, `true` meaning reachable.
    ///
    /// Requires [`ConnectionBuilder::server_state`].
    #[must_use]
    pub fn connection_state(
        mut self,
        connectivity: impl Stream<Item = bool> + Send + 'static,
    ) -> Self {
        self.connection_state = Some(connectivity.boxed());
        self
    }

    /// Connectivity already known when the connection is built.
    ///
    /// Without this hint a connection with a connectivity stream starts
    /// offline until the first signal. A connector whose join just succeeded
    /// over the transport can pass `true` to start online.
    #[must_use]
    pub fn initially_connected(mut self, connected: bool) -> Self {
        self.initially_connected = Some(connected);
        self
    }

    /// Fetches the authoritative state after connectivity returns.
    #[must_use]
    pub fn server_state<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ConnectionError>> + Send + 'static,
    {
        let fetch: ServerStateFn<T> = Arc::new(move || fetch().boxed());
        self.server_state = Some(fetch);
        self
    }

    /// Run `callback` once, when the connection is torn down.
    #[must_use]
    pub fn on_close(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_close.push(Box::new(callback));
        self
    }

    /// Capacity of the broadcast streams handed to observers.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Build the connection and start pumping its streams.
    ///
    /// Must be called inside a tokio runtime when server events or a
    /// connectivity stream were supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::MissingServerState`] if a connectivity stream
    /// was supplied without a server state fetcher.
    pub fn build(self) -> Result<Arc<ChannelConnection<T>>, ConnectionError> {
        if self.connection_state.is_some() && self.server_state.is_none() {
            return Err(ConnectionError::MissingServerState);
        }

        let ChannelConnectionRequest { info, store } = self.request;

        // Without a connectivity source no signal ever arrives, so start online.
        let initial = match (&self.connection_state, self.initially_connected) {
            (None, _) | (Some(_), Some(true)) => ConnectionState::Online,
            (Some(_), _) => ConnectionState::Offline,
        };

        let emit_to_store = self.emit_to_store.unwrap_or_else(|| {
            let store = Arc::clone(&store);
            Box::new(move |event: &Event| store.process(event))
        });

        let (events, _) = broadcast::channel(self.capacity);
        let (disconnected, _) = broadcast::channel(self.capacity);
        let (reconnected, _) = broadcast::channel(self.capacity);
        let (state, _) = watch::channel(initial);
        let (closed_tx, _) = watch::channel(false);

        let connection = Arc::new(ChannelConnection {
            info,
            store,
            bus: Mutex::new(Bus {
                closed: false,
                events: Some(events),
            }),
            emit_to_store,
            emit_to_server: self.emit_to_server,
            server_state: self.server_state,
            state,
            disconnected,
            reconnected,
            closed: AtomicBool::new(false),
            closed_tx,
            on_close: Mutex::new(self.on_close),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if let Some(events) = self.server_events {
            tasks.push(tokio::spawn(pump_server_events(
                Arc::downgrade(&connection),
                events,
            )));
        }
        if let Some(connectivity) = self.connection_state {
            let distinct = match self.initially_connected {
                Some(connected) => DistinctConnectivity::starting_from(connected),
                None => DistinctConnectivity::new(),
            };
            tasks.push(tokio::spawn(pump_connectivity(
                Arc::downgrade(&connection),
                connectivity,
                distinct,
            )));
        }
        *lock(&connection.tasks) = tasks;

        debug!(channel = %connection.info.id(), state = %initial, "Connection built");
        Ok(connection)
    }
}

async fn pump_server_events<T>(
    connection: Weak<ChannelConnection<T>>,
    mut events: BoxStream<'static, Event>,
) where
    T: Clone + Send + Sync + 'static,
{
    while let Some(event) = events.next().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.dispatch(event, false);
    }
    trace!("Server event stream ended");
}

async fn pump_connectivity<T>(
    connection: Weak<ChannelConnection<T>>,
    mut connectivity: BoxStream<'static, bool>,
    mut distinct: DistinctConnectivity,
) where
    T: Clone + Send + Sync + 'static,
{
    while let Some(connected) = connectivity.next().await {
        let Some(signal) = distinct.observe(connected) else {
            continue;
        };
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.apply_signal(signal);
    }
    trace!("Connectivity stream ended");
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Bus {
    closed: bool,
    events: Option<broadcast::Sender<Event>>,
}

/// A live, transport-agnostic channel connection.
pub struct ChannelConnection<T> {
    info: ChannelInfo,
    store: Arc<dyn StateStore<T>>,
    bus: Mutex<Bus>,
    emit_to_store: EmitToStoreFn,
    emit_to_server: Option<EmitToServerFn>,
    server_state: Option<ServerStateFn<T>>,
    state: watch::Sender<ConnectionState>,
    disconnected: broadcast::Sender<T>,
    reconnected: broadcast::Sender<T>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    on_close: Mutex<Vec<CloseFn>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ChannelConnection<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The confirmed channel this connection is bound to.
    #[must_use]
    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// The store events are applied to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore<T>> {
        &self.store
    }

    /// Current connectivity state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connectivity state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every event applied to the store from now on, local and remote, in order.
    ///
    /// The receiver reports `Closed` once the connection is torn down.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        match &lock(&self.bus).events {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Store values captured at each `online → offline` transition.
    #[must_use]
    pub fn disconnected(&self) -> broadcast::Receiver<T> {
        self.disconnected.subscribe()
    }

    /// Server states fetched at each `offline → online-disconnected` transition.
    ///
    /// Applying them to the store is up to the caller.
    #[must_use]
    pub fn reconnected(&self) -> broadcast::Receiver<T> {
        self.reconnected.subscribe()
    }

    /// Apply a local event and, while online, relay it to the server.
    pub fn emit(&self, event: Event) {
        self.dispatch(event, true);
    }

    /// Resume relaying local events after an `online-disconnected` period.
    pub fn reconnect(&self) {
        self.apply_signal(Signal::Reconnect);
    }

    /// Tear the connection down. Only the first call has any effect.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!(channel = %self.info.id(), "Connection already closed");
            return;
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        {
            let mut bus = lock(&self.bus);
            bus.closed = true;
            bus.events = None;
        }

        self.closed_tx.send_replace(true);

        let callbacks = std::mem::take(&mut *lock(&self.on_close));
        for callback in callbacks {
            callback();
        }

        debug!(channel = %self.info.id(), "Connection closed");
    }

    /// Whether [`ChannelConnection::unsubscribe`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is torn down.
    pub async fn closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn dispatch(&self, event: Event, is_local: bool) {
        let bus = lock(&self.bus);
        if bus.closed {
            debug!(
                channel = %self.info.id(),
                event_type = %event.event_type,
                "Dropping event on closed connection"
            );
            return;
        }

        (self.emit_to_store)(&event);

        let forward = is_local && self.state().forwards_local_events();
        trace!(
            channel = %self.info.id(),
            event_type = %event.event_type,
            local = is_local,
            forward,
            "Dispatched event"
        );

        if let Some(events) = &bus.events {
            let _ = events.send(event.clone());
        }

        if forward {
            if let Some(emit) = &self.emit_to_server {
                emit(event);
            }
        }
    }

    fn apply_signal(&self, signal: Signal) {
        let bus = lock(&self.bus);
        if bus.closed {
            return;
        }

        let current = self.state();
        let (next, effects) = current.on_signal(signal);
        if next != current {
            debug!(
                channel = %self.info.id(),
                from = %current,
                to = %next,
                "Connection state changed"
            );
            self.state.send_replace(next);
        }

        for effect in effects {
            match effect {
                Effect::EmitDisconnected => {
                    let _ = self.disconnected.send(self.store.state());
                }
                Effect::FetchServerState => self.fetch_server_state(),
            }
        }
    }

    fn fetch_server_state(&self) {
        let Some(fetch) = &self.server_state else {
            return;
        };
        let fetch = fetch();
        let reconnected = self.reconnected.clone();
        let channel = self.info.id().to_string();
        tokio::spawn(async move {
            match fetch.await {
                Ok(state) => {
                    debug!(channel = %channel, "Fetched server state");
                    let _ = reconnected.send(state);
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to fetch server state");
                }
            }
        });
    }
}

impl<T> std::fmt::Debug for ChannelConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("info", &self.info)
            .field("state", &*self.state.borrow())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T> Drop for ChannelConnection<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
