//! In-process connector.
//!
//! Routes events through memory only. At most one connection exists per
//! channel id; every subscriber of that id shares it. Useful for peers living
//! in the same process, e.g. a server hosting the authoritative copy of the
//! channels its network clients join.

use crate::channel::{ChannelConnectionRequest, ChannelConnector};
use crate::connection::{ChannelConnection, ConnectionBuilder, ConnectionError};
use crate::event::Event;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Weak};
use tether_protocol::ChannelInfo;
use tokio::sync::OnceCell;
use tracing::debug;

type Slot<T> = Arc<OnceCell<Arc<ChannelConnection<T>>>>;
type InitFn<T> = Arc<
    dyn Fn(&ChannelConnectionRequest<T>) -> BoxFuture<'static, Result<(), ConnectionError>>
        + Send
        + Sync,
>;
type EmitObserver = Arc<dyn Fn(&ChannelInfo, &Event) + Send + Sync>;

/// Connector that keeps every connection in memory.
pub struct MemoryConnector<T> {
    /// Creation slots by channel id. A slot is inserted before the connection
    /// exists, so concurrent first joins of one id share a single creation.
    slots: Arc<DashMap<String, Slot<T>>>,
    init: Option<InitFn<T>>,
    on_emit: Option<EmitObserver>,
}

impl<T> MemoryConnector<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a connector with a no-op initialization hook.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            init: None,
            on_emit: None,
        }
    }

    /// Run `init` before each first-time connection for a channel id is built.
    ///
    /// An error fails that join and leaves the id free for a later attempt.
    #[must_use]
    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(&ChannelConnectionRequest<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectionError>> + Send + 'static,
    {
        let init: InitFn<T> =
            Arc::new(move |request: &ChannelConnectionRequest<T>| init(request).boxed());
        self.init = Some(init);
        self
    }

    /// Observe every local event emitted on any connection of this connector.
    #[must_use]
    pub fn on_emit(
        mut self,
        observer: impl Fn(&ChannelInfo, &Event) + Send + Sync + 'static,
    ) -> Self {
        self.on_emit = Some(Arc::new(observer));
        self
    }

    /// The live connection for `channel_id`, if one exists.
    #[must_use]
    pub fn connection(&self, channel_id: &str) -> Option<Arc<ChannelConnection<T>>> {
        self.slots
            .get(channel_id)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Number of channel ids with a live or in-flight connection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no connection is live or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    async fn create(
        &self,
        request: ChannelConnectionRequest<T>,
        slot: Weak<OnceCell<Arc<ChannelConnection<T>>>>,
    ) -> Result<Arc<ChannelConnection<T>>, ConnectionError> {
        if let Some(init) = &self.init {
            init(&request).await?;
        }

        let info = request.info.clone();
        let channel = info.id().to_string();
        let slots = Arc::downgrade(&self.slots);
        let mut builder = ConnectionBuilder::new(request).on_close(move || {
            if let Some(slots) = slots.upgrade() {
                slots.remove_if(&channel, |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), slot.as_ptr())
                });
                debug!(channel = %channel, "Released in-memory connection");
            }
        });

        if let Some(observer) = &self.on_emit {
            let observer = Arc::clone(observer);
            builder = builder.emit_to_server(move |event| observer(&info, &event));
        }

        builder.build()
    }
}

impl<T> Default for MemoryConnector<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ChannelConnector<T> for MemoryConnector<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn connect_to_channel(
        &self,
        request: ChannelConnectionRequest<T>,
    ) -> Result<Arc<ChannelConnection<T>>, ConnectionError> {
        let channel = request.info.id().to_string();
        let slot: Slot<T> = Arc::clone(&self.slots.entry(channel.clone()).or_default());

        if let Some(connection) = slot.get() {
            debug!(channel = %channel, "Reusing in-memory connection");
            return Ok(Arc::clone(connection));
        }

        let weak = Arc::downgrade(&slot);
        match slot.get_or_try_init(|| self.create(request, weak)).await {
            Ok(connection) => Ok(Arc::clone(connection)),
            Err(e) => {
                // Another request waiting on this slot runs its own creation
                // next; only the map and this request may hold it here.
                self.slots.remove_if(&channel, |_, current| {
                    Arc::ptr_eq(current, &slot)
                        && !current.initialized()
                        && Arc::strong_count(current) == 2
                });
                debug!(channel = %channel, error = %e, "In-memory connection failed");
                Err(e)
            }
        }
    }
}
