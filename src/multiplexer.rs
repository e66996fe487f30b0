//! The public multiplexer handle.

use crate::config::MultiplexerConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::events::EventBus;
use crate::publisher::Publisher;
use crate::read_loop::ReadLoop;
use crate::store::{Connector, TcpConnector};
use crate::subscriptions::{
    BatchHandler, BatchReceiver, ChannelHandler, FailureSink, HandlerResult, QueuedHandler,
    SubscriptionRegistry, Unsubscribed,
};
use crate::types::{Batch, ConnectionState, Endpoint, EntryId, MuxEvent, MuxStats, SubscriptionId};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

struct Inner {
    config: MultiplexerConfig,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    read_loop: Arc<ReadLoop>,
    publisher: Publisher,
    events: Arc<EventBus>,
    stats: Arc<Mutex<MuxStats>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.read_loop.stop();
        self.connections.close_all();
    }
}

/// Many stream subscribers sharing one blocking read.
///
/// Cloning is cheap and yields another handle to the same multiplexer. The
/// read loop and connections are released when the last handle is dropped.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Create a multiplexer talking to real store endpoints over TCP.
    pub fn open(config: MultiplexerConfig) -> Result<Self> {
        Self::new(config, Arc::new(TcpConnector))
    }

    /// Create a multiplexer that opens its connections through `connector`.
    ///
    /// Connects immediately when `auto_connect` is set.
    pub fn new(config: MultiplexerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let stats = Arc::new(Mutex::new(MuxStats::default()));
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            connector,
            &config,
            Arc::clone(&events),
        ));
        let read_loop = Arc::new(ReadLoop::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&events),
            Arc::clone(&stats),
            &config,
        ));
        let publisher = Publisher::new(
            Arc::clone(&connections),
            config.payload_encoding,
            Arc::clone(&stats),
        );

        let mux = Self {
            inner: Arc::new(Inner {
                config,
                registry,
                connections,
                read_loop,
                publisher,
                events,
                stats,
            }),
        };
        if mux.inner.config.auto_connect {
            mux.connect()?;
        }
        Ok(mux)
    }

    /// Connect to a random endpoint and start reading for existing
    /// subscriptions. A no-op when already connected.
    pub fn connect(&self) -> Result<()> {
        self.inner.connections.connect()?;
        self.inner.read_loop.resume();
        Ok(())
    }

    /// Stop reading, forget every subscription and close both connections.
    ///
    /// Safe to call repeatedly.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.registry.clear();
        inner.read_loop.stop();
        inner.connections.close_all();
        info!("disconnected");
    }

    /// Drop the current connections and connect again, keeping subscriptions
    /// and their cursors.
    pub fn reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.read_loop.stop();
        inner.connections.close_all();
        inner.connections.connect()?;
        inner.read_loop.resume();
        Ok(())
    }

    /// Subscribe `handler` to `stream`.
    ///
    /// `cursor` applies only when this is the first subscription for the
    /// stream; delivery starts after it. [`EntryId::Latest`] delivers only
    /// entries appended from now on.
    pub fn subscribe<F>(&self, stream: &str, cursor: EntryId, handler: F) -> Result<Subscription>
    where
        F: Fn(&Batch) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_handler(stream, cursor, Arc::new(handler))
    }

    /// Subscribe a shared [`BatchHandler`] to `stream`.
    ///
    /// The handler runs on its own worker thread behind a queue of
    /// `handler_buffer` batches. Batches that do not fit are dropped and
    /// reported as handler failures.
    pub fn subscribe_handler(
        &self,
        stream: &str,
        cursor: EntryId,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Subscription> {
        let inner = &self.inner;
        let sink = FailureSink {
            events: Arc::clone(&inner.events),
            stats: Arc::clone(&inner.stats),
        };
        self.register(stream, cursor, |id| {
            let queued =
                QueuedHandler::spawn(stream, id, handler, inner.config.handler_buffer, sink)?;
            Ok(Arc::new(queued) as Arc<dyn BatchHandler>)
        })
    }

    /// Subscribe through a bounded buffer of `handler_buffer` batches.
    ///
    /// Batches that do not fit are dropped and reported as handler failures.
    pub fn subscribe_channel(
        &self,
        stream: &str,
        cursor: EntryId,
    ) -> Result<(Subscription, BatchReceiver)> {
        let (handler, receiver) = ChannelHandler::bounded(self.inner.config.handler_buffer);
        let subscription = self.register(stream, cursor, |_| {
            Ok(Arc::new(handler) as Arc<dyn BatchHandler>)
        })?;
        Ok((subscription, BatchReceiver { receiver }))
    }

    fn register(
        &self,
        stream: &str,
        cursor: EntryId,
        make: impl FnOnce(SubscriptionId) -> Result<Arc<dyn BatchHandler>>,
    ) -> Result<Subscription> {
        let inner = &self.inner;
        let mut cursor = cursor;
        if cursor.is_latest()
            && inner.registry.cursor(stream).is_none()
            && inner.connections.is_connected()
        {
            // Pin `$` now so entries appended after this call are not missed.
            cursor = inner
                .connections
                .with_writer(|w| w.last_entry_id(stream))?
                .unwrap_or(EntryId::ZERO);
        }

        let registration = inner.registry.subscribe_with(stream, cursor, make)?;
        debug!(
            stream,
            subscription = registration.id.0,
            created = registration.created,
            "subscribed"
        );
        if registration.created {
            inner.read_loop.on_read_set_changed();
        }

        Ok(Subscription {
            id: registration.id,
            stream: stream.to_string(),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Remove one subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        unsubscribe(&self.inner, &subscription.stream, subscription.id)
    }

    /// Append an entry to `stream`. See [`Publisher::publish`].
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        entry_type: &str,
        payload: &T,
    ) -> Result<EntryId> {
        self.inner.publisher.publish(stream, entry_type, payload, None)
    }

    /// Append an entry under an explicit id.
    pub fn publish_with_id<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        entry_type: &str,
        payload: &T,
        id: EntryId,
    ) -> Result<EntryId> {
        self.inner
            .publisher
            .publish(stream, entry_type, payload, Some(id))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connections.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connections.is_connected()
    }

    /// Endpoint of the current (or last) connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.connections.endpoint()
    }

    /// Receive state changes, handler failures and read loop stops.
    pub fn watch(&self) -> Receiver<MuxEvent> {
        self.inner.events.watch()
    }

    pub fn stats(&self) -> MuxStats {
        self.inner.stats.lock().clone()
    }

    /// Last entry id delivered (or the starting point) for `stream`.
    pub fn cursor(&self, stream: &str) -> Option<EntryId> {
        self.inner.registry.cursor(stream)
    }

    /// Number of live subscriptions on `stream`.
    pub fn ref_count(&self, stream: &str) -> usize {
        self.inner.registry.ref_count(stream)
    }

    /// Streams covered by the next blocking read.
    pub fn streams(&self) -> Vec<String> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|(stream, _)| stream)
            .collect()
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }
}

fn unsubscribe(inner: &Arc<Inner>, stream: &str, id: SubscriptionId) -> bool {
    match inner.registry.unsubscribe(stream, id) {
        Unsubscribed::Removed { stream_removed } => {
            debug!(stream, subscription = id.0, stream_removed, "unsubscribed");
            if stream_removed {
                inner.read_loop.on_read_set_changed();
            }
            true
        }
        Unsubscribed::NotFound => false,
    }
}

/// Handle to one registration, returned by the `subscribe` methods.
///
/// Dropping the handle does not unsubscribe.
#[derive(Clone, Debug)]
pub struct Subscription {
    id: SubscriptionId,
    stream: String,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Remove this registration. Returns false if it was already removed or
    /// the multiplexer is gone.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => unsubscribe(&inner, &self.stream, self.id),
            None => false,
        }
    }
}
