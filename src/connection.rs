//! Dedicated read and write connections to the log store.
//!
//! The read connection only ever carries blocking reads (and the cursor
//! lookups that prepare them). Everything else, including the `unblock`
//! that interrupts the read connection, goes over the write connection.

use crate::config::MultiplexerConfig;
use crate::error::{MuxError, Result};
use crate::events::EventBus;
use crate::store::{Connector, StoreConnection};
use crate::types::{ConnectionState, Endpoint, MuxEvent};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

type Conn = Box<dyn StoreConnection>;

/// Owns the multiplexer's store connections and their state.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    endpoints: Vec<Endpoint>,
    connect_timeout: Duration,
    events: Arc<EventBus>,

    state: RwLock<ConnectionState>,
    endpoint: RwLock<Option<Endpoint>>,

    /// Held for the whole of a read cycle.
    reader: Mutex<Option<Conn>>,
    reader_id: RwLock<Option<u64>>,
    writer: Mutex<Option<Conn>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &MultiplexerConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            connector,
            endpoints: config.endpoints.clone(),
            connect_timeout: config.connect_timeout,
            events,
            state: RwLock::new(ConnectionState::Disconnected),
            endpoint: RwLock::new(None),
            reader: Mutex::new(None),
            reader_id: RwLock::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint of the current (or last) connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    /// Client id of the read connection.
    pub fn reader_id(&self) -> Option<u64> {
        *self.reader_id.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(?state, "connection state changed");
            self.events.emit(MuxEvent::StateChanged { state });
        }
    }

    /// Open both connections to a randomly chosen endpoint.
    ///
    /// Succeeds only once the read connection is visible, by name and id,
    /// from the write connection, so that it can be unblocked.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let endpoint = self
            .endpoints
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(MuxError::NoEndpointAvailable)?;

        self.set_state(ConnectionState::Connecting);
        match self.open(&endpoint) {
            Ok((reader, reader_id, writer)) => {
                *self.reader.lock() = Some(reader);
                *self.writer.lock() = Some(writer);
                *self.reader_id.write() = Some(reader_id);
                *self.endpoint.write() = Some(endpoint.clone());
                info!(endpoint = %endpoint, client_id = reader_id, "connected");
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn open(&self, endpoint: &Endpoint) -> Result<(Conn, u64, Conn)> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let name = format!("streammux-{}-{}", millis, rand::thread_rng().gen_range(0..100_000));

        let mut reader = self.connector.connect(endpoint, self.connect_timeout)?;
        reader.set_name(&name)?;
        let reader_id = reader.client_id()?;

        let mut writer = self.connector.connect(endpoint, self.connect_timeout)?;
        let visible = writer
            .client_list()?
            .iter()
            .any(|c| c.id == reader_id && c.name.as_deref() == Some(name.as_str()));
        if !visible {
            let _ = reader.close();
            let _ = writer.close();
            return Err(MuxError::StoreUnavailable(format!(
                "read connection {} ({}) not listed by the store",
                reader_id, name
            )));
        }

        Ok((reader, reader_id, writer))
    }

    /// Mark the connections unusable. They are released by `close_all`.
    pub fn mark_disconnected(&self, reason: &str) {
        if self.state() != ConnectionState::Disconnected {
            warn!(reason, "store connection lost");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close and drop both connections.
    pub fn close_all(&self) {
        for slot in [&self.reader, &self.writer] {
            if let Some(mut conn) = slot.lock().take() {
                if let Err(e) = conn.close() {
                    debug!(error = %e, "error closing connection");
                }
            }
        }
        *self.reader_id.write() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Run `f` on the read connection.
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut dyn StoreConnection) -> Result<T>) -> Result<T> {
        let mut guard = self.reader.lock();
        let conn = guard.as_mut().ok_or(MuxError::NotConnected)?;
        self.observe(f(&mut **conn))
    }

    /// Run `f` on the write connection.
    pub fn with_writer<T>(&self, f: impl FnOnce(&mut dyn StoreConnection) -> Result<T>) -> Result<T> {
        if !self.is_connected() {
            return Err(MuxError::NotConnected);
        }
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(MuxError::NotConnected)?;
        self.observe(f(&mut **conn))
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.mark_disconnected(&e.to_string());
            }
        }
        result
    }

    /// Interrupt the blocking read on the read connection.
    ///
    /// Returns false if the read connection was not blocked at that moment.
    pub fn interrupt(&self) -> Result<bool> {
        let reader_id = self.reader_id().ok_or(MuxError::NotConnected)?;
        self.with_writer(|w| w.unblock(reader_id))
    }
}
