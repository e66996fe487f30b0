//! Reference-counted registry of stream subscriptions.
//!
//! The registry is the source of truth for what the next blocking read
//! covers. All mutations take the write lock; readers get copies so the read
//! loop never holds the lock across store I/O or handler calls.

use super::types::{BatchHandler, RegisteredHandler};
use crate::types::{EntryId, SubscriptionId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Internal per-stream state.
struct StreamRecord {
    stream: String,
    ref_count: usize,
    cursor: EntryId,
    /// Registration order.
    handlers: Vec<RegisteredHandler>,
}

/// Result of registering a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: SubscriptionId,
    /// True if this registration created the stream's record.
    pub created: bool,
}

/// Result of removing a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unsubscribed {
    Removed {
        /// True if the stream's last handler was removed.
        stream_removed: bool,
    },
    NotFound,
}

/// Stream name to {reference count, cursor, handlers}, in insertion order.
pub struct SubscriptionRegistry {
    records: RwLock<Vec<StreamRecord>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` on `stream`.
    ///
    /// The first registration for a stream sets its cursor to
    /// `initial_cursor`; later ones leave the existing cursor untouched.
    pub fn subscribe(
        &self,
        stream: &str,
        initial_cursor: EntryId,
        handler: Arc<dyn BatchHandler>,
    ) -> Registration {
        let id = self.allocate_id();
        self.insert(stream, initial_cursor, RegisteredHandler { id, handler })
    }

    /// Like [`subscribe`](Self::subscribe), but builds the handler from the
    /// id it will be registered under. Nothing is registered if `make` fails.
    pub fn subscribe_with<E>(
        &self,
        stream: &str,
        initial_cursor: EntryId,
        make: impl FnOnce(SubscriptionId) -> Result<Arc<dyn BatchHandler>, E>,
    ) -> Result<Registration, E> {
        let id = self.allocate_id();
        let handler = make(id)?;
        Ok(self.insert(stream, initial_cursor, RegisteredHandler { id, handler }))
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(
        &self,
        stream: &str,
        initial_cursor: EntryId,
        registered: RegisteredHandler,
    ) -> Registration {
        let id = registered.id;

        let mut records = self.records.write();
        let created = match records.iter_mut().find(|r| r.stream == stream) {
            Some(record) => {
                record.ref_count += 1;
                record.handlers.push(registered);
                false
            }
            None => {
                records.push(StreamRecord {
                    stream: stream.to_string(),
                    ref_count: 1,
                    cursor: initial_cursor,
                    handlers: vec![registered],
                });
                true
            }
        };

        Registration { id, created }
    }

    /// Remove one registration. Deletes the stream's record when its count
    /// reaches zero.
    pub fn unsubscribe(&self, stream: &str, id: SubscriptionId) -> Unsubscribed {
        let mut records = self.records.write();
        let Some(pos) = records.iter().position(|r| r.stream == stream) else {
            return Unsubscribed::NotFound;
        };

        let record = &mut records[pos];
        let Some(handler_pos) = record.handlers.iter().position(|h| h.id == id) else {
            return Unsubscribed::NotFound;
        };
        record.handlers.remove(handler_pos);
        record.ref_count -= 1;

        let stream_removed = record.ref_count == 0;
        if stream_removed {
            records.remove(pos);
        }
        Unsubscribed::Removed { stream_removed }
    }

    /// `(stream, cursor)` for every tracked stream, in insertion order.
    pub fn snapshot(&self) -> Vec<(String, EntryId)> {
        self.records
            .read()
            .iter()
            .filter(|r| r.ref_count > 0)
            .map(|r| (r.stream.clone(), r.cursor))
            .collect()
    }

    /// Handlers of `stream` in registration order.
    pub fn handlers(&self, stream: &str) -> Vec<RegisteredHandler> {
        self.records
            .read()
            .iter()
            .find(|r| r.stream == stream)
            .map(|r| r.handlers.clone())
            .unwrap_or_default()
    }

    /// Move the cursor of `stream` forward to `id`.
    ///
    /// Returns false and leaves the cursor unchanged if `id` is not past the
    /// current cursor or the stream is no longer tracked.
    pub fn advance(&self, stream: &str, id: EntryId) -> bool {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.stream == stream) {
            Some(record) if id > record.cursor => {
                record.cursor = id;
                true
            }
            _ => false,
        }
    }

    /// Replace a `$` cursor with a concrete position.
    pub fn resolve_latest(&self, stream: &str, id: EntryId) {
        let mut records = self.records.write();
        if let Some(record) = records.iter_mut().find(|r| r.stream == stream) {
            if record.cursor.is_latest() {
                record.cursor = id;
            }
        }
    }

    pub fn cursor(&self, stream: &str) -> Option<EntryId> {
        self.records
            .read()
            .iter()
            .find(|r| r.stream == stream)
            .map(|r| r.cursor)
    }

    pub fn ref_count(&self, stream: &str) -> usize {
        self.records
            .read()
            .iter()
            .find(|r| r.stream == stream)
            .map(|r| r.ref_count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop every record. Handlers are not notified.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
