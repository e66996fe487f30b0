//! Appending typed entries to streams.

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::types::{EntryId, MuxStats, PayloadEncoding};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Writes entries over the write connection.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    encoding: PayloadEncoding,
    stats: Arc<Mutex<MuxStats>>,
}

impl Publisher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        encoding: PayloadEncoding,
        stats: Arc<Mutex<MuxStats>>,
    ) -> Self {
        Self {
            connections,
            encoding,
            stats,
        }
    }

    /// Append one entry holding a single `entry_type -> payload` field.
    ///
    /// With `id` unset the store assigns the next id. Returns the id the
    /// entry was stored under.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        entry_type: &str,
        payload: &T,
        id: Option<EntryId>,
    ) -> Result<EntryId> {
        let bytes = self.encoding.encode(payload)?;
        let assigned = self
            .connections
            .with_writer(|w| w.append(stream, id, &[(entry_type, bytes.as_slice())]))?;

        self.stats.lock().entries_published += 1;
        debug!(stream, entry_type, id = %assigned, "published");
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MultiplexerConfig;
    use crate::error::MuxError;
    use crate::events::EventBus;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn publisher(store: &MemoryStore, encoding: PayloadEncoding) -> Publisher {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(store.connector()),
            &MultiplexerConfig::with_endpoints_str("localhost:6379"),
            Arc::new(EventBus::new()),
        ));
        connections.connect().unwrap();
        Publisher::new(connections, encoding, Arc::new(Mutex::new(MuxStats::default())))
    }

    #[test]
    fn test_publish_json() {
        let store = MemoryStore::new();
        let publisher = publisher(&store, PayloadEncoding::Json);

        let id = publisher
            .publish("orders", "CREATED", &json!({"id": 1}), None)
            .unwrap();

        let stored = store.entries("orders");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].fields[0].0, "CREATED");
        assert_eq!(
            PayloadEncoding::Json.decode(&stored[0].fields[0].1).unwrap(),
            json!({"id": 1})
        );
        assert_eq!(publisher.stats.lock().entries_published, 1);
    }

    #[test]
    fn test_publish_explicit_ids() {
        let store = MemoryStore::new();
        let publisher = publisher(&store, PayloadEncoding::MessagePack);

        let id = publisher
            .publish("s", "T", &json!({"n": 1}), Some(EntryId::new(5, 1)))
            .unwrap();
        assert_eq!(id, EntryId::new(5, 1));

        let stale = publisher.publish("s", "T", &json!({"n": 2}), Some(EntryId::new(5, 0)));
        assert!(matches!(stale, Err(MuxError::Store(_))));
    }

    #[test]
    fn test_publish_not_connected() {
        let store = MemoryStore::new();
        let publisher = publisher(&store, PayloadEncoding::Json);
        publisher.connections.close_all();

        let result = publisher.publish("s", "T", &json!({}), None);
        assert!(matches!(result, Err(MuxError::NotConnected)));
        assert!(store.entries("s").is_empty());
    }
}
