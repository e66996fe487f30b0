//! Access to the external log store.
//!
//! The multiplexer talks to the store only through [`StoreConnection`], one
//! instance per physical connection, created by a [`Connector`]:
//! - [`TcpConnector`] speaks RESP2 to a Redis-Streams compatible server
//! - [`MemoryStore`] keeps streams in process with the same blocking and
//!   unblocking behaviour, for tests and embedding

mod memory;
pub mod resp;
mod tcp;

pub use memory::{MemoryConnection, MemoryConnector, MemoryStore, ReadRecord, READ_LOG_CAPACITY};
pub use tcp::{TcpConnection, TcpConnector};

use crate::error::Result;
use crate::types::{Endpoint, EntryId};
use std::time::Duration;

/// An entry as stored: id plus field/value pairs, payload still encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntry {
    pub id: EntryId,
    pub fields: Vec<(String, Vec<u8>)>,
}

/// Entries returned for one stream by a blocking read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntries {
    pub stream: String,
    pub entries: Vec<RawEntry>,
}

/// One line of `CLIENT LIST`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u64,
    pub name: Option<String>,
}

/// Parse the text reply of `CLIENT LIST` (`id=7 addr=... name=foo ...` per line).
pub fn parse_client_list(text: &str) -> Vec<ClientInfo> {
    text.lines()
        .filter_map(|line| {
            let mut id = None;
            let mut name = None;
            for pair in line.split_whitespace() {
                match pair.split_once('=') {
                    Some(("id", v)) => id = v.parse::<u64>().ok(),
                    Some(("name", v)) if !v.is_empty() => name = Some(v.to_string()),
                    _ => {}
                }
            }
            id.map(|id| ClientInfo { id, name })
        })
        .collect()
}

/// A single connection to the log store.
///
/// Calls are sequential per connection. `blocking_read` holds the connection
/// until entries arrive, the timeout elapses, or another connection issues
/// `unblock` with this connection's client id.
pub trait StoreConnection: Send {
    /// Append one entry. `None` lets the store assign the id.
    fn append(
        &mut self,
        stream: &str,
        id: Option<EntryId>,
        fields: &[(&str, &[u8])],
    ) -> Result<EntryId>;

    /// Wait up to `timeout_ms` for entries after the given cursors.
    /// Returns `None` on timeout or when unblocked.
    fn blocking_read(
        &mut self,
        cursors: &[(String, EntryId)],
        timeout_ms: u64,
    ) -> Result<Option<Vec<StreamEntries>>>;

    /// Interrupt a blocking read on another connection.
    /// Returns false if that client was not blocked.
    fn unblock(&mut self, client_id: u64) -> Result<bool>;

    /// Store-assigned id of this connection.
    fn client_id(&mut self) -> Result<u64>;

    fn set_name(&mut self, name: &str) -> Result<()>;

    fn client_list(&mut self) -> Result<Vec<ClientInfo>>;

    /// Id of the newest entry in a stream, `None` if the stream is empty.
    fn last_entry_id(&mut self, stream: &str) -> Result<Option<EntryId>>;

    fn close(&mut self) -> Result<()>;
}

/// Opens store connections.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn StoreConnection>>;
}
