//! In-process log store with Redis Streams semantics.
//!
//! Streams live in a shared map guarded by one mutex; blocking reads wait on
//! a condition variable that is signalled by appends, unblocks and kills.
//! Every [`MemoryConnection`] behaves like a separate client: it has its own
//! client id and can be unblocked or killed from outside.

use super::{ClientInfo, Connector, RawEntry, StoreConnection, StreamEntries};
use crate::error::{MuxError, Result};
use crate::types::{Endpoint, EntryId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Number of most recent reads kept by [`MemoryStore::reads`].
pub const READ_LOG_CAPACITY: usize = 1024;

/// One blocking read as seen by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRecord {
    pub client_id: u64,
    pub cursors: Vec<(String, EntryId)>,
}

#[derive(Default)]
struct ClientSlot {
    name: Option<String>,
    /// Blocking reads currently in progress on this client.
    active_reads: u32,
    unblock_requested: bool,
    killed: bool,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Vec<RawEntry>>,
    clients: HashMap<u64, ClientSlot>,
    next_client_id: u64,
    max_concurrent_reads: u32,
    /// Most recent reads, oldest first, at most `READ_LOG_CAPACITY`.
    reads: VecDeque<ReadRecord>,
    unblocks: u64,
}

impl State {
    fn last_id(&self, stream: &str) -> Option<EntryId> {
        self.streams.get(stream).and_then(|s| s.last()).map(|e| e.id)
    }

    fn append(
        &mut self,
        stream: &str,
        id: Option<EntryId>,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<EntryId> {
        let last = self.last_id(stream).unwrap_or(EntryId::ZERO);
        let id = match id {
            Some(EntryId::Latest) => {
                return Err(MuxError::Store("ERR Invalid stream ID specified".into()))
            }
            Some(id) if id <= last => {
                return Err(MuxError::Store(
                    "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                        .into(),
                ))
            }
            Some(id) => id,
            None => {
                let now = now_millis();
                match last {
                    EntryId::Id { ms, .. } if now <= ms => last.next(),
                    _ => EntryId::new(now, 0),
                }
            }
        };
        self.streams
            .entry(stream.to_string())
            .or_default()
            .push(RawEntry { id, fields });
        Ok(id)
    }

    fn collect(&self, cursors: &[(String, EntryId)]) -> Vec<StreamEntries> {
        cursors
            .iter()
            .filter_map(|(stream, cursor)| {
                let entries: Vec<RawEntry> = self
                    .streams
                    .get(stream)?
                    .iter()
                    .filter(|e| e.id > *cursor)
                    .cloned()
                    .collect();
                if entries.is_empty() {
                    None
                } else {
                    Some(StreamEntries {
                        stream: stream.clone(),
                        entries,
                    })
                }
            })
            .collect()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn connection_reset() -> MuxError {
    MuxError::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection killed",
    ))
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    refuse_connections: AtomicBool,
}

/// Shared in-process store. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_client_id: 1,
                    ..Default::default()
                }),
                changed: Condvar::new(),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// A connector that opens connections to this store.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Open a connection directly.
    pub fn connection(&self) -> Result<MemoryConnection> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(MuxError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "store refusing connections",
            )));
        }
        let mut state = self.shared.state.lock();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.insert(id, ClientSlot::default());
        Ok(MemoryConnection {
            store: self.clone(),
            id,
        })
    }

    /// Append outside of any client connection.
    pub fn append(&self, stream: &str, entry_type: &str, payload: &[u8]) -> Result<EntryId> {
        let id = self.shared.state.lock().append(
            stream,
            None,
            vec![(entry_type.to_string(), payload.to_vec())],
        )?;
        self.shared.changed.notify_all();
        Ok(id)
    }

    /// All entries of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<RawEntry> {
        self.shared
            .state
            .lock()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent blocking reads (up to [`READ_LOG_CAPACITY`]), oldest first.
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.shared.state.lock().reads.iter().cloned().collect()
    }

    /// Highest number of simultaneous blocking reads ever seen on one client.
    pub fn max_concurrent_reads(&self) -> u32 {
        self.shared.state.lock().max_concurrent_reads
    }

    /// Clients with a blocking read in progress.
    pub fn blocked_clients(&self) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .clients
            .iter()
            .filter(|(_, c)| c.active_reads > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of successful `unblock` calls.
    pub fn unblock_count(&self) -> u64 {
        self.shared.state.lock().unblocks
    }

    pub fn client_count(&self) -> usize {
        self.shared.state.lock().clients.len()
    }

    /// Drop every open connection, as if the server restarted.
    pub fn kill_all_clients(&self) {
        let mut state = self.shared.state.lock();
        for client in state.clients.values_mut() {
            client.killed = true;
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Make new connection attempts fail until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens connections to a [`MemoryStore`]; the endpoint is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl Connector for MemoryConnector {
    fn connect(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn StoreConnection>> {
        Ok(Box::new(self.store.connection()?))
    }
}

/// A client of a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    id: u64,
}

impl MemoryConnection {
    fn check_alive(&self, state: &State) -> Result<()> {
        match state.clients.get(&self.id) {
            Some(client) if !client.killed => Ok(()),
            _ => Err(connection_reset()),
        }
    }
}

impl StoreConnection for MemoryConnection {
    fn append(
        &mut self,
        stream: &str,
        id: Option<EntryId>,
        fields: &[(&str, &[u8])],
    ) -> Result<EntryId> {
        let fields = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_vec()))
            .collect();
        let shared = &self.store.shared;
        let mut state = shared.state.lock();
        self.check_alive(&state)?;
        let id = state.append(stream, id, fields)?;
        drop(state);
        shared.changed.notify_all();
        Ok(id)
    }

    fn blocking_read(
        &mut self,
        cursors: &[(String, EntryId)],
        timeout_ms: u64,
    ) -> Result<Option<Vec<StreamEntries>>> {
        let shared = &self.store.shared;
        let mut state = shared.state.lock();
        self.check_alive(&state)?;

        // `$` means "after whatever is last right now".
        let resolved: Vec<(String, EntryId)> = cursors
            .iter()
            .map(|(stream, cursor)| {
                let cursor = match cursor {
                    EntryId::Latest => state.last_id(stream).unwrap_or(EntryId::ZERO),
                    id => *id,
                };
                (stream.clone(), cursor)
            })
            .collect();

        if state.reads.len() == READ_LOG_CAPACITY {
            state.reads.pop_front();
        }
        state.reads.push_back(ReadRecord {
            client_id: self.id,
            cursors: cursors.to_vec(),
        });
        let active = {
            let client = state.clients.entry(self.id).or_default();
            client.active_reads += 1;
            client.unblock_requested = false;
            client.active_reads
        };
        state.max_concurrent_reads = state.max_concurrent_reads.max(active);

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let outcome = loop {
            if let Err(e) = self.check_alive(&state) {
                break Err(e);
            }
            let found = state.collect(&resolved);
            if !found.is_empty() {
                break Ok(Some(found));
            }
            let unblocked = state
                .clients
                .get(&self.id)
                .map(|c| c.unblock_requested)
                .unwrap_or(false);
            if unblocked || Instant::now() >= deadline {
                break Ok(None);
            }
            shared.changed.wait_until(&mut state, deadline);
        };

        if let Some(client) = state.clients.get_mut(&self.id) {
            client.active_reads -= 1;
            client.unblock_requested = false;
        }
        outcome
    }

    fn unblock(&mut self, client_id: u64) -> Result<bool> {
        let shared = &self.store.shared;
        let mut state = shared.state.lock();
        self.check_alive(&state)?;
        let unblocked = match state.clients.get_mut(&client_id) {
            Some(client) if client.active_reads > 0 && !client.unblock_requested => {
                client.unblock_requested = true;
                true
            }
            _ => false,
        };
        if unblocked {
            state.unblocks += 1;
            drop(state);
            shared.changed.notify_all();
        }
        Ok(unblocked)
    }

    fn client_id(&mut self) -> Result<u64> {
        let state = self.store.shared.state.lock();
        self.check_alive(&state)?;
        Ok(self.id)
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let mut state = self.store.shared.state.lock();
        self.check_alive(&state)?;
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.name = Some(name.to_string());
        }
        Ok(())
    }

    fn client_list(&mut self) -> Result<Vec<ClientInfo>> {
        let state = self.store.shared.state.lock();
        self.check_alive(&state)?;
        let mut clients: Vec<ClientInfo> = state
            .clients
            .iter()
            .filter(|(_, c)| !c.killed)
            .map(|(id, c)| ClientInfo {
                id: *id,
                name: c.name.clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        Ok(clients)
    }

    fn last_entry_id(&mut self, stream: &str) -> Result<Option<EntryId>> {
        let state = self.store.shared.state.lock();
        self.check_alive(&state)?;
        Ok(state.last_id(stream))
    }

    fn close(&mut self) -> Result<()> {
        self.store.shared.state.lock().clients.remove(&self.id);
        self.store.shared.changed.notify_all();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store.shared.state.lock().clients.remove(&self.id);
    }
}
