//! # Stream Multiplexer
//!
//! Many in-process subscribers share one connection's blocking read over a
//! Redis Streams style log store.
//!
//! ## Core Concepts
//!
//! - **Registry**: Reference-counted streams, each with a cursor and handlers
//! - **Read loop**: At most one outstanding blocking read, interrupted when
//!   the set of streams changes
//! - **Dispatch**: Every batch goes to each handler of its stream, in order
//!   per handler, through a bounded queue drained by that handler's own
//!   worker thread
//! - **Connections**: A dedicated read connection and a write connection used
//!   for publishing and for unblocking the reader
//!
//! ## Example
//!
//! ```ignore
//! use streammux::{EntryId, Multiplexer, MultiplexerConfig};
//! use serde_json::json;
//!
//! let mux = Multiplexer::open(MultiplexerConfig::from_env())?;
//!
//! // Deliver everything appended from now on
//! let orders = mux.subscribe("orders", EntryId::Latest, |batch| {
//!     for entry in &batch.entries {
//!         println!("{} {} {}", entry.id, entry.entry_type, entry.payload);
//!     }
//!     Ok(())
//! })?;
//!
//! mux.publish("orders", "CREATED", &json!({"id": 42}))?;
//!
//! orders.unsubscribe();
//! mux.disconnect();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod publisher;
pub mod read_loop;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{MultiplexerConfig, ReconnectPolicy, ENDPOINTS_ENV};
pub use error::{MuxError, Result};
pub use multiplexer::{Multiplexer, Subscription};
pub use read_loop::LoopPhase;
pub use store::{
    Connector, MemoryConnection, MemoryConnector, MemoryStore, RawEntry, ReadRecord, READ_LOG_CAPACITY,
    StoreConnection, StreamEntries, TcpConnection, TcpConnector,
};
pub use subscriptions::{
    BatchHandler, BatchReceiver, ChannelHandler, HandlerError, HandlerResult,
};
pub use types::*;
