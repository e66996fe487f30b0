//! Subscription bookkeeping and fan-out.
//!
//! This module holds everything the read loop needs to know about who is
//! listening:
//! - The reference-counted registry of streams and their cursors
//! - Handler types, including a bounded channel handler
//! - Decoding of raw entries and ordered, failure-isolated delivery
//! - Per-subscription delivery queues with their own worker threads
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let (handler, receiver) = ChannelHandler::bounded(100);
//! let registration = registry.subscribe("orders", EntryId::Latest, Arc::new(handler));
//!
//! // The read loop builds its next request from the snapshot.
//! for (stream, cursor) in registry.snapshot() {
//!     println!("{} from {}", stream, cursor);
//! }
//! ```

mod delivery;
mod dispatch;
mod registry;
mod types;

pub use delivery::{FailureSink, QueuedHandler};
pub use dispatch::{decode_batch, dispatch, DeliveryReport, HandlerFailure};
pub use registry::{Registration, SubscriptionRegistry, Unsubscribed};
pub use types::{
    BatchHandler, BatchReceiver, ChannelHandler, HandlerError, HandlerResult, RegisteredHandler,
};
