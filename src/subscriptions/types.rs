//! Subscription handler types.

use crate::types::{Batch, SubscriptionId};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;

/// Error returned by a handler. Reported, never propagated into the read loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Receives every batch read for the stream it is registered on.
///
/// Handlers run on the read loop thread, so a slow handler delays delivery
/// for every stream. Use [`ChannelHandler`] to hand batches off instead.
pub trait BatchHandler: Send + Sync {
    fn on_batch(&self, batch: &Batch) -> HandlerResult;
}

impl<F> BatchHandler for F
where
    F: Fn(&Batch) -> HandlerResult + Send + Sync,
{
    fn on_batch(&self, batch: &Batch) -> HandlerResult {
        self(batch)
    }
}

/// A registered handler together with its registration id.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub id: SubscriptionId,
    pub handler: Arc<dyn BatchHandler>,
}

/// Forwards batches into a bounded channel without blocking the read loop.
///
/// A full buffer fails the delivery (reported as a handler failure) instead
/// of stalling other subscribers.
pub struct ChannelHandler {
    sender: Sender<Batch>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its buffer.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Batch>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl BatchHandler for ChannelHandler {
    fn on_batch(&self, batch: &Batch) -> HandlerResult {
        match self.sender.try_send(batch.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err("subscriber buffer full".into()),
            Err(TrySendError::Disconnected(_)) => Err("subscriber receiver dropped".into()),
        }
    }
}

/// Receiving side of a channel subscription.
pub struct BatchReceiver {
    pub receiver: Receiver<Batch>,
}

impl BatchReceiver {
    /// Receive the next batch (blocking).
    pub fn recv(&self) -> Result<Batch, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a batch (non-blocking).
    pub fn try_recv(&self) -> Result<Batch, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Batch, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, EntryId};
    use serde_json::json;

    fn batch() -> Batch {
        Batch {
            stream: "orders".into(),
            entries: vec![Entry {
                id: EntryId::new(1, 0),
                entry_type: "CREATED".into(),
                payload: json!({"id": 1}),
            }],
        }
    }

    #[test]
    fn test_closure_handler() {
        let handler = |b: &Batch| -> HandlerResult {
            if b.is_empty() {
                Err("empty".into())
            } else {
                Ok(())
            }
        };
        assert!(handler.on_batch(&batch()).is_ok());
    }

    #[test]
    fn test_channel_handler_overflow() {
        let (handler, receiver) = ChannelHandler::bounded(1);
        assert!(handler.on_batch(&batch()).is_ok());
        assert!(handler.on_batch(&batch()).is_err());

        let receiver = BatchReceiver { receiver };
        assert_eq!(receiver.try_recv().unwrap().stream, "orders");
        drop(receiver);
        assert!(handler.on_batch(&batch()).is_err());
    }
}
