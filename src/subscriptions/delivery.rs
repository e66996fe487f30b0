//! Per-subscription delivery workers.
//!
//! The read loop never runs user handlers itself. Each registration made
//! through the multiplexer gets a bounded queue drained by its own worker
//! thread, so a slow or stuck handler only delays its own batches.

use super::dispatch::dispatch;
use super::types::{BatchHandler, HandlerResult, RegisteredHandler};
use crate::error::Result;
use crate::events::EventBus;
use crate::types::{Batch, MuxEvent, MuxStats, SubscriptionId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Where a delivery worker reports handler failures.
#[derive(Clone)]
pub struct FailureSink {
    pub events: Arc<EventBus>,
    pub stats: Arc<Mutex<MuxStats>>,
}

/// Enqueues batches for a handler running on its own worker thread.
///
/// The worker exits once every clone of the queue's sender is gone, that is
/// after the registration is removed and in-flight batches are drained.
pub struct QueuedHandler {
    sender: Sender<Batch>,
}

impl QueuedHandler {
    /// Spawn the worker for `handler`, registered on `stream` as `id`.
    pub fn spawn(
        stream: &str,
        id: SubscriptionId,
        handler: Arc<dyn BatchHandler>,
        capacity: usize,
        sink: FailureSink,
    ) -> Result<Self> {
        let (sender, receiver) = bounded(capacity.max(1));
        let stream = stream.to_string();
        thread::Builder::new()
            .name(format!("streammux-deliver-{}", id.0))
            .spawn(move || deliver(stream, RegisteredHandler { id, handler }, receiver, sink))?;
        Ok(Self { sender })
    }
}

impl BatchHandler for QueuedHandler {
    fn on_batch(&self, batch: &Batch) -> HandlerResult {
        match self.sender.try_send(batch.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err("delivery queue full".into()),
            Err(TrySendError::Disconnected(_)) => Err("delivery worker stopped".into()),
        }
    }
}

fn deliver(stream: String, registered: RegisteredHandler, receiver: Receiver<Batch>, sink: FailureSink) {
    let handlers = [registered];
    for batch in receiver.iter() {
        let report = dispatch(&batch, &handlers);
        for failure in report.failures {
            sink.stats.lock().handler_failures += 1;
            sink.events.emit(MuxEvent::HandlerFailed {
                stream: stream.clone(),
                subscription: failure.subscription,
                message: failure.message,
            });
        }
    }
    debug!(stream = %stream, subscription = handlers[0].id.0, "delivery worker exited");
}
