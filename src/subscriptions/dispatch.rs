//! Decoding of read results and fan-out to handlers.

use super::types::RegisteredHandler;
use crate::error::MuxError;
use crate::store::RawEntry;
use crate::types::{Batch, Entry, PayloadEncoding, SubscriptionId};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// A handler that failed while receiving a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub message: String,
}

/// Outcome of delivering one batch.
#[derive(Clone, Debug, Default)]
pub struct DeliveryReport {
    /// Handlers that accepted the batch.
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

/// Decode raw entries of one stream into a batch.
///
/// Each entry carries a single `type -> payload` field pair. Entries without
/// fields or with undecodable payloads are left out; the count of those is
/// returned alongside the batch.
pub fn decode_batch(stream: &str, raw: &[RawEntry], encoding: PayloadEncoding) -> (Batch, usize) {
    let mut entries = Vec::with_capacity(raw.len());
    let mut failures = 0;

    for entry in raw {
        let Some((entry_type, payload)) = entry.fields.first() else {
            warn!(stream, id = %entry.id, "entry has no fields");
            failures += 1;
            continue;
        };
        match encoding.decode(payload) {
            Ok(payload) => entries.push(Entry {
                id: entry.id,
                entry_type: entry_type.clone(),
                payload,
            }),
            Err(e) => {
                warn!(stream, id = %entry.id, error = %e, "dropping undecodable entry");
                failures += 1;
            }
        }
    }

    (
        Batch {
            stream: stream.to_string(),
            entries,
        },
        failures,
    )
}

/// Deliver `batch` to every handler in order.
///
/// Errors and panics are caught per handler; the remaining handlers still
/// receive the batch.
pub fn dispatch(batch: &Batch, handlers: &[RegisteredHandler]) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for registered in handlers {
        let outcome = catch_unwind(AssertUnwindSafe(|| registered.handler.on_batch(batch)));
        let message = match outcome {
            Ok(Ok(())) => {
                report.delivered += 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
        };

        let error = MuxError::HandlerFailure {
            stream: batch.stream.clone(),
            message: message.clone(),
        };
        warn!(subscription = registered.id.0, %error, "isolated handler failure");
        report.failures.push(HandlerFailure {
            subscription: registered.id,
            message,
        });
    }

    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::{BatchHandler, HandlerResult};
    use crate::types::EntryId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn raw(id: u64, entry_type: &str, payload: &[u8]) -> RawEntry {
        RawEntry {
            id: EntryId::new(id, 0),
            fields: vec![(entry_type.to_string(), payload.to_vec())],
        }
    }

    fn registered(id: u64, handler: Arc<dyn BatchHandler>) -> RegisteredHandler {
        RegisteredHandler {
            id: SubscriptionId(id),
            handler,
        }
    }

    #[test]
    fn test_decode_batch_skips_bad_entries() {
        let entries = vec![
            raw(1, "CREATED", br#"{"id":1}"#),
            raw(2, "BROKEN", b"{oops"),
            RawEntry {
                id: EntryId::new(3, 0),
                fields: vec![],
            },
            raw(4, "SHIPPED", br#"{"id":1}"#),
        ];
        let (batch, failures) = decode_batch("orders", &entries, PayloadEncoding::Json);
        assert_eq!(failures, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.entries[0].entry_type, "CREATED");
        assert_eq!(batch.last_id(), Some(EntryId::new(4, 0)));
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<RegisteredHandler> = (1..=3)
            .map(|n| {
                let order = Arc::clone(&order);
                let handler: Arc<dyn BatchHandler> = Arc::new(move |_: &Batch| -> HandlerResult {
                    order.lock().push(n);
                    Ok(())
                });
                registered(n, handler)
            })
            .collect();

        let (batch, _) = decode_batch("s", &[raw(1, "T", b"1")], PayloadEncoding::Json);
        let report = dispatch(&batch, &handlers);
        assert_eq!(report.delivered, 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dispatch_isolates_failures() {
        let reached = Arc::new(Mutex::new(false));
        let reached_clone = Arc::clone(&reached);
        let handlers = vec![
            registered(1, Arc::new(|_: &Batch| -> HandlerResult { Err("boom".into()) })),
            registered(2, Arc::new(|_: &Batch| -> HandlerResult { panic!("kaboom") })),
            registered(
                3,
                Arc::new(move |_: &Batch| -> HandlerResult {
                    *reached_clone.lock() = true;
                    Ok(())
                }),
            ),
        ];

        let (batch, _) = decode_batch("s", &[raw(1, "T", b"1")], PayloadEncoding::Json);
        let report = dispatch(&batch, &handlers);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].message, "boom");
        assert!(report.failures[1].message.contains("kaboom"));
        assert!(*reached.lock());
    }
}
