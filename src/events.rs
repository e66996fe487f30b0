//! Status event broadcasting.

use crate::types::MuxEvent;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Fans status events out to every watcher. Watchers whose receiver was
/// dropped are removed on the next emit.
#[derive(Default)]
pub struct EventBus {
    watchers: Mutex<Vec<Sender<MuxEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self) -> Receiver<MuxEvent> {
        let (sender, receiver) = unbounded();
        self.watchers.lock().push(sender);
        receiver
    }

    pub fn emit(&self, event: MuxEvent) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| w.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionState;

    #[test]
    fn test_emit_reaches_all_and_prunes_dropped() {
        let bus = EventBus::new();
        let a = bus.watch();
        let b = bus.watch();
        drop(b);

        bus.emit(MuxEvent::StateChanged {
            state: ConnectionState::Connected,
        });

        assert_eq!(
            a.try_recv().unwrap(),
            MuxEvent::StateChanged {
                state: ConnectionState::Connected
            }
        );
        assert_eq!(bus.watchers.lock().len(), 1);
    }
}
