//! The single blocking-read loop.
//!
//! One thread per multiplexer repeatedly snapshots the registry, issues one
//! blocking read covering every tracked stream, advances cursors and fans
//! the result out. The loop is an explicit state machine:
//!
//! ```text
//!            first subscribe / connect
//!   Idle ───────────────────────────────► Blocked ◄──────┐
//!    ▲                                      │             │ read returned:
//!    │ registry empty, stop,                │ read set    │ process data,
//!    │ or connection lost                   │ changed     │ re-snapshot
//!    │                                      ▼             │
//!    └──────────────────────────────────── Draining ──────┘
//! ```
//!
//! A read set change while `Blocked` sends `CLIENT UNBLOCK` for the read
//! connection over the write connection. Whatever the interrupted read
//! returned is processed like a normal return before the next snapshot.
//!
//! Handing a batch to a subscriber never blocks the loop: multiplexer
//! subscriptions sit behind their own delivery queue, and a full queue is
//! reported as a handler failure.

use crate::config::{MultiplexerConfig, ReconnectPolicy};
use crate::connection::ConnectionManager;
use crate::error::MuxError;
use crate::events::EventBus;
use crate::store::StreamEntries;
use crate::subscriptions::{decode_batch, dispatch, SubscriptionRegistry};
use crate::types::{EntryId, MuxEvent, MuxStats, PayloadEncoding};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest single sleep while waiting out a backoff, so `stop` stays responsive.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Where the loop is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPhase {
    /// Not running.
    Idle,
    /// Running; a blocking read is in flight or about to be issued.
    Blocked,
    /// Interrupt requested; waiting for the in-flight read to return.
    Draining,
}

struct Control {
    phase: LoopPhase,
    /// Incremented for every read cycle.
    cycle: u64,
    /// True from snapshot until the read returns.
    in_flight: bool,
    stop: bool,
    thread: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Drives blocking reads for every subscribed stream.
pub struct ReadLoop {
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    events: Arc<EventBus>,
    stats: Arc<Mutex<MuxStats>>,

    blocking_timeout_ms: u64,
    encoding: PayloadEncoding,
    interrupt_retries: u32,
    reconnect: ReconnectPolicy,

    control: Mutex<Control>,
}

impl ReadLoop {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<ConnectionManager>,
        events: Arc<EventBus>,
        stats: Arc<Mutex<MuxStats>>,
        config: &MultiplexerConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            events,
            stats,
            blocking_timeout_ms: config.blocking_timeout_ms(),
            encoding: config.payload_encoding,
            interrupt_retries: config.interrupt_retries,
            reconnect: config.reconnect.clone(),
            control: Mutex::new(Control {
                phase: LoopPhase::Idle,
                cycle: 0,
                in_flight: false,
                stop: false,
                thread: None,
                supervisor: None,
            }),
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.control.lock().phase
    }

    /// Clear a previous `stop` and start the loop if there is work.
    pub fn resume(self: &Arc<Self>) {
        self.control.lock().stop = false;
        self.ensure_running();
    }

    /// Start the loop thread unless it is already running, stopped, or has
    /// nothing to read.
    pub fn ensure_running(self: &Arc<Self>) {
        let mut control = self.control.lock();
        if control.phase != LoopPhase::Idle
            || control.stop
            || self.registry.is_empty()
            || !self.connections.is_connected()
        {
            return;
        }
        if let Some(finished) = control.thread.take() {
            // Already past its last cycle; joining only reaps it.
            let _ = finished.join();
        }

        control.phase = LoopPhase::Blocked;
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("streammux-read".into())
            .spawn(move || this.run());
        match spawned {
            Ok(handle) => {
                debug!("read loop started");
                control.thread = Some(handle);
            }
            Err(e) => {
                error!(error = %e, "failed to spawn read loop");
                control.phase = LoopPhase::Idle;
            }
        }
    }

    /// React to a change of the registry's stream set.
    pub fn on_read_set_changed(self: &Arc<Self>) {
        let cycle = {
            let mut control = self.control.lock();
            match control.phase {
                LoopPhase::Idle => None,
                LoopPhase::Draining => return,
                LoopPhase::Blocked => {
                    control.phase = LoopPhase::Draining;
                    Some(control.cycle)
                }
            }
        };
        match cycle {
            None => self.ensure_running(),
            Some(cycle) => self.interrupt(cycle),
        }
    }

    /// Unblock the read of `cycle`, retrying while the read has not reached
    /// the store yet.
    fn interrupt(&self, cycle: u64) {
        for attempt in 0..self.interrupt_retries.max(1) {
            {
                let control = self.control.lock();
                if control.cycle != cycle || !control.in_flight {
                    // The read returned on its own; the next cycle re-snapshots.
                    if attempt > 0 {
                        // An earlier unblock found nothing to cancel.
                        self.stats.lock().cancel_races += 1;
                    }
                    debug!(cycle, attempt, "interrupt not needed");
                    return;
                }
            }
            match self.connections.interrupt() {
                Ok(true) => {
                    debug!(cycle, attempt, "blocking read interrupted");
                    self.stats.lock().interrupts_sent += 1;
                    return;
                }
                Ok(false) => {
                    thread::sleep(Duration::from_millis(1 + attempt.min(9) as u64));
                }
                Err(e) => {
                    warn!(error = %e, "could not interrupt blocking read");
                    return;
                }
            }
        }
        warn!(cycle, "blocking read did not block in time; change applies after timeout");
    }

    /// Stop the loop and any reconnect attempt, interrupting an in-flight
    /// read. Returns once the loop thread has exited.
    pub fn stop(&self) {
        let (cycle, in_flight, thread, supervisor) = {
            let mut control = self.control.lock();
            control.stop = true;
            (
                control.cycle,
                control.in_flight,
                control.thread.take(),
                control.supervisor.take(),
            )
        };
        if in_flight {
            self.interrupt(cycle);
        }
        for handle in [thread, supervisor].into_iter().flatten() {
            if handle.thread().id() == thread::current().id() {
                // Stop requested from the loop thread itself; it exits after this cycle.
                continue;
            }
            let _ = handle.join();
        }
        debug!("read loop stopped");
    }

    fn run(self: Arc<Self>) {
        loop {
            let cycle = {
                let mut control = self.control.lock();
                if control.stop || self.registry.is_empty() {
                    control.phase = LoopPhase::Idle;
                    break;
                }
                if !self.connections.is_connected() {
                    control.phase = LoopPhase::Idle;
                    self.spawn_supervisor(&mut control);
                    break;
                }
                control.phase = LoopPhase::Blocked;
                control.cycle += 1;
                control.in_flight = true;
                control.cycle
            };

            let result = self.connections.with_reader(|reader| {
                let mut cursors = self.registry.snapshot();
                for (stream, cursor) in cursors.iter_mut() {
                    if cursor.is_latest() {
                        let last = reader.last_entry_id(stream)?.unwrap_or(EntryId::ZERO);
                        self.registry.resolve_latest(stream, last);
                        *cursor = last;
                    }
                }
                if cursors.is_empty() {
                    return Ok(None);
                }
                debug!(cycle, streams = cursors.len(), "issuing blocking read");
                self.stats.lock().reads_issued += 1;
                reader.blocking_read(&cursors, self.blocking_timeout_ms)
            });

            {
                let mut control = self.control.lock();
                control.in_flight = false;
                if control.phase == LoopPhase::Draining {
                    debug!(cycle, "read returned after interrupt");
                }
            }

            match result {
                Ok(Some(streams)) => self.process(streams),
                Ok(None) => {}
                Err(e) if e.is_connection_loss() || matches!(e, MuxError::NotConnected) => {
                    let reason = e.to_string();
                    self.connections.mark_disconnected(&reason);
                    self.events.emit(MuxEvent::ReadLoopStopped { reason });
                }
                Err(e) => {
                    warn!(error = %e, "blocking read failed");
                    self.sleep_unless_stopped(self.reconnect.initial_backoff);
                }
            }
        }
        debug!("read loop exited");
    }

    /// Advance cursors and enqueue one read result for every handler.
    fn process(&self, streams: Vec<StreamEntries>) {
        for StreamEntries { stream, entries } in streams {
            let (batch, decode_failures) = decode_batch(&stream, &entries, self.encoding);
            for entry in &entries {
                self.registry.advance(&stream, entry.id);
            }

            let handlers = self.registry.handlers(&stream);
            let report = if batch.is_empty() || handlers.is_empty() {
                Default::default()
            } else {
                dispatch(&batch, &handlers)
            };

            {
                let mut stats = self.stats.lock();
                stats.decode_failures += decode_failures as u64;
                stats.handler_failures += report.failures.len() as u64;
                if report.delivered > 0 || !report.failures.is_empty() {
                    stats.batches_delivered += 1;
                    stats.entries_delivered += batch.len() as u64;
                }
            }

            for failure in report.failures {
                self.events.emit(MuxEvent::HandlerFailed {
                    stream: stream.clone(),
                    subscription: failure.subscription,
                    message: failure.message,
                });
            }
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, control: &mut Control) {
        if !self.reconnect.is_enabled() || control.supervisor.is_some() {
            return;
        }
        let this = Arc::clone(self);
        match thread::Builder::new()
            .name("streammux-reconnect".into())
            .spawn(move || this.reconnect_with_backoff())
        {
            Ok(handle) => control.supervisor = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn reconnect supervisor"),
        }
    }

    /// Reconnect with exponential backoff, then resume from stored cursors.
    fn reconnect_with_backoff(self: Arc<Self>) {
        for attempt in 0..self.reconnect.max_attempts {
            let backoff = self.reconnect.backoff(attempt);
            if !self.sleep_unless_stopped(backoff) {
                break;
            }
            self.connections.close_all();
            match self.connections.connect() {
                Ok(()) => {
                    info!(attempt, "reconnected, resuming reads");
                    {
                        let mut control = self.control.lock();
                        if control.stop {
                            break;
                        }
                        control.supervisor = None;
                    }
                    self.ensure_running();
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
        let mut control = self.control.lock();
        if !control.stop {
            error!("giving up reconnecting");
        }
        // Leave the handle in place only if stop() has not taken it.
        if control.supervisor.as_ref().map(|h| h.thread().id()) == Some(thread::current().id()) {
            control.supervisor = None;
        }
    }

    /// Sleep for `duration` in short steps. Returns false if stopped meanwhile.
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.control.lock().stop {
                return false;
            }
            let step = remaining.min(STOP_POLL);
            thread::sleep(step);
            remaining -= step;
        }
        !self.control.lock().stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscriptions::{BatchHandler, HandlerResult};
    use crate::types::Batch;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    struct Fixture {
        store: MemoryStore,
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<ConnectionManager>,
        read_loop: Arc<ReadLoop>,
        stats: Arc<Mutex<MuxStats>>,
    }

    fn test_config(blocking_timeout: Duration) -> MultiplexerConfig {
        MultiplexerConfig {
            blocking_timeout,
            reconnect: ReconnectPolicy::disabled(),
            ..MultiplexerConfig::with_endpoints_str("localhost:6379")
        }
    }

    fn fixture(blocking_timeout: Duration) -> Fixture {
        fixture_with(test_config(blocking_timeout))
    }

    fn fixture_with(config: MultiplexerConfig) -> Fixture {
        let store = MemoryStore::new();
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(store.connector()),
            &config,
            Arc::clone(&events),
        ));
        connections.connect().unwrap();
        let stats = Arc::new(Mutex::new(MuxStats::default()));
        let read_loop = Arc::new(ReadLoop::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            events,
            Arc::clone(&stats),
            &config,
        ));
        Fixture {
            store,
            registry,
            connections,
            read_loop,
            stats,
        }
    }

    /// Mark cycle 1 as in flight without issuing a read.
    fn pretend_in_flight(read_loop: &ReadLoop) {
        let mut control = read_loop.control.lock();
        control.cycle = 1;
        control.in_flight = true;
        control.phase = LoopPhase::Draining;
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn channel_handler() -> (Arc<dyn BatchHandler>, crossbeam_channel::Receiver<Batch>) {
        let (tx, rx) = unbounded();
        let handler: Arc<dyn BatchHandler> = Arc::new(move |b: &Batch| -> HandlerResult {
            tx.send(b.clone())?;
            Ok(())
        });
        (handler, rx)
    }

    #[test]
    fn test_idle_until_first_subscription() {
        let f = fixture(Duration::from_secs(10));
        f.read_loop.ensure_running();
        assert_eq!(f.read_loop.phase(), LoopPhase::Idle);

        let (handler, _rx) = channel_handler();
        f.registry.subscribe("a", EntryId::Latest, handler);
        f.read_loop.on_read_set_changed();
        wait_for(|| !f.store.blocked_clients().is_empty());
        assert_eq!(f.read_loop.phase(), LoopPhase::Blocked);

        f.read_loop.stop();
        assert_eq!(f.read_loop.phase(), LoopPhase::Idle);
    }

    #[test]
    fn test_delivers_and_advances_cursor() {
        let f = fixture(Duration::from_secs(10));
        let (handler, rx) = channel_handler();
        f.registry.subscribe("a", EntryId::ZERO, handler);
        f.read_loop.on_read_set_changed();

        let id = f.store.append("a", "T", b"{\"n\":1}").unwrap();
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.last_id(), Some(id));
        wait_for(|| f.registry.cursor("a") == Some(id));

        f.read_loop.stop();
    }

    #[test]
    fn test_change_interrupts_long_read() {
        let f = fixture(Duration::from_secs(30));
        let (handler_a, _rx_a) = channel_handler();
        f.registry.subscribe("a", EntryId::ZERO, handler_a);
        f.read_loop.on_read_set_changed();
        wait_for(|| !f.store.blocked_clients().is_empty());

        let started = Instant::now();
        let (handler_b, rx_b) = channel_handler();
        f.registry.subscribe("b", EntryId::ZERO, handler_b);
        f.read_loop.on_read_set_changed();

        wait_for(|| {
            f.store
                .reads()
                .last()
                .map(|r| r.cursors.len() == 2)
                .unwrap_or(false)
        });
        assert!(started.elapsed() < Duration::from_secs(5));

        f.store.append("b", "T", b"1").unwrap();
        assert!(rx_b.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(f.store.unblock_count() >= 1);

        f.read_loop.stop();
    }

    #[test]
    fn test_exits_when_registry_empties() {
        let f = fixture(Duration::from_secs(30));
        let (handler, _rx) = channel_handler();
        let reg = f.registry.subscribe("a", EntryId::ZERO, handler);
        f.read_loop.on_read_set_changed();
        wait_for(|| !f.store.blocked_clients().is_empty());

        f.registry.unsubscribe("a", reg.id);
        f.read_loop.on_read_set_changed();
        wait_for(|| f.read_loop.phase() == LoopPhase::Idle);
        assert!(f.store.blocked_clients().is_empty());
    }

    #[test]
    fn test_connection_loss_goes_idle_without_advancing() {
        let f = fixture(Duration::from_secs(30));
        let (handler, _rx) = channel_handler();
        f.registry.subscribe("a", EntryId::new(7, 0), handler);
        f.read_loop.on_read_set_changed();
        wait_for(|| !f.store.blocked_clients().is_empty());

        f.store.kill_all_clients();
        wait_for(|| f.read_loop.phase() == LoopPhase::Idle);
        assert!(!f.connections.is_connected());
        assert_eq!(f.registry.cursor("a"), Some(EntryId::new(7, 0)));
    }

    #[test]
    fn test_unanswered_interrupt_is_not_a_cancel_race() {
        let f = fixture_with(MultiplexerConfig {
            interrupt_retries: 3,
            ..test_config(Duration::from_secs(10))
        });
        pretend_in_flight(&f.read_loop);

        f.read_loop.interrupt(1);

        let stats = f.stats.lock().clone();
        assert_eq!(stats.cancel_races, 0);
        assert_eq!(stats.interrupts_sent, 0);
        assert_eq!(f.store.unblock_count(), 0);
    }

    #[test]
    fn test_cycle_ending_during_retries_counts_one_race() {
        let f = fixture_with(MultiplexerConfig {
            interrupt_retries: 50,
            ..test_config(Duration::from_secs(10))
        });
        pretend_in_flight(&f.read_loop);

        let read_loop = Arc::clone(&f.read_loop);
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            read_loop.control.lock().in_flight = false;
        });
        f.read_loop.interrupt(1);
        finisher.join().unwrap();

        let stats = f.stats.lock().clone();
        assert_eq!(stats.cancel_races, 1);
        assert_eq!(stats.interrupts_sent, 0);
    }
}
