//! Error handling tests.

use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use streammux::{
    Batch, ConnectionState, EntryId, HandlerResult, MemoryStore, MuxError, Multiplexer,
    MultiplexerConfig, ReconnectPolicy,
};

fn config(endpoints: &str) -> MultiplexerConfig {
    MultiplexerConfig {
        reconnect: ReconnectPolicy::disabled(),
        ..MultiplexerConfig::with_endpoints_str(endpoints)
    }
}

#[test]
fn test_no_endpoints() {
    let store = MemoryStore::new();
    let result = Multiplexer::new(config(""), Arc::new(store.connector()));
    assert!(matches!(result, Err(MuxError::NoEndpointAvailable)));

    let result = Multiplexer::new(config("no-port,:6379,host:notaport"), Arc::new(store.connector()));
    assert!(matches!(result, Err(MuxError::NoEndpointAvailable)));
}

#[test]
fn test_connection_refused() {
    let store = MemoryStore::new();
    store.refuse_connections(true);
    let result = Multiplexer::new(config("localhost:6379"), Arc::new(store.connector()));
    assert!(matches!(result, Err(MuxError::Io(_))));
}

#[test]
fn test_publish_before_connect() {
    let store = MemoryStore::new();
    let mux = Multiplexer::new(
        MultiplexerConfig {
            auto_connect: false,
            ..config("localhost:6379")
        },
        Arc::new(store.connector()),
    )
    .unwrap();

    let result = mux.publish("s", "T", &json!({}));
    assert!(matches!(result, Err(MuxError::NotConnected)));
    assert!(store.entries("s").is_empty());
}

#[test]
fn test_publish_after_disconnect() {
    let store = MemoryStore::new();
    let mux = Multiplexer::new(config("localhost:6379"), Arc::new(store.connector())).unwrap();
    mux.disconnect();

    let result = mux.publish("s", "T", &json!({}));
    assert!(matches!(result, Err(MuxError::NotConnected)));
}

#[test]
fn test_stale_explicit_id() {
    let store = MemoryStore::new();
    let mux = Multiplexer::new(config("localhost:6379"), Arc::new(store.connector())).unwrap();
    mux.publish_with_id("s", "T", &json!(1), EntryId::new(10, 0)).unwrap();

    let result = mux.publish_with_id("s", "T", &json!(2), EntryId::new(10, 0));
    assert!(matches!(result, Err(MuxError::Store(_))));
    assert!(mux.is_connected());
}

#[test]
fn test_invalid_entry_ids() {
    for bad in ["", "abc", "1-", "-1", "1-2-3", "1-x"] {
        assert!(
            matches!(bad.parse::<EntryId>(), Err(MuxError::InvalidEntryId(_))),
            "{:?} should not parse",
            bad
        );
    }
}

#[test]
fn test_connection_loss_without_reconnect() {
    let store = MemoryStore::new();
    let mux = Multiplexer::new(config("localhost:6379"), Arc::new(store.connector())).unwrap();
    let _sub = mux
        .subscribe("s", EntryId::Latest, |_: &Batch| -> HandlerResult { Ok(()) })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.blocked_clients().is_empty() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    store.kill_all_clients();

    while mux.state() != ConnectionState::Disconnected {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(mux.state(), ConnectionState::Disconnected);
    // Subscriptions survive for a later connect.
    assert_eq!(mux.ref_count("s"), 1);
    assert!(matches!(
        mux.publish("s", "T", &json!({})),
        Err(MuxError::NotConnected)
    ));
}
