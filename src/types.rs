//! Core types for the multiplexer.

use crate::error::{MuxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position within a stream.
///
/// `Latest` is the `$` pseudo-cursor ("only entries appended from now on").
/// It sorts before every concrete id so that any resolved position counts as
/// progress.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntryId {
    Latest,
    Id { ms: u64, seq: u64 },
}

impl EntryId {
    /// The position before the first entry of any stream.
    pub const ZERO: EntryId = EntryId::Id { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        EntryId::Id { ms, seq }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, EntryId::Latest)
    }

    /// Smallest id strictly greater than this one.
    pub fn next(self) -> Self {
        match self {
            EntryId::Latest => EntryId::ZERO,
            EntryId::Id { ms, seq } if seq == u64::MAX => EntryId::Id { ms: ms + 1, seq: 0 },
            EntryId::Id { ms, seq } => EntryId::Id { ms, seq: seq + 1 },
        }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Latest => write!(f, "$"),
            EntryId::Id { ms, seq } => write!(f, "{}-{}", ms, seq),
        }
    }
}

impl FromStr for EntryId {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "$" {
            return Ok(EntryId::Latest);
        }
        let invalid = || MuxError::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(EntryId::Id { ms, seq })
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for EntryId {
    type Error = MuxError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// A store endpoint (`host:port`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a single `host:port` pair. Returns `None` if either half is
    /// missing or the port is not a number.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse::<u16>().ok()?;
        Some(Self::new(host, port))
    }

    /// Parse a comma-separated list, dropping malformed entries.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',').filter_map(Self::parse).collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connectivity of the multiplexer's store connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
}

/// Payload encoding used on publish and expected on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Json,
    MessagePack,
}

impl Default for PayloadEncoding {
    fn default() -> Self {
        PayloadEncoding::Json
    }
}

impl PayloadEncoding {
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>> {
        match self {
            PayloadEncoding::Json => Ok(serde_json::to_vec(payload)?),
            PayloadEncoding::MessagePack => Ok(rmp_serde::to_vec_named(payload)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        match self {
            PayloadEncoding::Json => serde_json::from_slice(bytes)
                .map_err(|e| MuxError::Deserialization(e.to_string())),
            PayloadEncoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// A decoded stream entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Store-assigned id.
    pub id: EntryId,

    /// Application-defined type (the entry's field name).
    pub entry_type: String,

    /// Decoded payload.
    pub payload: serde_json::Value,
}

/// Entries delivered together for one stream in one read cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub stream: String,
    pub entries: Vec<Entry>,
}

impl Batch {
    /// Id of the last entry in the batch.
    pub fn last_id(&self) -> Option<EntryId> {
        self.entries.last().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Unique identifier for one subscription registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Status events observable through `Multiplexer::watch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MuxEvent {
    /// Connection state changed.
    StateChanged { state: ConnectionState },

    /// A handler returned an error or panicked.
    HandlerFailed {
        stream: String,
        subscription: SubscriptionId,
        message: String,
    },

    /// The read loop lost its connection.
    ReadLoopStopped { reason: String },
}

/// Counters maintained by the read loop and publisher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub reads_issued: u64,
    pub interrupts_sent: u64,
    pub cancel_races: u64,
    pub batches_delivered: u64,
    pub entries_delivered: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub entries_published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_id_parse_and_display() {
        let id: EntryId = "1526919030474-55".parse().unwrap();
        assert_eq!(id, EntryId::new(1526919030474, 55));
        assert_eq!(id.to_string(), "1526919030474-55");

        assert_eq!("$".parse::<EntryId>().unwrap(), EntryId::Latest);
        assert_eq!("0".parse::<EntryId>().unwrap(), EntryId::ZERO);
        assert!(matches!(
            "abc-1".parse::<EntryId>(),
            Err(MuxError::InvalidEntryId(_))
        ));
    }

    #[test]
    fn test_entry_id_ordering() {
        assert!(EntryId::Latest < EntryId::ZERO);
        assert!(EntryId::new(1, 9) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 1) > EntryId::new(2, 0));
        assert_eq!(EntryId::new(5, u64::MAX).next(), EntryId::new(6, 0));
    }

    #[test]
    fn test_entry_id_serde_as_string() {
        let encoded = serde_json::to_string(&EntryId::new(3, 4)).unwrap();
        assert_eq!(encoded, "\"3-4\"");
        let decoded: EntryId = serde_json::from_str("\"$\"").unwrap();
        assert_eq!(decoded, EntryId::Latest);
    }

    #[test]
    fn test_endpoint_list_drops_malformed() {
        let endpoints = Endpoint::parse_list("redis-a:6379,broken,:7000,redis-b:x, redis-c:6380");
        assert_eq!(
            endpoints,
            vec![Endpoint::new("redis-a", 6379), Endpoint::new("redis-c", 6380)]
        );
        assert!(Endpoint::parse_list("").is_empty());
    }

    #[test]
    fn test_payload_encodings() {
        let payload = json!({"id": 1, "tags": ["a", "b"]});

        let bytes = PayloadEncoding::Json.encode(&payload).unwrap();
        assert_eq!(PayloadEncoding::Json.decode(&bytes).unwrap(), payload);

        let bytes = PayloadEncoding::MessagePack.encode(&payload).unwrap();
        assert_eq!(PayloadEncoding::MessagePack.decode(&bytes).unwrap(), payload);

        assert!(PayloadEncoding::Json.decode(b"{not json").is_err());
    }
}
