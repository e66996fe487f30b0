//! Multiplexer configuration.

use crate::types::{Endpoint, PayloadEncoding};
use std::time::Duration;

/// Environment variable read by [`MultiplexerConfig::from_env`].
pub const ENDPOINTS_ENV: &str = "REDIS_URIS";

/// Multiplexer configuration.
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Candidate store endpoints. One is picked at random on connect.
    pub endpoints: Vec<Endpoint>,

    /// Connect while constructing the multiplexer.
    /// Default: true
    pub auto_connect: bool,

    /// How long one blocking read waits for new entries.
    /// Default: 5s
    pub blocking_timeout: Duration,

    /// Payload encoding for publish and decode.
    pub payload_encoding: PayloadEncoding,

    /// TCP connect and handshake timeout.
    /// Default: 5s
    pub connect_timeout: Duration,

    /// Max attempts to interrupt a blocked read after the read set changes.
    /// Default: 50
    pub interrupt_retries: u32,

    /// Reconnect behaviour after the read connection drops.
    pub reconnect: ReconnectPolicy,

    /// Queue size per subscription, in batches.
    /// Default: 1000
    pub handler_buffer: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            auto_connect: true,
            blocking_timeout: Duration::from_millis(5000),
            payload_encoding: PayloadEncoding::Json,
            connect_timeout: Duration::from_secs(5),
            interrupt_retries: 50,
            reconnect: ReconnectPolicy::default(),
            handler_buffer: 1000,
        }
    }
}

impl MultiplexerConfig {
    /// Configuration with endpoints parsed from a `host:port,host:port` list.
    pub fn with_endpoints_str(endpoints: &str) -> Self {
        Self {
            endpoints: Endpoint::parse_list(endpoints),
            ..Default::default()
        }
    }

    /// Configuration with endpoints taken from `REDIS_URIS`.
    pub fn from_env() -> Self {
        let endpoints = std::env::var(ENDPOINTS_ENV).unwrap_or_default();
        Self::with_endpoints_str(&endpoints)
    }

    /// Blocking timeout in whole milliseconds, as sent to the store.
    pub fn blocking_timeout_ms(&self) -> u64 {
        self.blocking_timeout.as_millis().max(1) as u64
    }
}

/// Exponential backoff for reconnect attempts.
///
/// Attempt `n` (0-based) waits `initial_backoff * multiplier^n`, capped at
/// `max_backoff`.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Backoff before the given attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}
