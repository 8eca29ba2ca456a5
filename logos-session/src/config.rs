//! Tunable timing and capacity knobs for a session.
//!
//! None of these values are load-bearing; they only trade latency against
//! traffic. Durations serialize as whole milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on how long a waiter takes to notice a cancellation
    /// that raced an acknowledgement signal.
    #[serde(with = "duration_ms")]
    pub poll_quantum: Duration,
    /// Pause between reconnect attempts after an unexpected link loss.
    #[serde(with = "duration_ms")]
    pub reconnect_backoff: Duration,
    /// Default bound for `stop` when the caller passes no timeout.
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,
    /// Activities held per peer while waiting for a gap to close.
    pub max_out_of_order: usize,
    /// A gap open longer than this is skipped by `release_stale`.
    #[serde(with = "duration_ms")]
    pub gap_timeout: Duration,
    /// Authority checksum broadcast period.
    #[serde(with = "duration_ms")]
    pub checksum_interval: Duration,
    /// Consecutive checksum cycles a unit may lag or lead the authority's
    /// revision before it is compared anyway.
    pub checksum_grace_cycles: u32,
    /// How long a client waits for authoritative content during recovery.
    #[serde(with = "duration_ms")]
    pub content_fetch_timeout: Duration,
    /// Start recovery automatically when a mismatch is observed.
    pub auto_recover: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_quantum: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
            max_out_of_order: 256,
            gap_timeout: Duration::from_secs(10),
            checksum_interval: Duration::from_secs(2),
            checksum_grace_cycles: 2,
            content_fetch_timeout: Duration::from_secs(10),
            auto_recover: true,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
