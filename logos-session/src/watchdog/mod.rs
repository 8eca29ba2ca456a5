//! Checksum-based divergence detection and repair.
//!
//! ```text
//!             mismatch              freeze confirmed          repair applied
//! CONSISTENT ─────────► SUSPECTED ──────────────────► INCONSISTENT ──────────► CONSISTENT
//!     ▲                    │ checksums match again                │ fetch failed:
//!     └────────────────────┘                                      └─ stays, freeze released
//! ```
//!
//! The authority ([`WatchdogServer`]) broadcasts a [`ChecksumRecord`] per
//! unit. Each client ([`WatchdogClient`]) hashes its own replica, and on a
//! mismatch freezes its local user, fetches the authoritative snapshot,
//! restores it and resumes with the same handle.
//!
//! [`ChecksumRecord`]: crate::protocol::ChecksumRecord

mod client;
mod server;

pub use client::WatchdogClient;
pub use server::WatchdogServer;

use crate::document::DocumentError;
use crate::protocol::UnitId;
use crate::stop::StopError;
use crate::transport::TransportError;

/// Per-unit consistency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyState {
    #[default]
    Consistent,
    /// A checksum mismatch was observed
    Suspected,
    /// The local user is frozen and repair is under way, or repair failed
    Inconsistent,
}

/// Observable watchdog events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyEvent {
    InconsistencyDetected { unit: UnitId },
    RecoveryStarted { unit: UnitId },
    Resolved { unit: UnitId },
    /// Non-fatal; retried on the next checksum cycle
    RecoveryFailed { unit: UnitId, error: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchdogError {
    #[error("Could not freeze local user: {0}")]
    Stop(#[from] StopError),
    #[error("Timed out fetching authoritative content for {0}")]
    FetchTimeout(UnitId),
    #[error("Authority has no content for {0}")]
    ContentUnavailable(UnitId),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Recovery was cancelled")]
    Cancelled,
}
