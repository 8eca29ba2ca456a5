//! # logos-session: consistency core for shared editing sessions
//!
//! Keeps every participant's replica consistent over an unreliable link:
//! freezes and resumes users, detects divergence by checksum and repairs
//! it, and delivers edit activities per peer in order across reconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  stop/start   ┌──────────────────┐
//! │ WatchdogClient   │ ────────────► │ StopManager      │──► ActivityGate
//! │ (per replica)    │               │ + StartHandle    │
//! └────────┬─────────┘               └──────────────────┘
//!          │ checksums / content
//!          ▼
//! ┌──────────────────┐               ┌──────────────────┐
//! │ WatchdogServer   │               │ SequenceTracker  │──► ActivitySink
//! │ (authority)      │               │ (per peer)       │
//! └──────────────────┘               └────────▲─────────┘
//!                                             │ snapshot / reset
//!                                    ┌────────┴─────────┐
//!                                    │ConnectionLifecycle│
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SessionMessage` and identities
//! - [`sequencer`]: ordered, gap-free, duplicate-free delivery per peer
//! - [`stop`]: refcounted freezes and single-use start handles
//! - [`watchdog`]: checksum comparison and recovery (client and authority)
//! - [`connection`]: connection state machine and reconnect loop
//! - [`session`]: explicit wiring of the above
//! - [`transport`]: transport seam and an in-process loopback network
//! - [`document`]: replica seam with byte and yrs implementations

pub mod config;
pub mod connection;
pub mod document;
pub mod listeners;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod stop;
pub mod transport;
pub mod watchdog;

// Re-exports for convenience
pub use config::SessionConfig;
pub use connection::{
    ConnectFuture, ConnectionError, ConnectionEvent, ConnectionLifecycle, ConnectionState, Connector, LinkError,
    SessionHandoff,
};
pub use document::{
    Activity, ActivitySink, ContentHasher, Document, DocumentError, MemoryDocument, Sha256Hasher, YrsDocument,
};
pub use listeners::{ListenerId, Listeners};
pub use protocol::{ChecksumRecord, Envelope, ProtocolError, SessionMessage, UnitId, User, UserId, UserRole};
pub use sequencer::{GapSkip, SequenceError, SequenceTracker, FIRST_SEQUENCE};
pub use session::{Collaborators, Session, SessionError, SessionEvent};
pub use stop::{ActivityGate, FlagGate, StartHandle, StopError, StopEvent, StopManager};
pub use transport::{LoopbackNetwork, LoopbackStats, LoopbackTransport, Transport, TransportError};
pub use watchdog::{ConsistencyEvent, ConsistencyState, WatchdogClient, WatchdogError, WatchdogServer};
