//! Session wire protocol.
//!
//! Every signal the core exchanges is a small structured message: a peer
//! identity, a monotonic integer and/or a hash. Messages are bincode-encoded;
//! framing and delivery belong to the transport.
//!
//! ```text
//! initiator                          target
//!    │ ── StopRequest{handle_id} ──────► │  gate.block()
//!    │ ◄───────────── StopAck{handle_id} │
//!    │ ── StartRequest{handle_id} ─────► │  gate.unblock() when last
//!    │ ◄──────────── StartAck{handle_id} │
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Opaque network identity of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant role. Only consulted when deciding who to freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Driver,
    Observer,
}

/// A session participant. Equality and hashing use `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
}

impl User {
    pub fn new(name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            role,
        }
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: UserId, name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Path identifier of a monitored unit, e.g. a shared file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authority-side checksum of one unit, recomputed every check cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub unit: UnitId,
    pub hash: Vec<u8>,
    /// Authority revision the hash was taken at
    pub revision: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Sequence-stamped edit activity; the payload format is opaque here
    Activity {
        sequence: u64,
        unit: Option<UnitId>,
        payload: Vec<u8>,
    },
    StopRequest { handle_id: Uuid, reason: String },
    StopAck { handle_id: Uuid },
    StartRequest { handle_id: Uuid },
    StartAck { handle_id: Uuid },
    /// Authority checksum broadcast
    Checksums { records: Vec<ChecksumRecord> },
    /// Client tells the authority which units it found divergent
    InconsistencyReport { units: Vec<UnitId> },
    ContentRequest { request_id: Uuid, unit: UnitId },
    ContentResponse {
        request_id: Uuid,
        unit: UnitId,
        content: Vec<u8>,
        revision: u64,
    },
    ContentUnavailable { request_id: Uuid, unit: UnitId },
}

impl SessionMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Activity { .. } => "activity",
            Self::StopRequest { .. } => "stop-request",
            Self::StopAck { .. } => "stop-ack",
            Self::StartRequest { .. } => "start-request",
            Self::StartAck { .. } => "start-ack",
            Self::Checksums { .. } => "checksums",
            Self::InconsistencyReport { .. } => "inconsistency-report",
            Self::ContentRequest { .. } => "content-request",
            Self::ContentResponse { .. } => "content-response",
            Self::ContentUnavailable { .. } => "content-unavailable",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// A message together with the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: UserId,
    pub message: SessionMessage,
}

/// Codec errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
