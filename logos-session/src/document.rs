//! Document collaborator seam.
//!
//! The core never interprets edit payloads. It needs three things from the
//! replica: apply an ordered activity, expose canonical content (hashed for
//! consistency checks) and take or restore a full snapshot (for repair).
//! Conflict resolution of concurrent edits stays inside the replica.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::protocol::{UnitId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Unknown unit: {0}")]
    UnknownUnit(UnitId),
    #[error("Invalid update for {unit}: {reason}")]
    InvalidUpdate { unit: UnitId, reason: String },
}

/// An ordered, deduplicated edit activity handed to the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub unit: Option<UnitId>,
    pub payload: Vec<u8>,
}

/// Receives activities in per-peer order.
pub trait ActivitySink: Send + Sync {
    fn apply(&self, from: UserId, activity: Activity) -> Result<(), DocumentError>;
}

/// Replica access used by the consistency watchdog.
pub trait Document: Send + Sync {
    fn units(&self) -> Vec<UnitId>;

    /// Canonical content; equal replicas yield equal bytes.
    fn content(&self, unit: &UnitId) -> Option<Vec<u8>>;

    /// Number of changes applied to `unit` so far.
    fn revision(&self, unit: &UnitId) -> u64;

    /// Full state suitable for [`Document::restore`]. Defaults to `content`.
    fn snapshot(&self, unit: &UnitId) -> Option<Vec<u8>> {
        self.content(unit)
    }

    /// Replace `unit` atomically with an authoritative snapshot.
    fn restore(&self, unit: &UnitId, snapshot: &[u8], revision: u64) -> Result<(), DocumentError>;
}

/// Pluggable checksum function.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, content: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, content: &[u8]) -> Vec<u8> {
        Sha256::digest(content).to_vec()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory byte replica
// ───────────────────────────────────────────────────────────────────

/// Byte-buffer replica: activities append their payload to the unit.
#[derive(Default)]
pub struct MemoryDocument {
    units: RwLock<BTreeMap<UnitId, (Vec<u8>, u64)>>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a unit locally, bumping its revision.
    pub fn set(&self, unit: UnitId, content: impl Into<Vec<u8>>) {
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let entry = units.entry(unit).or_insert_with(|| (Vec::new(), 0));
        entry.0 = content.into();
        entry.1 += 1;
    }

    /// Change content without touching the revision (simulates silent divergence).
    pub fn corrupt(&self, unit: &UnitId, content: impl Into<Vec<u8>>) {
        if let Some(entry) = self
            .units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(unit)
        {
            entry.0 = content.into();
        }
    }
}

impl ActivitySink for MemoryDocument {
    fn apply(&self, _from: UserId, activity: Activity) -> Result<(), DocumentError> {
        let Some(unit) = activity.unit else {
            return Ok(());
        };
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let entry = units.entry(unit).or_insert_with(|| (Vec::new(), 0));
        entry.0.extend_from_slice(&activity.payload);
        entry.1 += 1;
        Ok(())
    }
}

impl Document for MemoryDocument {
    fn units(&self) -> Vec<UnitId> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn content(&self, unit: &UnitId) -> Option<Vec<u8>> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit)
            .map(|(content, _)| content.clone())
    }

    fn revision(&self, unit: &UnitId) -> u64 {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit)
            .map_or(0, |(_, revision)| *revision)
    }

    fn restore(&self, unit: &UnitId, snapshot: &[u8], revision: u64) -> Result<(), DocumentError> {
        self.units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit.clone(), (snapshot.to_vec(), revision));
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Yrs text replica
// ───────────────────────────────────────────────────────────────────

const TEXT_NAME: &str = "content";

struct YrsUnit {
    doc: Doc,
    revision: u64,
}

impl YrsUnit {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            revision: 0,
        }
    }

    fn text(&self) -> String {
        let text = self.doc.get_or_insert_text(TEXT_NAME);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }
}

/// Text replica backed by one Yrs document per unit.
///
/// Activities carry Yrs v1 updates. Content is the visible text, so replicas
/// with different histories but equal text hash the same. Snapshots are full
/// state updates, so a restored replica keeps merging later updates.
#[derive(Default)]
pub struct YrsDocument {
    units: RwLock<BTreeMap<UnitId, YrsUnit>>,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert text locally and return the update to broadcast.
    pub fn insert(&self, unit: &UnitId, index: u32, chunk: &str) -> Vec<u8> {
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let entry = units.entry(unit.clone()).or_insert_with(YrsUnit::new);
        let text = entry.doc.get_or_insert_text(TEXT_NAME);
        let update = {
            let mut txn = entry.doc.transact_mut();
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        entry.revision += 1;
        update
    }

    pub fn text(&self, unit: &UnitId) -> Option<String> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit)
            .map(YrsUnit::text)
    }

    fn apply_update(doc: &Doc, unit: &UnitId, bytes: &[u8]) -> Result<(), DocumentError> {
        let invalid = |reason: String| DocumentError::InvalidUpdate {
            unit: unit.clone(),
            reason,
        };
        let update = Update::decode_v1(bytes).map_err(|e| invalid(e.to_string()))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| invalid(e.to_string()))
    }
}

impl ActivitySink for YrsDocument {
    fn apply(&self, from: UserId, activity: Activity) -> Result<(), DocumentError> {
        let Some(unit) = activity.unit else {
            log::debug!("Ignoring unit-less activity from {from}");
            return Ok(());
        };
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let entry = units.entry(unit.clone()).or_insert_with(YrsUnit::new);
        Self::apply_update(&entry.doc, &unit, &activity.payload)?;
        entry.revision += 1;
        Ok(())
    }
}

impl Document for YrsDocument {
    fn units(&self) -> Vec<UnitId> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn content(&self, unit: &UnitId) -> Option<Vec<u8>> {
        self.text(unit).map(String::into_bytes)
    }

    fn revision(&self, unit: &UnitId) -> u64 {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit)
            .map_or(0, |entry| entry.revision)
    }

    fn snapshot(&self, unit: &UnitId) -> Option<Vec<u8>> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        let entry = units.get(unit)?;
        let txn = entry.doc.transact();
        Some(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    fn restore(&self, unit: &UnitId, snapshot: &[u8], revision: u64) -> Result<(), DocumentError> {
        // Build the replacement off to the side so a bad snapshot leaves the
        // current replica untouched.
        let fresh = YrsUnit {
            doc: Doc::new(),
            revision,
        };
        Self::apply_update(&fresh.doc, unit, snapshot)?;
        self.units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit.clone(), fresh);
        Ok(())
    }
}
