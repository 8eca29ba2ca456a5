//! Per-peer activity sequencing.
//!
//! Every activity sent to a peer carries that peer's next outgoing number.
//! On the receiving side activities are delivered in strictly increasing,
//! gap-free order per peer:
//!
//! ```text
//! arrivals:  3   1   2   2   4
//! expected:  1   2   4   4   5
//! held:     {3} {3}  {}  {}  {}
//! delivered: -   1  2,3  -   4
//! ```
//!
//! Numbers below `expected` are duplicates and dropped. Numbers above it are
//! held (bounded) until the gap closes, `release_stale` skips a gap that
//! stayed open too long, or a reconnect resets the expectation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::UserId;

/// First number stamped on (and expected from) every peer.
pub const FIRST_SEQUENCE: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("Reorder buffer for {peer} is full ({capacity} held, expected {expected}, received {received})")]
    BufferFull {
        peer: UserId,
        capacity: usize,
        expected: u64,
        received: u64,
    },
}

/// Result of skipping a gap that stayed open past the gap timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapSkip<A> {
    pub peer: UserId,
    /// First missing number
    pub skipped_from: u64,
    /// First number delivered after the skip
    pub resumed_at: u64,
    pub delivered: Vec<A>,
}

struct PeerSequence<A> {
    next_outgoing: u64,
    expected: u64,
    held: BTreeMap<u64, A>,
    /// When the current gap opened
    gap_since: Option<Instant>,
}

impl<A> PeerSequence<A> {
    fn new() -> Self {
        Self {
            next_outgoing: FIRST_SEQUENCE,
            expected: FIRST_SEQUENCE,
            held: BTreeMap::new(),
            gap_since: None,
        }
    }

    /// Deliver the contiguous run starting at `expected`.
    fn drain_ready(&mut self, now: Instant, out: &mut Vec<A>) {
        while let Some(activity) = self.held.remove(&self.expected) {
            out.push(activity);
            self.expected += 1;
        }
        self.gap_since = if self.held.is_empty() { None } else { Some(now) };
    }
}

/// Sequence state for every remote peer of one session.
pub struct SequenceTracker<A> {
    peers: Mutex<HashMap<UserId, PeerSequence<A>>>,
    max_out_of_order: usize,
    gap_timeout: Duration,
}

impl<A> SequenceTracker<A> {
    pub fn new(max_out_of_order: usize, gap_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            max_out_of_order,
            gap_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, PeerSequence<A>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return and advance the number to stamp on the next activity for `peer`.
    pub fn next_outgoing(&self, peer: UserId) -> u64 {
        let mut peers = self.lock();
        let seq = peers.entry(peer).or_insert_with(PeerSequence::new);
        let number = seq.next_outgoing;
        seq.next_outgoing += 1;
        number
    }

    /// Accept an activity numbered `number` from `peer`.
    ///
    /// Returns the activities that became deliverable, in order. Empty when
    /// the activity was a duplicate or is being held behind a gap.
    pub fn accept(&self, peer: UserId, number: u64, activity: A) -> Result<Vec<A>, SequenceError> {
        let mut peers = self.lock();
        let seq = peers.entry(peer).or_insert_with(PeerSequence::new);
        let now = Instant::now();

        if number < seq.expected || seq.held.contains_key(&number) {
            log::debug!("Dropping duplicate activity #{number} from {peer} (expected #{})", seq.expected);
            return Ok(Vec::new());
        }

        if number > seq.expected {
            if seq.held.len() >= self.max_out_of_order {
                return Err(SequenceError::BufferFull {
                    peer,
                    capacity: self.max_out_of_order,
                    expected: seq.expected,
                    received: number,
                });
            }
            log::trace!("Holding activity #{number} from {peer}, waiting for #{}", seq.expected);
            seq.held.insert(number, activity);
            seq.gap_since.get_or_insert(now);
            return Ok(Vec::new());
        }

        let mut delivered = vec![activity];
        seq.expected += 1;
        seq.drain_ready(now, &mut delivered);
        Ok(delivered)
    }

    /// Point-in-time copy of the expected number for every known peer.
    pub fn snapshot_expected(&self) -> HashMap<UserId, u64> {
        self.lock()
            .iter()
            .map(|(peer, seq)| (*peer, seq.expected))
            .collect()
    }

    /// Restore `peer`'s expectation from a snapshot taken before a disconnect.
    ///
    /// Held activities below the restored number are dropped; any run that
    /// now starts at the expectation is returned for delivery. The outgoing
    /// counter is left untouched. An expectation never moves below what was
    /// already delivered.
    pub fn reset_after_reconnect(&self, peer: UserId, expected: u64) -> Vec<A> {
        let mut peers = self.lock();
        let seq = peers.entry(peer).or_insert_with(PeerSequence::new);

        if expected < seq.expected {
            log::warn!(
                "Snapshot for {peer} expects #{expected} but #{} was already delivered; keeping #{}",
                seq.expected - 1,
                seq.expected
            );
        } else {
            seq.expected = expected;
        }

        let floor = seq.expected;
        seq.held.retain(|n, _| *n >= floor);

        let mut delivered = Vec::new();
        seq.drain_ready(Instant::now(), &mut delivered);
        log::debug!("Reset sequencing for {peer}: expecting #{}, {} held", seq.expected, seq.held.len());
        delivered
    }

    /// Skip gaps that have stayed open longer than the gap timeout.
    pub fn release_stale(&self) -> Vec<GapSkip<A>> {
        self.release_stale_at(Instant::now())
    }

    fn release_stale_at(&self, now: Instant) -> Vec<GapSkip<A>> {
        let mut skips = Vec::new();
        for (peer, seq) in self.lock().iter_mut() {
            let Some(since) = seq.gap_since else { continue };
            if now.saturating_duration_since(since) < self.gap_timeout {
                continue;
            }
            let Some(&first_held) = seq.held.keys().next() else {
                seq.gap_since = None;
                continue;
            };

            let skipped_from = seq.expected;
            seq.expected = first_held;
            let mut delivered = Vec::new();
            seq.drain_ready(now, &mut delivered);
            log::warn!(
                "Gap from {peer} open for {:?}; skipped #{skipped_from}..#{first_held}",
                now.saturating_duration_since(since)
            );
            skips.push(GapSkip {
                peer: *peer,
                skipped_from,
                resumed_at: first_held,
                delivered,
            });
        }
        skips
    }

    /// Forget a peer that left the session.
    pub fn remove_peer(&self, peer: &UserId) -> bool {
        self.lock().remove(peer).is_some()
    }

    pub fn expected(&self, peer: &UserId) -> Option<u64> {
        self.lock().get(peer).map(|seq| seq.expected)
    }

    /// Number of activities held behind a gap for `peer`.
    pub fn buffered(&self, peer: &UserId) -> usize {
        self.lock().get(peer).map_or(0, |seq| seq.held.len())
    }
}
