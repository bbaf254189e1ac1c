//! Key-range hand-off after a join.
//!
//! When a node joins, its predecessor gives up `[new.start, new.end)`.
//! The protocol on the predecessor (the sender) runs:
//!
//! 1. coordinator sends `enable_write_lock`, sender stops accepting writes
//! 2. sender ships the range to the new node with `start_data_receipt`
//! 3. new node merges and acks with `successful_data_receipt`
//! 4. sender reports `data_transfer_complete` to the coordinator
//! 5. coordinator sends `disable_write_lock`, sender deletes the shipped
//!    keys and accepts writes again
//!
//! Shipped keys stay readable on the sender until step 5. A second
//! `enable_write_lock` that arrives before step 5 folds into the pending
//! hand-off, so one unlock deletes every key shipped under the lock.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use crate::hash::Position;
use crate::ring::{HashRing, NodeAddr};
use crate::store::KeyRange;

/// Where the sender side of a hand-off currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Data shipped, waiting for the receiver's ack.
    AwaitingReceipt,
    /// Ack forwarded to the coordinator, waiting for the lock to clear.
    AwaitingUnlock,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingReceipt => write!(f, "awaiting_receipt"),
            Self::AwaitingUnlock => write!(f, "awaiting_unlock"),
        }
    }
}

/// Sender-side state for the hand-offs shipped under one write-lock.
#[derive(Debug, Clone)]
pub struct OutboundMigration {
    receivers: Vec<NodeAddr>,
    range: KeyRange,
    pending: HashSet<String>,
    phase: MigrationPhase,
    started_at: Instant,
}

impl OutboundMigration {
    pub fn new(receiver: NodeAddr, range: KeyRange, keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            receivers: vec![receiver],
            range,
            pending: keys.into_iter().collect(),
            phase: MigrationPhase::AwaitingReceipt,
            started_at: Instant::now(),
        }
    }

    /// The most recent receiver.
    pub fn receiver(&self) -> &NodeAddr {
        &self.receivers[self.receivers.len() - 1]
    }

    /// Every receiver shipped to under the current lock, oldest first.
    pub fn receivers(&self) -> &[NodeAddr] {
        &self.receivers
    }

    /// Folds another hand-off into this one. Pending keys accumulate and
    /// the phase goes back to waiting for a receipt.
    pub fn extend(
        &mut self,
        receiver: NodeAddr,
        range: KeyRange,
        keys: impl IntoIterator<Item = String>,
    ) {
        self.receivers.push(receiver);
        self.range = range;
        self.pending.extend(keys);
        self.phase = MigrationPhase::AwaitingReceipt;
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    pub fn mark_received(&mut self) {
        self.phase = MigrationPhase::AwaitingUnlock;
    }

    /// Keys to delete locally once the write-lock is cleared.
    pub fn pending_keys(&self) -> impl Iterator<Item = &String> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// The range a sender hands to `receiver`.
///
/// Uses the receiver's descriptor from the latest snapshot. If the
/// snapshot does not list the receiver yet, falls back to
/// `[hash(receiver), own_end)`.
pub fn handoff_range(ring: &HashRing, receiver: &NodeAddr, own_end: Position) -> KeyRange {
    match ring.get(&receiver.ip, receiver.client_port) {
        Some(d) => KeyRange::Span {
            start: d.start,
            end: d.end,
        },
        None => KeyRange::Span {
            start: receiver.position(),
            end: own_end,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", 5000 + i, 6000 + i)
    }

    #[test]
    fn range_from_snapshot() {
        let mut ring = HashRing::new();
        ring.insert(addr(1)).unwrap();
        ring.insert(addr(2)).unwrap();
        let d = ring.get("127.0.0.1", 5002).unwrap().clone();
        assert_eq!(
            handoff_range(&ring, &addr(2), Position(0)),
            KeyRange::Span {
                start: d.start,
                end: d.end
            }
        );
    }

    #[test]
    fn range_fallback_without_snapshot() {
        let ring = HashRing::new();
        let end = Position(99);
        assert_eq!(
            handoff_range(&ring, &addr(2), end),
            KeyRange::Span {
                start: addr(2).position(),
                end
            }
        );
    }

    #[test]
    fn phases() {
        let mut m = OutboundMigration::new(addr(2), KeyRange::All, vec!["a".into(), "b".into()]);
        assert_eq!(m.phase(), MigrationPhase::AwaitingReceipt);
        assert_eq!(m.pending_len(), 2);
        m.mark_received();
        assert_eq!(m.phase().to_string(), "awaiting_unlock");
        assert_eq!(m.receiver(), &addr(2));
    }

    #[test]
    fn extend_accumulates_pending_keys() {
        let mut m = OutboundMigration::new(addr(2), KeyRange::All, vec!["a".into(), "b".into()]);
        m.mark_received();
        m.extend(addr(3), KeyRange::All, vec!["b".into(), "c".into()]);

        assert_eq!(m.pending_len(), 3);
        assert_eq!(m.phase(), MigrationPhase::AwaitingReceipt);
        assert_eq!(m.receiver(), &addr(3));
        assert_eq!(m.receivers(), &[addr(2), addr(3)]);
    }
}
