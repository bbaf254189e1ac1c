//! Replica slots.
//!
//! Once the ring has at least three members every node keeps copies of
//! two other nodes' ranges. Slot 1 holds the data of the node that uses
//! us as its first replica, slot 2 the data of the node that uses us as
//! its second. Copies are wholesale: each push replaces the slot.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::{hash_key, in_range, Position};
use crate::ClusterError;

/// Which of the two replica slots a push targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotIndex {
    First,
    Second,
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotIndex::First => f.write_str("1"),
            SlotIndex::Second => f.write_str("2"),
        }
    }
}

impl FromStr for SlotIndex {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(SlotIndex::First),
            "2" => Ok(SlotIndex::Second),
            other => Err(ClusterError::protocol(format!("invalid replica slot '{other}'"))),
        }
    }
}

/// A copy of another node's data and the range it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSlot {
    pub data: HashMap<String, String>,
    pub range_start: Position,
    pub range_end: Position,
    pub in_use: bool,
}

impl ReplicaSlot {
    /// Replaces the slot's contents.
    pub fn store(&mut self, start: Position, end: Position, data: HashMap<String, String>) {
        self.data = data;
        self.range_start = start;
        self.range_end = end;
        self.in_use = true;
    }

    pub fn reset(&mut self) {
        *self = ReplicaSlot::default();
    }

    /// Returns the value for `key` if the slot is live and the key hashes
    /// into its range.
    pub fn lookup(&self, key: &str) -> Option<&String> {
        if !self.in_use || !in_range(hash_key(key), self.range_start, self.range_end) {
            return None;
        }
        self.data.get(key)
    }

    pub fn covers_key(&self, key: &str) -> bool {
        self.in_use && in_range(hash_key(key), self.range_start, self.range_end)
    }
}

/// Both replica slots of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSlots {
    first: ReplicaSlot,
    second: ReplicaSlot,
}

impl ReplicaSlots {
    pub fn get(&self, slot: SlotIndex) -> &ReplicaSlot {
        match slot {
            SlotIndex::First => &self.first,
            SlotIndex::Second => &self.second,
        }
    }

    pub fn get_mut(&mut self, slot: SlotIndex) -> &mut ReplicaSlot {
        match slot {
            SlotIndex::First => &mut self.first,
            SlotIndex::Second => &mut self.second,
        }
    }

    pub fn reset_all(&mut self) {
        self.first.reset();
        self.second.reset();
    }

    /// Looks in slot 1, then slot 2.
    ///
    /// Returns `None` when neither slot covers the key. A covering slot
    /// that lacks the key yields `Some(None)`.
    pub fn lookup(&self, key: &str) -> Option<Option<String>> {
        [&self.first, &self.second]
            .into_iter()
            .find(|slot| slot.covers_key(key))
            .map(|slot| slot.data.get(key).cloned())
    }
}

/// Tracks which replicas have received this node's data since the last
/// topology change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationFlags {
    pub first: bool,
    pub second: bool,
}

impl ReplicationFlags {
    pub fn get(&self, slot: SlotIndex) -> bool {
        match slot {
            SlotIndex::First => self.first,
            SlotIndex::Second => self.second,
        }
    }

    pub fn set(&mut self, slot: SlotIndex) {
        match slot {
            SlotIndex::First => self.first = true,
            SlotIndex::Second => self.second = true,
        }
    }

    pub fn clear(&mut self) {
        *self = ReplicationFlags::default();
    }
}
