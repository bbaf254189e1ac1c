//! Range ownership and availability gating for client operations.
//!
//! [`LocalNode`] is the state a storage node shares between its client
//! connections and its membership agent: availability, the latest ring
//! snapshot, the replica slots and the storage collaborators. Every
//! `put`/`get`/`delete` re-resolves this node's range from the current
//! snapshot, so a topology change takes effect on the next request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use tracing::debug;

use crate::hash::Position;
use crate::message::{Outbound, PeerMessage, Transfer};
use crate::replica::{ReplicaSlots, ReplicationFlags, SlotIndex};
use crate::ring::{HashRing, NodeAddr, NodeDescriptor};
use crate::state::NodeState;
use crate::store::{Cache, KeyRange, OwnerManager, Storage};
use crate::ClusterError;

/// Result of a successful put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
}

/// Result of a delete that passed gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Node-local state shared by client handlers and the membership agent.
pub struct LocalNode {
    addr: NodeAddr,
    state: RwLock<NodeState>,
    ring: RwLock<Arc<HashRing>>,
    replicas: RwLock<ReplicaSlots>,
    flags: Mutex<ReplicationFlags>,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn Cache>,
    owners: Arc<dyn OwnerManager>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LocalNode {
    pub fn new(
        addr: NodeAddr,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn Cache>,
        owners: Arc<dyn OwnerManager>,
    ) -> Self {
        Self {
            addr,
            state: RwLock::new(NodeState::Available),
            ring: RwLock::new(Arc::new(HashRing::new())),
            replicas: RwLock::new(ReplicaSlots::default()),
            flags: Mutex::new(ReplicationFlags::default()),
            storage,
            cache,
            owners,
        }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(from = %*current, to = %state, "node state change");
            *current = state;
        }
    }

    /// The latest ring snapshot.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the ring snapshot wholesale.
    pub fn set_ring(&self, ring: HashRing) {
        *self.ring.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(ring);
    }

    /// This node's descriptor in the current snapshot, if it is a member.
    pub fn descriptor(&self) -> Option<NodeDescriptor> {
        self.ring()
            .get(&self.addr.ip, self.addr.client_port)
            .cloned()
    }

    fn owns(&self, key: &str) -> bool {
        self.descriptor().is_some_and(|d| d.covers_key(key))
    }

    // -- client operations --

    /// Admits a write. The returned guard holds off state changes, so a
    /// write-lock only takes effect once in-flight writes have landed.
    fn write_gate(&self) -> Result<RwLockReadGuard<'_, NodeState>, ClusterError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if !state.accepts_writes() {
            return Err(ClusterError::Unavailable(*state));
        }
        Ok(state)
    }

    pub fn put(&self, key: &str, value: &str, user: &str) -> Result<PutOutcome, ClusterError> {
        let _gate = self.write_gate()?;
        if !self.owns(key) {
            return Err(ClusterError::NotResponsible);
        }
        if !self.owners.claim(key, user) {
            return Err(ClusterError::NotOwner(key.to_string()));
        }

        let updated = self.storage.put(key, value);
        self.cache.put(key, value);
        Ok(if updated {
            PutOutcome::Updated
        } else {
            PutOutcome::Inserted
        })
    }

    /// Reads a key from the local range, falling back to the replica
    /// slots for keys outside it.
    pub fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        let state = self.state();
        if !state.accepts_reads() {
            return Err(ClusterError::Unavailable(state));
        }

        if self.owns(key) {
            if let Some(v) = self.cache.get(key) {
                return Ok(Some(v));
            }
            let value = self.storage.get(key);
            if let Some(ref v) = value {
                self.cache.put(key, v);
            }
            return Ok(value);
        }

        let replicas = self.replicas.read().unwrap_or_else(|e| e.into_inner());
        replicas.lookup(key).ok_or(ClusterError::NotResponsible)
    }

    pub fn delete(&self, key: &str, user: &str) -> Result<DeleteOutcome, ClusterError> {
        let _gate = self.write_gate()?;
        if !self.owns(key) {
            return Err(ClusterError::NotResponsible);
        }
        if !self.owners.is_owner(key, user) {
            return Err(ClusterError::NotOwner(key.to_string()));
        }

        if !self.storage.delete(key) {
            return Ok(DeleteOutcome::NotFound);
        }
        self.owners.remove_owner(key);
        self.cache.delete(key);
        Ok(DeleteOutcome::Deleted)
    }

    /// Client-facing ring snapshot.
    pub fn keyrange(&self) -> Result<String, ClusterError> {
        match self.state() {
            NodeState::Stopped => Err(ClusterError::Unavailable(NodeState::Stopped)),
            _ => Ok(self.ring().to_client_snapshot()),
        }
    }

    /// Client-facing snapshot including replica holders.
    pub fn keyrange_read(&self) -> Result<String, ClusterError> {
        match self.state() {
            NodeState::Stopped => Err(ClusterError::Unavailable(NodeState::Stopped)),
            _ => Ok(self.ring().keyrange_read()),
        }
    }

    // -- bulk data movement --

    /// Collects the pairs and owners inside `range`.
    pub fn collect(&self, range: KeyRange) -> Transfer {
        Transfer {
            data: self.storage.range_scan(range),
            owners: self.owners.range_scan(range),
        }
    }

    /// Writes received pairs and owners into local storage.
    pub fn merge(&self, transfer: &Transfer) {
        for (key, value) in &transfer.data {
            self.storage.put(key, value);
            self.cache.delete(key);
        }
        self.owners.merge(&transfer.owners);
    }

    /// Deletes keys that now belong to another node.
    pub fn purge<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.storage.delete(key) {
                removed += 1;
            }
            self.owners.remove_owner(key);
            self.cache.delete(key);
        }
        removed
    }

    pub fn stored_len(&self) -> usize {
        self.storage.len()
    }

    // -- replication --

    pub fn store_replica(
        &self,
        slot: SlotIndex,
        start: Position,
        end: Position,
        data: HashMap<String, String>,
    ) {
        let mut replicas = self.replicas.write().unwrap_or_else(|e| e.into_inner());
        replicas.get_mut(slot).store(start, end, data);
    }

    pub fn reset_replicas(&self) {
        self.replicas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .reset_all();
    }

    pub fn replicas(&self) -> ReplicaSlots {
        self.replicas.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replication_flags(&self) -> ReplicationFlags {
        *self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_replicated(&self, slot: SlotIndex) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set(slot);
    }

    pub fn clear_replication_flags(&self) {
        self.flags.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Builds a full-dataset push of this node's range to one replica.
    ///
    /// Returns `None` when the ring is too small to replicate or this node
    /// is not a member.
    pub fn replica_push(&self, slot: SlotIndex, consistency: bool) -> Option<Outbound> {
        let ring = self.ring();
        let own = ring.get(&self.addr.ip, self.addr.client_port)?;
        let targets = ring.candidate_replicas(own.start)?;
        let target = match slot {
            SlotIndex::First => &targets.first,
            SlotIndex::Second => &targets.second,
        };
        let data = self.storage.range_scan(KeyRange::All);
        let (start, end) = (own.start, own.end);
        let msg = if consistency {
            PeerMessage::EventualConsistency {
                start,
                end,
                slot,
                data,
            }
        } else {
            PeerMessage::ReceiveReplicaData {
                start,
                end,
                slot,
                data,
            }
        };
        Some((target.addr.peer(), msg))
    }

    /// Re-pushes this node's data to every replica already seeded since
    /// the last topology change. Called after each local write.
    pub fn consistency_pushes(&self) -> Vec<Outbound> {
        let flags = self.replication_flags();
        [SlotIndex::First, SlotIndex::Second]
            .into_iter()
            .filter(|slot| flags.get(*slot))
            .filter_map(|slot| self.replica_push(slot, true))
            .collect()
    }
}
