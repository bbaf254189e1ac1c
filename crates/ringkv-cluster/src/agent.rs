//! Per-node membership agent.
//!
//! The agent is the node's half of every membership protocol: it joins
//! and leaves through the coordinator, acts as sender or receiver in
//! key-range hand-offs, relays the gossip token, answers heartbeats and
//! drives replica pushes. Like [`Coordinator`](crate::Coordinator) it is
//! transport-free; handlers return the deliveries to perform and the
//! runtime reports failed ones back through [`NodeAgent::on_delivery_failed`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::message::{Outbound, PeerMessage, Transfer};
use crate::migration::{handoff_range, OutboundMigration};
use crate::replica::SlotIndex;
use crate::responsibility::LocalNode;
use crate::ring::{Endpoint, HashRing, NodeAddr};
use crate::state::NodeState;
use crate::store::KeyRange;
use crate::ClusterError;

/// Smallest ring that replicates.
const REPLICATION_THRESHOLD: usize = 3;

/// Membership agent for one storage node.
#[derive(Debug)]
pub struct NodeAgent {
    node: Arc<LocalNode>,
    coordinator: Endpoint,
    migration: Option<OutboundMigration>,
    joined: bool,
}

impl NodeAgent {
    pub fn new(node: Arc<LocalNode>, coordinator: Endpoint) -> Self {
        Self {
            node,
            coordinator,
            migration: None,
            joined: false,
        }
    }

    pub fn node(&self) -> &Arc<LocalNode> {
        &self.node
    }

    pub fn coordinator(&self) -> &Endpoint {
        &self.coordinator
    }

    /// The hand-off this node is currently sending, if any.
    pub fn migration(&self) -> Option<&OutboundMigration> {
        self.migration.as_ref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// The `join` message to send on startup.
    pub fn join_request(&self) -> Outbound {
        (
            self.coordinator.clone(),
            PeerMessage::Join(self.node.addr().clone()),
        )
    }

    fn to_coordinator(&self, msg: PeerMessage) -> Outbound {
        (self.coordinator.clone(), msg)
    }

    /// Dispatches one inbound message.
    pub fn handle_message(&mut self, msg: PeerMessage) -> Result<Vec<Outbound>, ClusterError> {
        match msg {
            PeerMessage::JoinSuccess { predecessor } => {
                self.joined = true;
                match predecessor {
                    Some(p) => info!(predecessor = %p, "joined ring, predecessor is handing off"),
                    None => info!("joined ring as first node"),
                }
                Ok(vec![])
            }
            PeerMessage::MetadataUpdate(ring) => {
                self.on_metadata_update(ring);
                Ok(vec![])
            }
            PeerMessage::EnableWriteLock(receiver) => Ok(self.on_enable_write_lock(receiver)),
            PeerMessage::DisableWriteLock => Ok(self.on_disable_write_lock()),
            PeerMessage::StartDataReceipt {
                sender,
                leaving,
                transfer,
            } => Ok(self.on_data_receipt(sender, leaving, transfer)),
            PeerMessage::SuccessfulDataReceipt => Ok(self.on_successful_receipt()),
            PeerMessage::TransferDataPredLeaving(transfer) => Ok(self.on_predecessor_data(transfer)),
            PeerMessage::ReceiveReplicaData {
                start,
                end,
                slot,
                data,
            } => {
                debug!(%slot, keys = data.len(), "received replica data");
                self.node.store_replica(slot, start, end, data);
                Ok(self.cascade_replication())
            }
            PeerMessage::EventualConsistency {
                start,
                end,
                slot,
                data,
            } => {
                debug!(%slot, keys = data.len(), "replica refreshed");
                self.node.store_replica(slot, start, end, data);
                Ok(vec![])
            }
            PeerMessage::StartGossip => Ok(self.on_gossip(true)),
            PeerMessage::Gossip => Ok(self.on_gossip(false)),
            PeerMessage::Heartbeat { ip, client_port } => {
                Ok(vec![self.to_coordinator(PeerMessage::StillAlive { ip, client_port })])
            }
            other => Err(ClusterError::protocol(format!(
                "unexpected '{}' at node agent",
                other.kind()
            ))),
        }
    }

    fn on_metadata_update(&mut self, ring: HashRing) {
        let size = ring.len();
        debug!(members = size, "ring snapshot updated");
        self.node.set_ring(ring);
        // replicas are re-seeded after every topology change
        self.node.clear_replication_flags();
        if size < REPLICATION_THRESHOLD {
            self.node.reset_replicas();
        }
    }

    fn on_enable_write_lock(&mut self, receiver: NodeAddr) -> Vec<Outbound> {
        self.node.set_state(NodeState::WriteLock);

        let ring = self.node.ring();
        let own_end = self
            .node
            .descriptor()
            .map(|d| d.end)
            .unwrap_or_else(|| self.node.addr().position());
        let range = handoff_range(&ring, &receiver, own_end);
        let transfer = self.node.collect(range);

        info!(
            receiver = %receiver,
            keys = transfer.len(),
            "write-locked, handing off range"
        );
        let shipped = transfer.data.keys().cloned();
        match self.migration.as_mut() {
            Some(pending) => {
                warn!(
                    previous = %pending.receiver(),
                    next = %receiver,
                    "new hand-off while one is still pending"
                );
                pending.extend(receiver.clone(), range, shipped);
            }
            None => {
                self.migration = Some(OutboundMigration::new(receiver.clone(), range, shipped));
            }
        }

        vec![(
            receiver.peer(),
            PeerMessage::StartDataReceipt {
                sender: self.node.addr().clone(),
                leaving: false,
                transfer,
            },
        )]
    }

    fn on_data_receipt(&mut self, sender: NodeAddr, leaving: bool, transfer: Transfer) -> Vec<Outbound> {
        self.node.merge(&transfer);
        info!(from = %sender, keys = transfer.len(), leaving, "merged hand-off data");

        let mut out = Vec::new();
        if !leaving {
            out.push((sender.peer(), PeerMessage::SuccessfulDataReceipt));
        }
        out.extend(self.push_replica(SlotIndex::First));
        out
    }

    fn on_successful_receipt(&mut self) -> Vec<Outbound> {
        match self.migration.as_mut() {
            Some(m) => {
                m.mark_received();
                debug!(receiver = %m.receiver(), elapsed = ?m.elapsed(), "hand-off acknowledged");
            }
            None => warn!("successful_data_receipt without a pending hand-off"),
        }
        vec![self.to_coordinator(PeerMessage::DataTransferComplete(self.node.addr().clone()))]
    }

    fn on_disable_write_lock(&mut self) -> Vec<Outbound> {
        if let Some(m) = self.migration.take() {
            let removed = self.node.purge(m.pending_keys());
            info!(
                receivers = m.receivers().len(),
                removed,
                "write-lock cleared, handed-off keys deleted"
            );
        }
        if self.node.state() != NodeState::Stopped {
            self.node.set_state(NodeState::Available);
        }
        self.push_replica(SlotIndex::Second).into_iter().collect()
    }

    fn on_predecessor_data(&mut self, transfer: Transfer) -> Vec<Outbound> {
        self.node.merge(&transfer);
        info!(keys = transfer.len(), "merged data of departed predecessor");
        self.push_replica(SlotIndex::First).into_iter().collect()
    }

    /// Seeds this node's own replicas when it receives someone else's,
    /// so replication spreads around the ring after a topology change.
    fn cascade_replication(&mut self) -> Vec<Outbound> {
        let flags = self.node.replication_flags();
        if !flags.first {
            self.push_replica(SlotIndex::First).into_iter().collect()
        } else if !flags.second {
            self.push_replica(SlotIndex::Second).into_iter().collect()
        } else {
            vec![]
        }
    }

    fn push_replica(&self, slot: SlotIndex) -> Option<Outbound> {
        let push = self.node.replica_push(slot, false)?;
        self.node.mark_replicated(slot);
        debug!(%slot, to = %push.0, "pushing replica");
        Some(push)
    }

    fn on_gossip(&mut self, initiating: bool) -> Vec<Outbound> {
        let ring = self.node.ring();
        let me = self.node.addr();

        if ring.len() <= 1 {
            return vec![self.to_coordinator(PeerMessage::GossipSuccess)];
        }
        let is_first = ring
            .first()
            .is_some_and(|d| d.addr.ip == me.ip && d.addr.peer_port == me.peer_port);
        if !initiating && is_first {
            return vec![self.to_coordinator(PeerMessage::GossipSuccess)];
        }

        match ring.neighbors(me.position()).successor {
            Some(succ) => vec![(succ.addr.peer(), PeerMessage::Gossip)],
            None => vec![self.to_coordinator(PeerMessage::GossipSuccess)],
        }
    }

    /// Reacts to an outbound delivery that failed.
    ///
    /// An unreachable gossip successor is reported to the coordinator by
    /// its peer address. Everything else is logged; a lost replica push
    /// leaves its slot flagged so later writes refresh the holder.
    pub fn on_delivery_failed(&mut self, to: &Endpoint, msg: &PeerMessage) -> Vec<Outbound> {
        match msg {
            PeerMessage::Gossip => {
                warn!(successor = %to, "gossip successor unreachable");
                vec![self.to_coordinator(PeerMessage::GossipFail {
                    ip: to.host.clone(),
                    peer_port: to.port,
                })]
            }
            PeerMessage::ReceiveReplicaData { slot, data, .. }
            | PeerMessage::EventualConsistency { slot, data, .. } => {
                // the slot stays flagged, so the next write re-sends it
                warn!(
                    %to,
                    kind = msg.kind(),
                    %slot,
                    keys = data.len(),
                    "replica delivery failed, holder is stale until the next write"
                );
                vec![]
            }
            _ => {
                warn!(%to, kind = msg.kind(), "delivery failed");
                vec![]
            }
        }
    }

    /// Starts a graceful leave.
    ///
    /// The node stops serving immediately. If it has a successor, all of
    /// its data and owners ride along on the `leave` message and the
    /// coordinator forwards them.
    pub fn leave(&mut self) -> Vec<Outbound> {
        self.node.set_state(NodeState::Stopped);
        let me = self.node.addr().clone();
        let successor = self.node.ring().neighbors(me.position()).successor;

        let msg = match successor {
            Some(succ) => {
                self.node.set_state(NodeState::WriteLock);
                let transfer = self.node.collect(KeyRange::All);
                self.node.set_state(NodeState::Stopped);
                info!(successor = %succ.addr, keys = transfer.len(), "leaving, handing data to successor");
                PeerMessage::Leave {
                    ip: me.ip.clone(),
                    client_port: me.client_port,
                    successor: Some(succ.addr),
                    transfer,
                }
            }
            None => {
                info!("leaving as last node");
                PeerMessage::Leave {
                    ip: me.ip.clone(),
                    client_port: me.client_port,
                    successor: None,
                    transfer: Transfer::default(),
                }
            }
        };
        vec![self.to_coordinator(msg)]
    }
}
