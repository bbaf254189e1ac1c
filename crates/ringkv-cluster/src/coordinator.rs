//! Coordinator state machine.
//!
//! The coordinator owns the canonical ring. It never touches the network
//! itself: every handler returns the `(endpoint, message)` deliveries the
//! runtime must perform, in order. Keeping it transport-free means one
//! actor task can own it outright and tests can drive it directly.
//!
//! Ordering matters on join: the new ring is broadcast before the
//! predecessor is locked, so the predecessor computes the hand-off range
//! against a snapshot that already contains the new node.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::message::{Outbound, PeerMessage, Transfer};
use crate::ring::{Endpoint, HashRing, NodeAddr};
use crate::ClusterError;

/// The coordinator's view of the cluster.
#[derive(Debug, Default)]
pub struct Coordinator {
    ring: HashRing,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Current members, in ring order.
    pub fn members(&self) -> Vec<NodeAddr> {
        self.ring.iter().map(|d| d.addr.clone()).collect()
    }

    /// Dispatches one inbound message.
    pub fn handle_message(&mut self, msg: PeerMessage) -> Result<Vec<Outbound>, ClusterError> {
        match msg {
            PeerMessage::Join(addr) => self.join(addr),
            PeerMessage::Leave {
                ip,
                client_port,
                successor,
                transfer,
            } => self.leave(&ip, client_port, successor, transfer),
            PeerMessage::DataTransferComplete(addr) => self.data_transfer_complete(&addr),
            PeerMessage::GossipSuccess => {
                info!(members = self.ring.len(), "gossip round complete, no failures");
                Ok(vec![])
            }
            PeerMessage::GossipFail { ip, peer_port } => self.gossip_fail(&ip, peer_port),
            PeerMessage::StillAlive { ip, client_port } => {
                self.still_alive(&ip, client_port);
                Ok(vec![])
            }
            PeerMessage::GetMetadata => {
                info!(ring = %self.ring.to_snapshot(), "metadata requested");
                Ok(vec![])
            }
            other => Err(ClusterError::protocol(format!(
                "unexpected '{}' at coordinator",
                other.kind()
            ))),
        }
    }

    fn broadcast(&self) -> Vec<Outbound> {
        self.ring
            .iter()
            .map(|d| (d.addr.peer(), PeerMessage::MetadataUpdate(self.ring.clone())))
            .collect()
    }

    /// Adds a node, broadcasts the new ring and locks its predecessor.
    pub fn join(&mut self, addr: NodeAddr) -> Result<Vec<Outbound>, ClusterError> {
        let predecessor = self.ring.insert(addr.clone())?;
        let mut out = self.broadcast();

        match predecessor {
            Some(pred) => {
                self.ring
                    .set_write_lock(&pred.addr.ip, pred.addr.client_port, true)?;
                info!(
                    node = %addr,
                    predecessor = %pred.addr,
                    members = self.ring.len(),
                    "node joined, predecessor write-locked"
                );
                out.push((pred.addr.peer(), PeerMessage::EnableWriteLock(addr.clone())));
                out.push((
                    addr.peer(),
                    PeerMessage::JoinSuccess {
                        predecessor: Some(pred.addr),
                    },
                ));
            }
            None => {
                info!(node = %addr, "first node joined");
                out.push((addr.peer(), PeerMessage::JoinSuccess { predecessor: None }));
            }
        }
        Ok(out)
    }

    /// Removes a departing node and forwards its data to the successor.
    pub fn leave(
        &mut self,
        ip: &str,
        client_port: u16,
        successor: Option<NodeAddr>,
        transfer: Transfer,
    ) -> Result<Vec<Outbound>, ClusterError> {
        let removed = self.ring.remove(ip, client_port)?;
        let mut out = self.broadcast();

        info!(
            node = %removed.node.addr,
            keys = transfer.len(),
            members = self.ring.len(),
            "node left"
        );
        if let Some(succ) = successor {
            out.push((succ.peer(), PeerMessage::TransferDataPredLeaving(transfer)));
        }
        Ok(out)
    }

    /// Clears a node's write-lock once its hand-off has been acknowledged.
    pub fn data_transfer_complete(&mut self, addr: &NodeAddr) -> Result<Vec<Outbound>, ClusterError> {
        let node = self
            .ring
            .get(&addr.ip, addr.client_port)
            .ok_or_else(|| ClusterError::NodeNotFound(addr.key()))?;
        if !node.write_locked {
            return Err(ClusterError::membership(format!(
                "data_transfer_complete from {addr}, which is not write-locked"
            )));
        }
        let peer = node.addr.peer();
        self.ring.set_write_lock(&addr.ip, addr.client_port, false)?;
        info!(node = %addr, "hand-off complete, write-lock cleared");
        Ok(vec![(peer, PeerMessage::DisableWriteLock)])
    }

    /// Evicts a node reported unreachable during gossip.
    ///
    /// Nodes report their successor by peer address, so that is how the
    /// node is looked up. No data is migrated for a failed node.
    pub fn gossip_fail(&mut self, ip: &str, peer_port: u16) -> Result<Vec<Outbound>, ClusterError> {
        let client_port = self
            .ring
            .find_by_peer(ip, peer_port)
            .map(|d| d.addr.client_port)
            .ok_or_else(|| {
                ClusterError::membership(format!("gossip_fail for unknown node {ip}:{peer_port}"))
            })?;
        let removed = self.ring.remove(ip, client_port)?;
        warn!(
            node = %removed.node.addr,
            members = self.ring.len(),
            "node failed gossip, evicted"
        );
        Ok(self.broadcast())
    }

    /// Records a heartbeat reply, returning the round-trip time.
    pub fn still_alive(&mut self, ip: &str, client_port: u16) -> Option<Duration> {
        let rtt = self
            .ring
            .get(ip, client_port)
            .and_then(|d| d.last_heartbeat)
            .map(|sent| sent.elapsed());
        match rtt {
            Some(rtt) => info!(node = %format!("{ip}:{client_port}"), ?rtt, "heartbeat reply"),
            None => debug!(node = %format!("{ip}:{client_port}"), "heartbeat reply from unknown node"),
        }
        rtt
    }

    /// Stamps the send time of a heartbeat.
    pub fn heartbeat_sent(&mut self, ip: &str, client_port: u16, at: Instant) {
        self.ring.record_heartbeat(ip, client_port, at);
    }

    /// Starts a gossip round at the lowest-positioned member.
    pub fn gossip_tick(&self) -> Option<Outbound> {
        self.ring
            .first()
            .map(|d| (d.addr.peer(), PeerMessage::StartGossip))
    }

    /// Reacts to an outbound delivery that failed.
    ///
    /// A node that cannot even receive `start_gossip` is treated as
    /// failed. Other failures are only logged.
    pub fn on_delivery_failed(&mut self, to: &Endpoint, msg: &PeerMessage) -> Vec<Outbound> {
        if !matches!(msg, PeerMessage::StartGossip) {
            warn!(%to, kind = msg.kind(), "delivery failed");
            return vec![];
        }
        match self.gossip_fail(&to.host, to.port) {
            Ok(out) => out,
            Err(e) => {
                warn!(%to, "gossip start failed: {e}");
                vec![]
            }
        }
    }
}
