//! The consistent-hashing ring.
//!
//! Nodes are kept in a `BTreeMap` ordered by position. Each node owns the
//! half-open range `[start, end)` where `start` is its own position and
//! `end` is its successor's position, wrapping past zero. For any ring
//! size the ranges partition the keyspace with no gaps or overlaps: a
//! single node has `start == end` and covers everything.
//!
//! Insert and remove only ever touch the predecessor's `end`, so both are
//! O(log n).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash::{hash_key, in_range, node_key, Position};
use crate::ClusterError;

/// A host and port to deliver a peer message to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::protocol(format!("invalid endpoint '{s}'")))?;
        let port = port
            .parse()
            .map_err(|_| ClusterError::protocol(format!("invalid port in endpoint '{s}'")))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Identity of a storage node: where clients and peers reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: String,
    pub client_port: u16,
    pub peer_port: u16,
}

impl NodeAddr {
    pub fn new(ip: impl Into<String>, client_port: u16, peer_port: u16) -> Self {
        Self {
            ip: ip.into(),
            client_port,
            peer_port,
        }
    }

    /// The node's ring name, `"ip:client_port"`.
    pub fn key(&self) -> String {
        node_key(&self.ip, self.client_port)
    }

    pub fn position(&self) -> Position {
        hash_key(&self.key())
    }

    /// Where the node's membership agent listens.
    pub fn peer(&self) -> Endpoint {
        Endpoint::new(self.ip.clone(), self.peer_port)
    }

    /// Where the node serves clients.
    pub fn client(&self) -> Endpoint {
        Endpoint::new(self.ip.clone(), self.client_port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.client_port, self.peer_port)
    }
}

/// A ring member and the key range it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub addr: NodeAddr,
    /// The node's own position.
    pub start: Position,
    /// Exclusive upper bound: the successor's position.
    pub end: Position,
    /// Set by the coordinator while this node hands off part of its range.
    pub write_locked: bool,
    /// Coordinator-side bookkeeping. Not part of the snapshot text.
    pub last_heartbeat: Option<Instant>,
}

impl NodeDescriptor {
    /// Creates a descriptor at the node's hashed position, covering the
    /// whole ring until it is inserted.
    pub fn new(addr: NodeAddr) -> Self {
        let start = addr.position();
        Self {
            addr,
            start,
            end: start,
            write_locked: false,
            last_heartbeat: None,
        }
    }

    pub fn covers(&self, pos: Position) -> bool {
        in_range(pos, self.start, self.end)
    }

    pub fn covers_key(&self, key: &str) -> bool {
        self.covers(hash_key(key))
    }
}

/// Read-only neighbor query result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Neighbors {
    pub predecessor: Option<NodeDescriptor>,
    pub successor: Option<NodeDescriptor>,
}

/// Result of removing a node: the removed descriptor plus its former
/// neighbors, with the predecessor already extended over the gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborsAndSelf {
    pub predecessor: Option<NodeDescriptor>,
    pub node: NodeDescriptor,
    pub successor: Option<NodeDescriptor>,
}

/// The two nodes that hold copies of a node's range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTargets {
    pub first: NodeDescriptor,
    pub second: NodeDescriptor,
}

/// One `start,end,ip:client_port` entry from a client-facing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRange {
    pub start: Position,
    pub end: Position,
    pub endpoint: Endpoint,
}

impl ClientRange {
    pub fn covers_key(&self, key: &str) -> bool {
        in_range(hash_key(key), self.start, self.end)
    }
}

/// Parses the client-facing `start,end,ip:port;...` form.
pub fn parse_client_snapshot(text: &str) -> Result<Vec<ClientRange>, ClusterError> {
    let mut ranges = Vec::new();
    for entry in text.trim().split(';').filter(|e| !e.is_empty()) {
        let mut fields = entry.splitn(3, ',');
        let (Some(start), Some(end), Some(endpoint)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(ClusterError::protocol(format!("malformed keyrange entry '{entry}'")));
        };
        ranges.push(ClientRange {
            start: start.parse()?,
            end: end.parse()?,
            endpoint: endpoint.parse()?,
        });
    }
    Ok(ranges)
}

/// Sorted ring of node descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRing {
    nodes: BTreeMap<Position, NodeDescriptor>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates members in position order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// The member with the lowest position. Gossip rounds start here.
    pub fn first(&self) -> Option<&NodeDescriptor> {
        self.nodes.values().next()
    }

    /// Looks up a member by its client-facing identity.
    pub fn get(&self, ip: &str, client_port: u16) -> Option<&NodeDescriptor> {
        self.nodes
            .get(&hash_key(&node_key(ip, client_port)))
            .filter(|d| d.addr.ip == ip && d.addr.client_port == client_port)
    }

    /// Looks up a member by its peer-facing address.
    pub fn find_by_peer(&self, ip: &str, peer_port: u16) -> Option<&NodeDescriptor> {
        self.nodes
            .values()
            .find(|d| d.addr.ip == ip && d.addr.peer_port == peer_port)
    }

    /// The member whose range contains `pos`.
    pub fn responsible_for(&self, pos: Position) -> Option<&NodeDescriptor> {
        self.nodes
            .range(..=pos)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(_, d)| d)
    }

    pub fn responsible_for_key(&self, key: &str) -> Option<&NodeDescriptor> {
        self.responsible_for(hash_key(key))
    }

    fn successor_of(&self, pos: Position) -> Option<Position> {
        self.nodes
            .range((Excluded(pos), Unbounded))
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(p, _)| *p)
            .filter(|p| *p != pos)
    }

    fn predecessor_of(&self, pos: Position) -> Option<Position> {
        self.nodes
            .range(..pos)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(p, _)| *p)
            .filter(|p| *p != pos)
    }

    /// Adds a node at its hashed position.
    ///
    /// Returns the predecessor as it was before the insert: that node
    /// gives up `[new.start, new.end)` and must be write-locked while it
    /// hands the keys over. Returns `None` for the first node.
    pub fn insert(&mut self, addr: NodeAddr) -> Result<Option<NodeDescriptor>, ClusterError> {
        self.insert_descriptor(NodeDescriptor::new(addr))
    }

    pub(crate) fn insert_descriptor(
        &mut self,
        mut node: NodeDescriptor,
    ) -> Result<Option<NodeDescriptor>, ClusterError> {
        let pos = node.start;
        if let Some(existing) = self.nodes.get(&pos) {
            return Err(ClusterError::PositionCollision {
                position: pos,
                existing: existing.addr.to_string(),
            });
        }

        let (Some(pred_pos), Some(succ_pos)) = (self.predecessor_of(pos), self.successor_of(pos))
        else {
            // first node owns the whole ring
            node.end = node.start;
            debug!(node = %node.addr, "ring: first node inserted");
            self.nodes.insert(pos, node);
            return Ok(None);
        };

        let succ_start = self.nodes[&succ_pos].start;
        let pred = self
            .nodes
            .get_mut(&pred_pos)
            .ok_or_else(|| ClusterError::membership("predecessor vanished during insert"))?;
        let before = pred.clone();
        pred.end = pos;
        node.end = succ_start;

        debug!(
            node = %node.addr,
            predecessor = %before.addr,
            size = self.nodes.len() + 1,
            "ring: node inserted"
        );
        self.nodes.insert(pos, node);
        Ok(Some(before))
    }

    /// Removes a node, extending its predecessor over the freed range.
    pub fn remove(&mut self, ip: &str, client_port: u16) -> Result<NeighborsAndSelf, ClusterError> {
        let key = node_key(ip, client_port);
        if self.get(ip, client_port).is_none() {
            return Err(ClusterError::NodeNotFound(key));
        }
        self.remove_at(hash_key(&key))
    }

    pub(crate) fn remove_at(&mut self, pos: Position) -> Result<NeighborsAndSelf, ClusterError> {
        let node = self
            .nodes
            .remove(&pos)
            .ok_or_else(|| ClusterError::NodeNotFound(pos.to_string()))?;

        let predecessor = match self.predecessor_of(pos) {
            Some(pred_pos) => {
                let pred = self
                    .nodes
                    .get_mut(&pred_pos)
                    .ok_or_else(|| ClusterError::membership("predecessor vanished during remove"))?;
                pred.end = node.end;
                Some(pred.clone())
            }
            None => None,
        };
        let successor = self
            .successor_of(pos)
            .and_then(|p| self.nodes.get(&p))
            .cloned();

        debug!(node = %node.addr, size = self.nodes.len(), "ring: node removed");
        Ok(NeighborsAndSelf {
            predecessor,
            node,
            successor,
        })
    }

    /// Predecessor and successor of the member at `pos`. Never mutates.
    ///
    /// With two members both neighbors are the other node; with one
    /// there are none.
    pub fn neighbors(&self, pos: Position) -> Neighbors {
        Neighbors {
            predecessor: self.predecessor_of(pos).and_then(|p| self.nodes.get(&p)).cloned(),
            successor: self.successor_of(pos).and_then(|p| self.nodes.get(&p)).cloned(),
        }
    }

    /// Replica placement for the member at `pos`.
    ///
    /// Three members: replica 1 is the successor, replica 2 the
    /// predecessor. More than three: the next two successors. Fewer than
    /// three: no replication.
    pub fn candidate_replicas(&self, pos: Position) -> Option<ReplicaTargets> {
        match self.nodes.len() {
            0..=2 => None,
            3 => {
                let n = self.neighbors(pos);
                Some(ReplicaTargets {
                    first: n.successor?,
                    second: n.predecessor?,
                })
            }
            _ => {
                let first = self.successor_of(pos)?;
                let second = self.successor_of(first)?;
                Some(ReplicaTargets {
                    first: self.nodes.get(&first)?.clone(),
                    second: self.nodes.get(&second)?.clone(),
                })
            }
        }
    }

    /// Sets a member's write-lock flag, returning the previous value.
    pub fn set_write_lock(
        &mut self,
        ip: &str,
        client_port: u16,
        locked: bool,
    ) -> Result<bool, ClusterError> {
        let pos = hash_key(&node_key(ip, client_port));
        let node = self
            .nodes
            .get_mut(&pos)
            .filter(|d| d.addr.ip == ip && d.addr.client_port == client_port)
            .ok_or_else(|| ClusterError::NodeNotFound(node_key(ip, client_port)))?;
        Ok(std::mem::replace(&mut node.write_locked, locked))
    }

    /// Stamps the time the coordinator last sent a heartbeat to a member.
    pub fn record_heartbeat(&mut self, ip: &str, client_port: u16, at: Instant) -> bool {
        let pos = hash_key(&node_key(ip, client_port));
        match self.nodes.get_mut(&pos) {
            Some(node) => {
                node.last_heartbeat = Some(at);
                true
            }
            None => false,
        }
    }

    /// Node-facing snapshot: `start,end,ip:client_port:peer_port;...`
    pub fn to_snapshot(&self) -> String {
        let mut out = String::new();
        for d in self.nodes.values() {
            out.push_str(&format!("{},{},{};", d.start, d.end, d.addr));
        }
        out
    }

    /// Client-facing snapshot: `start,end,ip:client_port;...`
    pub fn to_client_snapshot(&self) -> String {
        let mut out = String::new();
        for d in self.nodes.values() {
            out.push_str(&format!("{},{},{};", d.start, d.end, d.addr.key()));
        }
        out
    }

    /// Read-routing snapshot. Each range is listed once for its owner and
    /// once per replica, so clients may read from any of the three.
    pub fn keyrange_read(&self) -> String {
        if self.nodes.len() < 3 {
            return self.to_client_snapshot();
        }
        let mut out = String::new();
        for d in self.nodes.values() {
            out.push_str(&format!("{},{},{};", d.start, d.end, d.addr.key()));
            if let Some(replicas) = self.candidate_replicas(d.start) {
                for r in [&replicas.first, &replicas.second] {
                    out.push_str(&format!("{},{},{};", d.start, d.end, r.addr.key()));
                }
            }
        }
        out
    }

    /// Parses a node-facing snapshot produced by [`HashRing::to_snapshot`].
    pub fn from_snapshot(text: &str) -> Result<Self, ClusterError> {
        let mut nodes = BTreeMap::new();
        for entry in text.trim().split(';').filter(|e| !e.is_empty()) {
            let fields: Vec<&str> = entry.split(',').collect();
            let &[start, end, addr] = fields.as_slice() else {
                return Err(ClusterError::protocol(format!("malformed ring entry '{entry}'")));
            };
            let parts: Vec<&str> = addr.split(':').collect();
            let &[ip, client_port, peer_port] = parts.as_slice() else {
                return Err(ClusterError::protocol(format!("malformed node address '{addr}'")));
            };
            let addr = NodeAddr::new(
                ip,
                client_port
                    .parse()
                    .map_err(|_| ClusterError::protocol(format!("bad client port '{client_port}'")))?,
                peer_port
                    .parse()
                    .map_err(|_| ClusterError::protocol(format!("bad peer port '{peer_port}'")))?,
            );
            let start: Position = start.parse()?;
            if start != addr.position() {
                return Err(ClusterError::protocol(format!(
                    "ring entry for {addr} has position {start}, expected {}",
                    addr.position()
                )));
            }
            let node = NodeDescriptor {
                start,
                end: end.parse()?,
                ..NodeDescriptor::new(addr)
            };
            nodes.insert(start, node);
        }
        Ok(Self { nodes })
    }
}
