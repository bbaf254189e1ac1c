//! ringkv-cluster: ring membership and data placement for ringkv.
//!
//! Keys and nodes are hashed with MD5 onto a 128-bit ring. Each node owns
//! the half-open arc from its own position up to its successor's, and
//! keeps up to two replica slots holding its neighbours' data.
//!
//! # Architecture
//!
//! - **Ring**: [`HashRing`] maps positions to [`NodeDescriptor`]s and
//!   round-trips through a text snapshot every member receives
//! - **Coordinator**: [`Coordinator`] is the single authority that mutates
//!   the ring and sequences join, leave and failure handling
//! - **Agent**: [`NodeAgent`] is each node's side of those protocols
//! - **Gating**: [`LocalNode`] decides whether a client request may be
//!   served based on range ownership and [`NodeState`]
//! - **Transport**: [`transport`] frames [`PeerMessage`]s over TCP
//!
//! The coordinator and the agent are plain state machines. Handlers return
//! the `(destination, message)` pairs to deliver, and the runtime reports
//! undeliverable ones back, so the protocols are testable without sockets.
//!
//! ```rust,ignore
//! use ringkv_cluster::{Coordinator, NodeAddr};
//!
//! let mut coordinator = Coordinator::new();
//! let out = coordinator.join(NodeAddr::new("127.0.0.1", 5001, 6001))?;
//! // first member: a metadata_update and a bare join_success
//! assert_eq!(out.len(), 2);
//! ```

mod agent;
mod coordinator;
mod error;
mod hash;
mod message;
mod migration;
mod replica;
mod responsibility;
mod ring;
mod state;
mod store;
pub mod transport;

pub use agent::NodeAgent;
pub use coordinator::Coordinator;
pub use error::ClusterError;
pub use hash::{hash_key, in_range, node_key, Position};
pub use message::{Frame, Outbound, Payload, PeerMessage, Transfer};
pub use migration::{handoff_range, MigrationPhase, OutboundMigration};
pub use replica::{ReplicaSlot, ReplicaSlots, ReplicationFlags, SlotIndex};
pub use responsibility::{DeleteOutcome, LocalNode, PutOutcome};
pub use ring::{
    parse_client_snapshot, ClientRange, Endpoint, HashRing, Neighbors, NeighborsAndSelf,
    NodeAddr, NodeDescriptor, ReplicaTargets,
};
pub use state::NodeState;
pub use store::{Cache, KeyRange, MemoryCache, MemoryOwners, MemoryStorage, OwnerManager, Storage};
