//! Error types for ring and membership operations.

use crate::hash::Position;
use crate::state::NodeState;

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A peer sent a message we could not parse or did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The key hashes outside every range this node serves.
    #[error("server_not_responsible")]
    NotResponsible,

    /// The node's availability state rejects the operation.
    #[error("{0}")]
    Unavailable(NodeState),

    /// The caller does not own the key it tried to modify.
    #[error("user is not the owner of key {0}")]
    NotOwner(String),

    /// A membership event did not match the current ring.
    #[error("membership error: {0}")]
    Membership(String),

    /// Node not found in the ring.
    #[error("node {0} not found in ring")]
    NodeNotFound(String),

    /// Two distinct nodes hashed to the same ring position.
    #[error("position {position} already occupied by {existing}")]
    PositionCollision { position: Position, existing: String },

    /// Network error during peer communication.
    #[error("cluster communication error: {0}")]
    Network(String),

    /// Timeout waiting for a peer.
    #[error("cluster operation timed out")]
    Timeout,
}

impl ClusterError {
    /// Creates a protocol error from any displayable message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        ClusterError::Protocol(msg.into())
    }

    /// Creates a membership error from any displayable message.
    pub fn membership(msg: impl Into<String>) -> Self {
        ClusterError::Membership(msg.into())
    }

    /// Returns true for errors that mean "the ring disagrees with the
    /// event", which are logged and ignored rather than propagated.
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            ClusterError::Membership(_)
                | ClusterError::NodeNotFound(_)
                | ClusterError::PositionCollision { .. }
        )
    }

    /// Returns true if the error came from the network layer.
    pub fn is_network(&self) -> bool {
        matches!(self, ClusterError::Network(_) | ClusterError::Timeout)
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ClusterError::Protocol(e.to_string())
        } else {
            ClusterError::Network(e.to_string())
        }
    }
}
