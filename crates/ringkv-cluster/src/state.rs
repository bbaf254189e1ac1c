//! Per-node availability state.

use std::fmt;

/// Availability of a storage node.
///
/// `Available` serves everything, `WriteLock` serves reads only while a
/// key range is being handed off, and `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Available,
    WriteLock,
    Stopped,
}

impl NodeState {
    pub fn accepts_writes(self) -> bool {
        self == NodeState::Available
    }

    pub fn accepts_reads(self) -> bool {
        self != NodeState::Stopped
    }

    /// The reply string clients see for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Available => "server_available",
            NodeState::WriteLock => "server_write_lock",
            NodeState::Stopped => "server_stopped",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gating() {
        assert!(NodeState::Available.accepts_writes());
        assert!(!NodeState::WriteLock.accepts_writes());
        assert!(NodeState::WriteLock.accepts_reads());
        assert!(!NodeState::Stopped.accepts_reads());
    }

    #[test]
    fn reply_strings() {
        assert_eq!(NodeState::WriteLock.to_string(), "server_write_lock");
        assert_eq!(NodeState::Stopped.to_string(), "server_stopped");
    }
}
