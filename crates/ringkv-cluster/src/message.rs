//! Peer wire messages.
//!
//! Every exchange between the coordinator and the node agents is a single
//! [`Frame`]: a CRLF-terminated ASCII control line such as
//! `enable_write_lock 10.0.0.2 5001 6001`, plus a typed payload for the
//! few message kinds that carry bulk data. [`PeerMessage`] is the parsed
//! form, one variant per kind with only the fields that kind needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hash::Position;
use crate::replica::SlotIndex;
use crate::ring::{Endpoint, HashRing, NodeAddr};
use crate::ClusterError;

/// A message and where to deliver it.
pub type Outbound = (Endpoint, PeerMessage);

/// Key-value pairs and their owners, shipped during migration and leave.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transfer {
    pub data: HashMap<String, String>,
    pub owners: HashMap<String, String>,
}

impl Transfer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bulk data attached to a control line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    /// Node-facing ring snapshot text.
    Ring(String),
    Transfer(Transfer),
    Replica(HashMap<String, String>),
}

/// What actually goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub line: String,
    pub payload: Payload,
}

/// A coordinator or agent protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// agent → coordinator: add me to the ring.
    Join(NodeAddr),
    /// coordinator → agent: you are in. Names the write-locked
    /// predecessor, if any.
    JoinSuccess { predecessor: Option<NodeAddr> },
    /// coordinator → predecessor: hand `[new.start, new.end)` to this node.
    EnableWriteLock(NodeAddr),
    DisableWriteLock,
    MetadataUpdate(HashRing),
    /// agent → coordinator on shutdown. The transfer is forwarded to the
    /// successor when one is named.
    Leave {
        ip: String,
        client_port: u16,
        successor: Option<NodeAddr>,
        transfer: Transfer,
    },
    DataTransferComplete(NodeAddr),
    Heartbeat { ip: String, client_port: u16 },
    StillAlive { ip: String, client_port: u16 },
    StartGossip,
    Gossip,
    GossipSuccess,
    GossipFail { ip: String, peer_port: u16 },
    GetMetadata,
    StartDataReceipt {
        sender: NodeAddr,
        leaving: bool,
        transfer: Transfer,
    },
    SuccessfulDataReceipt,
    ReceiveReplicaData {
        start: Position,
        end: Position,
        slot: SlotIndex,
        data: HashMap<String, String>,
    },
    EventualConsistency {
        start: Position,
        end: Position,
        slot: SlotIndex,
        data: HashMap<String, String>,
    },
    TransferDataPredLeaving(Transfer),
}

impl PeerMessage {
    /// The command word on the control line.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Join(_) => "join",
            PeerMessage::JoinSuccess { .. } => "join_success",
            PeerMessage::EnableWriteLock(_) => "enable_write_lock",
            PeerMessage::DisableWriteLock => "disable_write_lock",
            PeerMessage::MetadataUpdate(_) => "metadata_update",
            PeerMessage::Leave { .. } => "leave",
            PeerMessage::DataTransferComplete(_) => "data_transfer_complete",
            PeerMessage::Heartbeat { .. } => "heartbeat",
            PeerMessage::StillAlive { .. } => "still_alive",
            PeerMessage::StartGossip => "start_gossip",
            PeerMessage::Gossip => "gossip",
            PeerMessage::GossipSuccess => "gossip_success",
            PeerMessage::GossipFail { .. } => "gossip_fail",
            PeerMessage::GetMetadata => "get_metadata",
            PeerMessage::StartDataReceipt { .. } => "start_data_receipt",
            PeerMessage::SuccessfulDataReceipt => "successful_data_receipt",
            PeerMessage::ReceiveReplicaData { .. } => "receive_replica_data",
            PeerMessage::EventualConsistency { .. } => "eventual_consistency",
            PeerMessage::TransferDataPredLeaving(_) => "transfer_data_pred_leaving",
        }
    }

    /// Renders the control line without its CRLF terminator.
    pub fn line(&self) -> String {
        let kind = self.kind();
        match self {
            PeerMessage::Join(a)
            | PeerMessage::EnableWriteLock(a)
            | PeerMessage::DataTransferComplete(a) => {
                format!("{kind} {} {} {}", a.ip, a.client_port, a.peer_port)
            }
            PeerMessage::JoinSuccess {
                predecessor: Some(p),
            } => format!("{kind} {} {} {}", p.ip, p.client_port, p.peer_port),
            PeerMessage::Leave {
                ip,
                client_port,
                successor,
                ..
            } => match successor {
                Some(s) => format!(
                    "{kind} {ip} {client_port} {} {} {}",
                    s.ip, s.client_port, s.peer_port
                ),
                None => format!("{kind} {ip} {client_port}"),
            },
            PeerMessage::Heartbeat { ip, client_port }
            | PeerMessage::StillAlive { ip, client_port } => format!("{kind} {ip} {client_port}"),
            PeerMessage::GossipFail { ip, peer_port } => format!("{kind} {ip} {peer_port}"),
            PeerMessage::StartDataReceipt {
                sender, leaving, ..
            } => format!(
                "{kind} {} {} {} {}",
                sender.ip,
                sender.client_port,
                sender.peer_port,
                if *leaving { "leaving" } else { "not_leaving" }
            ),
            PeerMessage::ReceiveReplicaData {
                start, end, slot, ..
            }
            | PeerMessage::EventualConsistency {
                start, end, slot, ..
            } => format!("{kind} {start} {end} {slot}"),
            _ => kind.to_string(),
        }
    }

    /// Builds the wire frame for this message.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            PeerMessage::MetadataUpdate(ring) => Payload::Ring(ring.to_snapshot()),
            PeerMessage::Leave {
                successor: Some(_),
                transfer,
                ..
            } => Payload::Transfer(transfer.clone()),
            PeerMessage::StartDataReceipt { transfer, .. }
            | PeerMessage::TransferDataPredLeaving(transfer) => Payload::Transfer(transfer.clone()),
            PeerMessage::ReceiveReplicaData { data, .. }
            | PeerMessage::EventualConsistency { data, .. } => Payload::Replica(data.clone()),
            _ => Payload::None,
        };
        Frame {
            line: format!("{}\r\n", self.line()),
            payload,
        }
    }

    /// Parses a wire frame back into a message.
    pub fn from_frame(frame: Frame) -> Result<Self, ClusterError> {
        let Frame { line, payload } = frame;
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = parts.split_first() else {
            return Err(ClusterError::protocol("empty control line"));
        };

        let msg = match cmd {
            "join" => PeerMessage::Join(node_addr(cmd, args)?),
            "join_success" => match args.len() {
                0 => PeerMessage::JoinSuccess { predecessor: None },
                _ => PeerMessage::JoinSuccess {
                    predecessor: Some(node_addr(cmd, args)?),
                },
            },
            "enable_write_lock" => PeerMessage::EnableWriteLock(node_addr(cmd, args)?),
            "disable_write_lock" => bare(cmd, args, PeerMessage::DisableWriteLock)?,
            "metadata_update" => {
                expect_args(cmd, args, 0)?;
                let Payload::Ring(text) = payload else {
                    return Err(missing_payload(cmd));
                };
                return Ok(PeerMessage::MetadataUpdate(HashRing::from_snapshot(&text)?));
            }
            "leave" => {
                let (ip, client_port, successor) = match args.len() {
                    2 => (args[0], port(args[1])?, None),
                    5 => (args[0], port(args[1])?, Some(node_addr(cmd, &args[2..])?)),
                    n => return Err(arity(cmd, n)),
                };
                let transfer = match (successor.is_some(), payload) {
                    (true, Payload::Transfer(t)) => t,
                    (true, _) => return Err(missing_payload(cmd)),
                    (false, _) => Transfer::default(),
                };
                return Ok(PeerMessage::Leave {
                    ip: ip.to_string(),
                    client_port,
                    successor,
                    transfer,
                });
            }
            "data_transfer_complete" => PeerMessage::DataTransferComplete(node_addr(cmd, args)?),
            "heartbeat" | "still_alive" => {
                expect_args(cmd, args, 2)?;
                let ip = args[0].to_string();
                let client_port = port(args[1])?;
                if cmd == "heartbeat" {
                    PeerMessage::Heartbeat { ip, client_port }
                } else {
                    PeerMessage::StillAlive { ip, client_port }
                }
            }
            "start_gossip" => bare(cmd, args, PeerMessage::StartGossip)?,
            "gossip" => bare(cmd, args, PeerMessage::Gossip)?,
            "gossip_success" => bare(cmd, args, PeerMessage::GossipSuccess)?,
            "gossip_fail" => {
                expect_args(cmd, args, 2)?;
                PeerMessage::GossipFail {
                    ip: args[0].to_string(),
                    peer_port: port(args[1])?,
                }
            }
            "get_metadata" => bare(cmd, args, PeerMessage::GetMetadata)?,
            "start_data_receipt" => {
                expect_args(cmd, args, 4)?;
                let sender = node_addr(cmd, &args[..3])?;
                let leaving = match args[3] {
                    "leaving" => true,
                    "not_leaving" => false,
                    other => {
                        return Err(ClusterError::protocol(format!(
                            "start_data_receipt: unknown sender state '{other}'"
                        )))
                    }
                };
                let Payload::Transfer(transfer) = payload else {
                    return Err(missing_payload(cmd));
                };
                return Ok(PeerMessage::StartDataReceipt {
                    sender,
                    leaving,
                    transfer,
                });
            }
            "successful_data_receipt" => bare(cmd, args, PeerMessage::SuccessfulDataReceipt)?,
            "receive_replica_data" | "eventual_consistency" => {
                expect_args(cmd, args, 3)?;
                let start: Position = args[0].parse()?;
                let end: Position = args[1].parse()?;
                let slot: SlotIndex = args[2].parse()?;
                let Payload::Replica(data) = payload else {
                    return Err(missing_payload(cmd));
                };
                return Ok(if cmd == "receive_replica_data" {
                    PeerMessage::ReceiveReplicaData {
                        start,
                        end,
                        slot,
                        data,
                    }
                } else {
                    PeerMessage::EventualConsistency {
                        start,
                        end,
                        slot,
                        data,
                    }
                });
            }
            "transfer_data_pred_leaving" => {
                expect_args(cmd, args, 0)?;
                let Payload::Transfer(transfer) = payload else {
                    return Err(missing_payload(cmd));
                };
                return Ok(PeerMessage::TransferDataPredLeaving(transfer));
            }
            other => {
                return Err(ClusterError::protocol(format!(
                    "unknown peer command '{other}'"
                )))
            }
        };

        // everything that reaches here takes no payload
        if payload != Payload::None {
            return Err(ClusterError::protocol(format!(
                "{cmd}: unexpected payload"
            )));
        }
        Ok(msg)
    }
}

fn arity(cmd: &str, got: usize) -> ClusterError {
    ClusterError::protocol(format!("{cmd}: wrong number of arguments ({got})"))
}

fn missing_payload(cmd: &str) -> ClusterError {
    ClusterError::protocol(format!("{cmd}: missing or mismatched payload"))
}

fn expect_args(cmd: &str, args: &[&str], n: usize) -> Result<(), ClusterError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(arity(cmd, args.len()))
    }
}

fn bare(cmd: &str, args: &[&str], msg: PeerMessage) -> Result<PeerMessage, ClusterError> {
    expect_args(cmd, args, 0)?;
    Ok(msg)
}

fn port(s: &str) -> Result<u16, ClusterError> {
    s.parse()
        .map_err(|_| ClusterError::protocol(format!("invalid port '{s}'")))
}

fn node_addr(cmd: &str, args: &[&str]) -> Result<NodeAddr, ClusterError> {
    expect_args(cmd, args, 3)?;
    Ok(NodeAddr::new(args[0], port(args[1])?, port(args[2])?))
}
