//! Messages exchanged between nodes

use crate::routing::{LineCapacity, NodeInfo};
use crate::types::{Decision, PathConfiguration, Route};
use line_ledger::{Equivalent, NodeId};
use message_bus::Message;
use observing_ledger::ParticipantSignature;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Reservation request travelling downstream along a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskReserve {
    /// Transaction
    pub transaction: Uuid,
    /// Coordinator
    pub coordinator: NodeId,
    /// Path inside the transaction
    pub path_id: u32,
    /// Full route
    pub route: Route,
    /// Position of the addressed node
    pub position: usize,
    /// Amount the receiver gets on this path
    pub deliver: Decimal,
    /// Hops the request may still traverse
    pub remaining_hops: u32,
    /// Commission designation per route position
    pub charging: Vec<bool>,
    /// Requested amount of the whole transaction
    pub amount: Decimal,
}

/// Protocol message
#[derive(Debug, Clone)]
pub enum ProtocolMessage {
    /// Channel handshake
    OpenChannel,
    /// Peer set the trust it extends to the receiver of this message
    TrustChanged {
        /// Equivalent
        equivalent: Equivalent,
        /// New trust amount
        amount: Decimal,
    },
    /// Topology request
    Neighbors {
        /// Equivalents of interest
        equivalents: Vec<Equivalent>,
    },
    /// Topology response
    NodeInfo(NodeInfo),
    /// Capacity refresh request
    Capacity {
        /// Equivalents of interest
        equivalents: Vec<Equivalent>,
    },
    /// Capacity refresh response
    Capacities(Vec<LineCapacity>),
    /// Reserve along a route
    AskReserve(AskReserve),
    /// Per-edge amounts from the answering node to the receiver
    ReserveApproved {
        /// Amount on every edge downstream of the requester
        amounts: Vec<Decimal>,
    },
    /// Reservation refused somewhere downstream
    ReserveRejected {
        /// Reason
        reason: String,
    },
    /// Drop the holds of one path
    ReleasePath {
        /// Transaction
        transaction: Uuid,
        /// Path
        path_id: u32,
    },
    /// Final amounts of every path
    Configure(PathConfiguration),
    /// Fetch the configuration from the coordinator
    GetConfiguration {
        /// Transaction
        transaction: Uuid,
    },
    /// Configuration held by the coordinator
    Configuration(Option<PathConfiguration>),
    /// Vote request
    Vote {
        /// Transaction
        transaction: Uuid,
        /// Digest of the configuration
        digest: [u8; 32],
    },
    /// Positive vote
    VoteGranted(ParticipantSignature),
    /// Negative vote
    VoteRefused {
        /// Reason
        reason: String,
    },
    /// Signature set of every participant
    VoteConsistency {
        /// Transaction
        transaction: Uuid,
        /// Digest of the configuration
        digest: [u8; 32],
        /// Every participant signature
        signatures: Vec<ParticipantSignature>,
    },
    /// Coordinator rejected the transaction
    Reject {
        /// Transaction
        transaction: Uuid,
    },
    /// Recovery poll
    Status {
        /// Transaction
        transaction: Uuid,
    },
    /// Recovery poll response
    Decision(Decision),
    /// Generic acknowledgement
    Ack,
    /// Request failed at the receiver
    Failure {
        /// Reason
        reason: String,
    },
}

impl Message for ProtocolMessage {
    fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::OpenChannel => "OpenChannel",
            ProtocolMessage::TrustChanged { .. } => "TrustChanged",
            ProtocolMessage::Neighbors { .. } => "Neighbors",
            ProtocolMessage::NodeInfo(_) => "NodeInfo",
            ProtocolMessage::Capacity { .. } => "Capacity",
            ProtocolMessage::Capacities(_) => "Capacities",
            ProtocolMessage::AskReserve(_) => "AskReserve",
            ProtocolMessage::ReserveApproved { .. } => "ReserveApproved",
            ProtocolMessage::ReserveRejected { .. } => "ReserveRejected",
            ProtocolMessage::ReleasePath { .. } => "ReleasePath",
            ProtocolMessage::Configure(_) => "Configure",
            ProtocolMessage::GetConfiguration { .. } => "GetConfiguration",
            ProtocolMessage::Configuration(_) => "Configuration",
            ProtocolMessage::Vote { .. } => "Vote",
            ProtocolMessage::VoteGranted(_) => "VoteGranted",
            ProtocolMessage::VoteRefused { .. } => "VoteRefused",
            ProtocolMessage::VoteConsistency { .. } => "VoteConsistency",
            ProtocolMessage::Reject { .. } => "Reject",
            ProtocolMessage::Status { .. } => "Status",
            ProtocolMessage::Decision(_) => "Decision",
            ProtocolMessage::Ack => "Ack",
            ProtocolMessage::Failure { .. } => "Failure",
        }
    }
}

impl ProtocolMessage {
    /// Transaction a message belongs to, if any
    pub fn transaction(&self) -> Option<Uuid> {
        match self {
            ProtocolMessage::AskReserve(ask) => Some(ask.transaction),
            ProtocolMessage::Configure(configuration) => Some(configuration.transaction),
            ProtocolMessage::ReleasePath { transaction, .. }
            | ProtocolMessage::GetConfiguration { transaction }
            | ProtocolMessage::Vote { transaction, .. }
            | ProtocolMessage::VoteConsistency { transaction, .. }
            | ProtocolMessage::Reject { transaction }
            | ProtocolMessage::Status { transaction } => Some(*transaction),
            _ => None,
        }
    }
}
