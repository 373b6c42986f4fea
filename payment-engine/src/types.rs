//! Transaction state shared by every role
//!
//! Paths are an explicit DAG keyed by (transaction, path id, node): every
//! node stores its own position on each path it takes part in, never a
//! pointer to another node's state.

use crate::faults::{Checkpoint, FaultAction};
use chrono::{DateTime, Utc};
use exchange_engine::Commission;
use line_ledger::{Equivalent, NodeId, ReservationId};
use observing_ledger::{hash_bytes, ObservingState, ParticipantSignature};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Simple path from coordinator to receiver
///
/// `edges[i]` is the equivalent of the line `nodes[i] -> nodes[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Nodes in payment order, coordinator first
    pub nodes: Vec<NodeId>,

    /// Equivalent of each edge
    pub edges: Vec<Equivalent>,
}

impl Route {
    /// Number of edges
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// True for a route without edges
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Intermediate nodes, coordinator and receiver excluded
    pub fn intermediates(&self) -> &[NodeId] {
        if self.nodes.len() < 2 {
            return &[];
        }
        &self.nodes[1..self.nodes.len() - 1]
    }

    /// Position of a node on the route
    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    /// Receiver of the route
    pub fn receiver(&self) -> Option<&NodeId> {
        self.nodes.last()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, " -[{}]-> ", self.edges[i - 1])?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}

/// Role of a node within one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Initiated the transaction
    Coordinator,
    /// Forwards value between two neighbors
    Intermediate,
    /// Final recipient
    Receiver,
}

/// Stage of a transaction at one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Created by the coordinator
    Init,
    /// Coordinator is discovering routes
    RequestRoutes,
    /// Coordinator is reserving the first round of paths
    ReserveAmount,
    /// Coordinator is reserving additional paths
    SearchAdditionalPath,
    /// Coordinator distributed the path configuration and collects votes
    VotePrepare,
    /// Participant holds reservations
    Reserved,
    /// Participant received the path configuration
    Configured,
    /// Participant signed its vote
    Voted,
    /// Coordinator persisted the full signature set
    VotesCollected,
    /// Participant is polling for the outcome
    Recovery,
    /// Applied through direct consensus
    Committed,
    /// Applied through the observing ledger
    Claimed,
    /// Released without balance change
    Rejected,
}

impl Stage {
    /// True once the outcome is applied locally
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Committed | Stage::Claimed | Stage::Rejected)
    }

    /// True when balances were changed
    pub fn is_applied(&self) -> bool {
        matches!(self, Stage::Committed | Stage::Claimed)
    }

    /// True once the node can no longer cancel on its own
    pub fn is_irrevocable(&self) -> bool {
        matches!(self, Stage::Voted | Stage::VotesCollected | Stage::Recovery)
    }
}

/// Holds of one node on one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHold {
    /// Route of the path
    pub route: Route,

    /// Position of this node on the route
    pub position: usize,

    /// Amount received from the upstream neighbor
    pub incoming: Option<(ReservationId, Decimal)>,

    /// Amount paid to the downstream neighbor
    pub outgoing: Option<(ReservationId, Decimal)>,

    /// Commission kept on this path
    pub commission: Option<Commission>,
}

impl PathHold {
    /// Upstream neighbor and edge equivalent
    pub fn upstream(&self) -> Option<(&NodeId, Equivalent)> {
        let position = self.position.checked_sub(1)?;
        Some((&self.route.nodes[position], self.route.edges[position]))
    }

    /// Downstream neighbor and edge equivalent
    pub fn downstream(&self) -> Option<(&NodeId, Equivalent)> {
        if self.position >= self.route.edges.len() {
            return None;
        }
        Some((&self.route.nodes[self.position + 1], self.route.edges[self.position]))
    }
}

/// Final amounts of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredPath {
    /// Path ID
    pub path_id: u32,

    /// Route
    pub route: Route,

    /// Amount settled on each edge
    pub amounts: Vec<Decimal>,

    /// Nodes charging their commission on this path
    pub charging: Vec<bool>,
}

impl ConfiguredPath {
    /// Amount delivered to the receiver
    pub fn delivered(&self) -> Decimal {
        self.amounts.last().copied().unwrap_or(Decimal::ZERO)
    }

    /// Amount paid by the coordinator
    pub fn paid(&self) -> Decimal {
        self.amounts.first().copied().unwrap_or(Decimal::ZERO)
    }
}

/// Agreed layout of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfiguration {
    /// Transaction
    pub transaction: Uuid,

    /// Coordinator
    pub coordinator: NodeId,

    /// Receiver
    pub receiver: NodeId,

    /// Every approved path
    pub paths: Vec<ConfiguredPath>,
}

impl PathConfiguration {
    /// Digest signed by every participant
    pub fn digest(&self) -> crate::Result<[u8; 32]> {
        Ok(hash_bytes(&bincode::serialize(self)?))
    }

    /// Every node except the coordinator
    pub fn participants(&self) -> BTreeSet<NodeId> {
        self.paths
            .iter()
            .flat_map(|path| path.route.nodes.iter().skip(1).cloned())
            .collect()
    }

    /// Paths a node takes part in, with its position
    pub fn paths_of<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = (&'a ConfiguredPath, usize)> + 'a {
        self.paths
            .iter()
            .filter_map(move |path| path.route.position(node).map(|position| (path, position)))
    }

    /// Amount delivered to the receiver
    pub fn delivered(&self) -> Decimal {
        self.paths.iter().map(ConfiguredPath::delivered).sum()
    }

    /// Amount paid by the coordinator
    pub fn paid(&self) -> Decimal {
        self.paths.iter().map(ConfiguredPath::paid).sum()
    }

    /// Direct neighbors of a node along the configured paths
    pub fn route_neighbors(&self, node: &NodeId) -> BTreeSet<NodeId> {
        let mut neighbors = BTreeSet::new();
        for (path, position) in self.paths_of(node) {
            if position > 0 {
                neighbors.insert(path.route.nodes[position - 1].clone());
            }
            if let Some(next) = path.route.nodes.get(position + 1) {
                neighbors.insert(next.clone());
            }
        }
        neighbors
    }
}

/// Durable transaction state at one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction
    pub transaction: Uuid,

    /// Role of this node
    pub role: Role,

    /// Coordinator
    pub coordinator: NodeId,

    /// Receiver
    pub receiver: NodeId,

    /// Equivalent paid by the coordinator
    pub send_equivalent: Equivalent,

    /// Equivalent delivered to the receiver
    pub receive_equivalent: Equivalent,

    /// Amount to deliver
    pub amount: Decimal,

    /// Current stage
    pub stage: Stage,

    /// Holds of this node per path
    pub holds: BTreeMap<u32, PathHold>,

    /// Agreed configuration
    pub configuration: Option<PathConfiguration>,

    /// Digest this node voted for
    pub digest: Option<[u8; 32]>,

    /// Signature set of the vote consistency round
    pub signatures: Vec<ParticipantSignature>,

    /// Last observing ledger state seen
    pub observing: ObservingState,

    /// Reason of a rejection
    pub error: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Record of a freshly initiated transaction
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction: Uuid,
        role: Role,
        coordinator: NodeId,
        receiver: NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
        amount: Decimal,
        stage: Stage,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction,
            role,
            coordinator,
            receiver,
            send_equivalent,
            receive_equivalent,
            amount,
            stage,
            holds: BTreeMap::new(),
            configuration: None,
            digest: None,
            signatures: Vec::new(),
            observing: ObservingState::NoInfo,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once every expected signature is present
    pub fn has_full_signature_set(&self) -> bool {
        let Some(configuration) = &self.configuration else {
            return false;
        };
        let signed: BTreeSet<&NodeId> = self.signatures.iter().map(|s| &s.node).collect();
        configuration.participants().iter().all(|node| signed.contains(node))
            && signed.contains(&configuration.coordinator)
    }

    /// Commission kept by this node
    pub fn commission(&self) -> Option<Commission> {
        self.holds.values().find_map(|hold| hold.commission)
    }

    /// Query snapshot
    pub fn view(&self) -> TransactionView {
        let (paid, delivered, paths) = match &self.configuration {
            Some(configuration) => (
                Some(configuration.paid()),
                Some(configuration.delivered()),
                configuration.paths.len(),
            ),
            None => (None, None, self.holds.len()),
        };
        TransactionView {
            transaction: self.transaction,
            role: self.role,
            stage: self.stage,
            coordinator: self.coordinator.clone(),
            receiver: self.receiver.clone(),
            send_equivalent: self.send_equivalent,
            receive_equivalent: self.receive_equivalent,
            amount: self.amount,
            paid,
            delivered,
            paths,
            commission: self.commission(),
            observing: self.observing,
            error: self.error.clone(),
        }
    }
}

/// Transaction query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    /// Transaction
    pub transaction: Uuid,
    /// Role of the queried node
    pub role: Role,
    /// Stage at the queried node
    pub stage: Stage,
    /// Coordinator
    pub coordinator: NodeId,
    /// Receiver
    pub receiver: NodeId,
    /// Equivalent paid by the coordinator
    pub send_equivalent: Equivalent,
    /// Equivalent delivered to the receiver
    pub receive_equivalent: Equivalent,
    /// Requested amount
    pub amount: Decimal,
    /// Amount paid by the coordinator, once configured
    pub paid: Option<Decimal>,
    /// Amount delivered, once configured
    pub delivered: Option<Decimal>,
    /// Number of paths
    pub paths: usize,
    /// Commission kept by the queried node
    pub commission: Option<Commission>,
    /// Observing ledger state last seen
    pub observing: ObservingState,
    /// Rejection reason
    pub error: Option<String>,
}

/// Outcome a node reports when polled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Committed with this signature set
    Committed {
        /// Digest of the configuration
        digest: [u8; 32],
        /// Every participant signature
        signatures: Vec<ParticipantSignature>,
    },
    /// Rejected
    Rejected,
    /// No decision known
    Pending,
}

/// Step recorded in the recovery log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryEvent {
    /// Stage transition
    Stage(Stage),
    /// Fault hook fired
    Fault {
        /// Checkpoint
        checkpoint: Checkpoint,
        /// Action
        action: FaultAction,
    },
    /// No final broadcast within the waiting period
    RecoveryStarted,
    /// Outcome requested from another node
    Poll {
        /// Polled node
        target: NodeId,
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// Polled node answered
    PollAnswered {
        /// Polled node
        target: NodeId,
        /// Outcome reported
        decision: String,
    },
    /// Poll failed
    PollFailed {
        /// Polled node
        target: NodeId,
        /// Failure
        error: String,
    },
    /// Claim window opened on the observing ledger
    ArbitrationRequested,
    /// Final observing ledger state
    Observing(ObservingState),
    /// Claim submitted to the observing ledger
    ClaimSubmitted(ObservingState),
    /// Claim refused by the observing ledger
    ClaimRefused(String),
    /// Node restarted with the transaction in flight
    Resumed(Stage),
    /// Reservations expired before voting
    HoldsExpired,
    /// Outcome applied
    Resolved(Stage),
}

/// Entry of the recovery log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    /// Transaction
    pub transaction: Uuid,
    /// Node writing the entry
    pub node: NodeId,
    /// Time of the step
    pub at: DateTime<Utc>,
    /// Step
    pub event: RecoveryEvent,
}

/// Payment requested through the control interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Receiver
    pub receiver: NodeId,
    /// Equivalent paid by the coordinator
    pub send_equivalent: Equivalent,
    /// Equivalent delivered to the receiver
    pub receive_equivalent: Equivalent,
    /// Amount to deliver
    pub amount: Decimal,
    /// Ceiling on the amount paid
    pub max_allowable: Option<Decimal>,
}

/// Result of an exchange max-flow query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeFlow {
    /// Maximum amount the receiver can get
    pub receive: Decimal,
    /// Amount the coordinator pays for it
    pub pay: Decimal,
}

/// Result of a transaction audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Transaction
    pub transaction: Uuid,
    /// Local stage
    pub stage: Stage,
    /// Observing ledger state
    pub observing: ObservingState,
    /// True when both agree
    pub consistent: bool,
}
