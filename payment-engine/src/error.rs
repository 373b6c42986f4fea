//! Error taxonomy of the payment engine

use crate::faults::Checkpoint;
use line_ledger::NodeId;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for payment engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Payment engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or conflicting request, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Route or amount unsatisfiable with the live ledger and rates
    #[error("Insufficient funds: requested {requested}, reachable {available}")]
    InsufficientFunds {
        /// Requested amount
        requested: Decimal,
        /// Amount the network could carry
        available: Decimal,
    },

    /// No path to the receiver exists at all
    #[error("No payment routes to {0}")]
    NoPaymentRoutes(NodeId),

    /// Final broadcast failed; the outcome resolves through recovery
    #[error("Protocol error in transaction {transaction}: {reason}")]
    Protocol {
        /// Transaction
        transaction: Uuid,
        /// What failed
        reason: String,
    },

    /// Vote round failed; the transaction was rejected
    #[error("No consensus for transaction {transaction}: {reason}")]
    NoConsensus {
        /// Transaction
        transaction: Uuid,
        /// What failed
        reason: String,
    },

    /// Sender would pay more than the allowed ceiling
    #[error("Payment {required} exceeds the allowed maximum {maximum}")]
    MoreThanMaxAllowableAmount {
        /// Amount the sender would pay
        required: Decimal,
        /// Caller supplied ceiling
        maximum: Decimal,
    },

    /// Queried resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fault hook raised an exception
    #[error("Injected failure at {0:?}")]
    Injected(Checkpoint),

    /// Node was terminated
    #[error("Node terminated")]
    Terminated,

    /// Line ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] line_ledger::Error),

    /// Exchange engine error
    #[error("Exchange error: {0}")]
    Exchange(#[from] exchange_engine::Error),

    /// Observing ledger error
    #[error("Observing ledger error: {0}")]
    Observing(#[from] observing_ledger::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] message_bus::Error),

    /// Unexpected message on the wire
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short label used for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::NoPaymentRoutes(_) => "no_routes",
            Error::Protocol { .. } => "protocol",
            Error::NoConsensus { .. } => "no_consensus",
            Error::MoreThanMaxAllowableAmount { .. } => "max_allowable",
            Error::Injected(_) => "injected",
            Error::Terminated => "terminated",
            _ => "internal",
        }
    }

    /// Transaction a consensus-stage error refers to
    pub fn transaction(&self) -> Option<Uuid> {
        match self {
            Error::Protocol { transaction, .. } | Error::NoConsensus { transaction, .. } => {
                Some(*transaction)
            }
            _ => None,
        }
    }
}
