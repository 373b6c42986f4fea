//! Error types for the observing ledger

use line_ledger::NodeId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for observing ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Observing ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Signature does not verify
    #[error("Invalid signature from {node}")]
    InvalidSignature {
        /// Signing node
        node: NodeId,
    },

    /// Claim carries no signatures
    #[error("Claim for {0} carries no signatures")]
    EmptyClaim(Uuid),

    /// Claim conflicts with an accepted claim
    #[error("Conflicting claim for {0}")]
    ConflictingClaim(Uuid),

    /// Claim window has closed
    #[error("Claim window for {0} is closed")]
    WindowClosed(Uuid),

    /// Transaction was already rejected
    #[error("Transaction {0} already rejected")]
    AlreadyRejected(Uuid),

    /// Transaction was already claimed
    #[error("Transaction {0} already claimed")]
    AlreadyClaimed(Uuid),

    /// Malformed key material
    #[error("Key error: {0}")]
    Key(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
