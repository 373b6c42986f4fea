//! Error types for message bus

use line_ledger::NodeId;
use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Receiver has no open mailbox
    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),

    /// Message removed by a drop rule
    #[error("Message {kind} from {from} to {to} was lost")]
    Dropped {
        /// Sender
        from: NodeId,
        /// Receiver
        to: NodeId,
        /// Message kind
        kind: &'static str,
    },

    /// No response within the local timeout
    #[error("Request {kind} to {to} timed out")]
    Timeout {
        /// Receiver
        to: NodeId,
        /// Message kind
        kind: &'static str,
    },

    /// Receiver dropped the request without answering
    #[error("Node {0} did not answer")]
    NoResponse(NodeId),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
