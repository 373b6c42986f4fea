//! Error types for the line ledger

use crate::types::{Equivalent, NodeId, ReservationId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// No line with this neighbor in this equivalent
    #[error("Settlement line not found: {neighbor} / {equivalent}")]
    LineNotFound {
        /// Neighbor node
        neighbor: NodeId,
        /// Equivalent of the line
        equivalent: Equivalent,
    },

    /// Reservation would push availability below zero
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        requested: Decimal,
        /// Amount available at the time of the request
        available: Decimal,
    },

    /// Reservation not found (released, committed or expired)
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Malformed amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
