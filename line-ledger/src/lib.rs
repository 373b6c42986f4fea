//! CreditNet Settlement Line Ledger
//!
//! Per-neighbor, per-equivalent credit accounts with TTL-bound reservations.
//!
//! # Architecture
//!
//! - **Line Locking**: Every settlement line sits behind its own mutex, so
//!   operations on one line serialize while disjoint lines proceed in parallel
//! - **Reservations**: In-flight transactions hold capacity until commit,
//!   release or TTL expiry
//! - **Sweeper**: A background task expires reservations past their TTL
//! - **Durability**: Every mutation is written through to RocksDB
//!
//! # Invariants
//!
//! - Outgoing availability never goes negative through `reserve`
//! - A line is never removed while trust or balance is non-zero
//! - Committed balances are mirrored on both sides of a line

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod line;
pub mod storage;
pub mod ledger;
pub mod error;
pub mod sweeper;
pub mod config;
pub mod metrics;

// Re-exports
pub use config::LedgerConfig;
pub use error::{Error, Result};
pub use ledger::LineLedger;
pub use line::SettlementLine;
pub use metrics::Metrics;
pub use storage::{Column, Storage};
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use types::{
    Direction, Equivalent, LineKey, LineView, LineViolation, NodeId, Precision, Reservation,
    ReservationId,
};
