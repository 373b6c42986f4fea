//! Payment engine of a credit network node
//!
//! Moves value between nodes over chains of settlement lines, converting
//! between equivalents where intermediates publish exchange rates.
//!
//! # Architecture
//!
//! A payment runs through four phases:
//!
//! 1. **Routing**: Discover the neighborhood up to `max_hops` and enumerate simple routes
//! 2. **Reservation**: Hold capacity on every line of each route, receiver first
//! 3. **Voting**: Every participant signs the digest of the final path configuration
//! 4. **Commit**: Holds become balance once the full signature set is known
//!
//! Participants that voted but never heard the outcome poll their
//! neighbors and finally defer to the shared observing ledger.
//!
//! # Example
//!
//! ```no_run
//! use message_bus::Bus;
//! use observing_ledger::{ObservingConfig, ObservingLedger};
//! use payment_engine::{Config, Node, ProtocolMessage};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> payment_engine::Result<()> {
//!     let bus = Arc::new(Bus::<ProtocolMessage>::default());
//!     let observing = Arc::new(ObservingLedger::new(ObservingConfig::default()));
//!
//!     let alice = Node::start(Config::for_node("alice", "./data/alice"), bus.clone(), observing.clone()).await?;
//!     let bob = Node::start(Config::for_node("bob", "./data/bob"), bus.clone(), observing).await?;
//!
//!     let eq = line_ledger::Equivalent::new(1);
//!     alice.open_channel(bob.id()).await?;
//!     bob.set_settlement_line(alice.id(), eq, Decimal::from(1000)).await?;
//!
//!     let transaction = alice.create_transaction(bob.id(), eq, Decimal::from(600)).await?;
//!     println!("committed {}", transaction);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod faults;
pub mod messages;
pub mod metrics;
pub mod routing;
pub mod store;
pub mod types;

mod audit;
mod coordinator;
mod node;
mod participant;
mod recovery;

pub use config::Config;
pub use error::{Error, Result};
pub use faults::{Checkpoint, FaultAction, FaultPlan};
pub use messages::ProtocolMessage;
pub use node::{Node, RateInput};
pub use types::{
    AuditReport, ExchangeFlow, PaymentRequest, RecoveryEntry, RecoveryEvent, Role, Route, Stage,
    TransactionView,
};
