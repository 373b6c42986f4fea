//! CreditNet Observing Ledger
//!
//! Append-only arbiter for transactions whose participants could not reach a
//! decision by direct messaging.
//!
//! # Protocol
//!
//! 1. A participant stuck in recovery requests arbitration; this opens a claim
//!    window of `cnt_blocks_for_claiming` blocks
//! 2. Any node holding the full signature set submits a claim; the claim is
//!    verified against every participant key
//! 3. Once the window closes without a claim the transaction is rejected
//! 4. Accepted claims are sealed into Merkle-rooted blocks as block heights
//!    advance
//!
//! Blocks are produced lazily: heights derive from wall-clock time since
//! genesis and are sealed the next time the ledger is touched.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod types;

pub use config::ObservingConfig;
pub use crypto::{hash_bytes, merkle_root, vote_payload, KeyPair};
pub use error::{Error, Result};
pub use ledger::ObservingLedger;
pub use types::{Block, Claim, ObservingRecord, ObservingState, ParticipantSignature};

pub use ed25519_dalek::{Signature, VerifyingKey};
