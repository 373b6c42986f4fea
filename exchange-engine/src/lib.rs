//! CreditNet Exchange & Commission Engine
//!
//! Exchange rates between equivalents and per-node commissions.
//!
//! # Components
//!
//! - **Rate codec**: native `(value, shift)` fixed-point rates and their exact
//!   decimal rendering
//! - **Exchange table**: versioned copy-on-write snapshot of rates and
//!   commissions, persisted in the node store
//! - **Transforms**: forward and inverse amount conversion through one node,
//!   with rounding, min/max bounds and commission

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod error;
pub mod rate;
pub mod table;
pub mod convert;

pub use convert::{capacity_through, forward, inverse, required_incoming, HopAmounts};
pub use error::{Error, Result};
pub use rate::NativeRate;
pub use table::{Commission, ExchangeRate, ExchangeSnapshot, ExchangeTable};
