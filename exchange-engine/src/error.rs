//! Error types for the exchange engine

use line_ledger::Equivalent;
use rust_decimal::Decimal;
use thiserror::Error;

/// Exchange engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed rate literal or native pair
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    /// Real rate with more fractional digits than allowed
    #[error("Rate has {digits} fractional digits, at most {max} allowed")]
    TooPrecise {
        /// Digits supplied
        digits: usize,
        /// Digits allowed
        max: usize,
    },

    /// Shift outside the int16 range
    #[error("Shift {0} out of range")]
    ShiftOutOfRange(i64),

    /// Malformed commission or bound
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// No rate for this pair
    #[error("No exchange rate {from} -> {to}")]
    RateNotFound {
        /// Source equivalent
        from: Equivalent,
        /// Target equivalent
        to: Equivalent,
    },

    /// Rate cannot be used for arithmetic
    #[error("Rate {0} is outside the usable range")]
    Unusable(String),

    /// Amount outside the rate's min/max bounds
    #[error("Amount {amount} outside exchange bounds [{min:?}, {max:?}]")]
    OutOfBounds {
        /// Amount to exchange
        amount: Decimal,
        /// Lower bound
        min: Option<Decimal>,
        /// Upper bound
        max: Option<Decimal>,
    },

    /// Arithmetic overflow
    #[error("Arithmetic overflow")]
    Overflow,

    /// Persistence error
    #[error("Ledger storage error: {0}")]
    Ledger(#[from] line_ledger::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
