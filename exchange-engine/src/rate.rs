//! Native fixed-point exchange rates
//!
//! A native rate is a pair `(value, shift)` with
//!
//! ```text
//! real = value * 10^(shift - 6)
//! ```
//!
//! so `(11207154, 4)` renders as `112071.54`. A rate keeps the pair it was
//! given; equality and hashing go through the canonical form, where trailing
//! zeros of `value` are folded into `shift` (while the shift stays inside
//! `i16`) and zero is `(0, 6)`. Rendering is exact for every representable
//! pair, with no exponent notation.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum fractional digits accepted on real-rate input
pub const MAX_FRACTION_DIGITS: usize = 16;

/// Offset between the native shift and the decimal exponent
const SHIFT_OFFSET: i64 = 6;

/// Fixed-point exchange rate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NativeRate {
    value: u64,
    shift: i16,
}

impl NativeRate {
    /// Create a rate from its native pair, kept as given
    pub fn new(value: u64, shift: i16) -> Self {
        Self { value, shift }
    }

    /// Same rate with trailing zeros folded into the shift
    pub fn canonical(&self) -> Self {
        if self.value == 0 {
            return Self {
                value: 0,
                shift: SHIFT_OFFSET as i16,
            };
        }

        let (mut value, mut shift) = (self.value, self.shift);
        while value % 10 == 0 && shift < i16::MAX {
            value /= 10;
            shift += 1;
        }
        Self { value, shift }
    }

    /// Validate untrusted native input
    pub fn from_parts(value: i64, shift: i64) -> Result<Self> {
        if value < 0 {
            return Err(Error::InvalidRate(format!(
                "native value must not be negative, got {}",
                value
            )));
        }
        let shift = i16::try_from(shift).map_err(|_| Error::ShiftOutOfRange(shift))?;
        Ok(Self::new(value as u64, shift))
    }

    /// Parse a real rate supplied through the control interface
    pub fn parse(literal: &str) -> Result<Self> {
        let (int, frac) = split_literal(literal)?;
        if frac.len() > MAX_FRACTION_DIGITS {
            return Err(Error::TooPrecise {
                digits: frac.len(),
                max: MAX_FRACTION_DIGITS,
            });
        }
        from_digits(int, frac)
    }

    /// Parse a real rate of any precision
    pub fn parse_exact(literal: &str) -> Result<Self> {
        let (int, frac) = split_literal(literal)?;
        from_digits(int, frac)
    }

    /// Convert a decimal rate
    pub fn from_decimal(rate: Decimal) -> Result<Self> {
        Self::parse_exact(&rate.normalize().to_string())
    }

    /// Native value
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Native shift
    pub fn shift(&self) -> i16 {
        self.shift
    }

    /// True for the zero rate
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    fn exponent(&self) -> i64 {
        self.shift as i64 - SHIFT_OFFSET
    }

    /// Exact decimal rendering
    pub fn to_real_string(&self) -> String {
        if self.value == 0 {
            return "0".to_string();
        }

        let digits = self.value.to_string();
        let exponent = self.exponent();
        if exponent >= 0 {
            return format!("{}{}", digits, "0".repeat(exponent as usize));
        }

        let fraction_len = (-exponent) as usize;
        let (int, frac) = if digits.len() > fraction_len {
            let split = digits.len() - fraction_len;
            (digits[..split].to_string(), digits[split..].to_string())
        } else {
            (
                "0".to_string(),
                format!("{}{}", "0".repeat(fraction_len - digits.len()), digits),
            )
        };

        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            int
        } else {
            format!("{}.{}", int, frac)
        }
    }

    /// Rate as a decimal, if it fits the decimal range
    pub fn as_decimal(&self) -> Option<Decimal> {
        let exponent = self.exponent();
        if exponent >= 0 {
            let mut rate = Decimal::from(self.value);
            for _ in 0..exponent {
                rate = rate.checked_mul(Decimal::TEN)?;
            }
            Some(rate)
        } else {
            let scale = u32::try_from(-exponent).ok()?;
            Decimal::try_from_i128_with_scale(self.value as i128, scale).ok()
        }
    }
}

impl PartialEq for NativeRate {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.canonical(), other.canonical());
        (a.value, a.shift) == (b.value, b.shift)
    }
}

impl Eq for NativeRate {}

impl Hash for NativeRate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let canonical = self.canonical();
        canonical.value.hash(state);
        canonical.shift.hash(state);
    }
}

impl fmt::Display for NativeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_real_string())
    }
}

fn split_literal(literal: &str) -> Result<(&str, &str)> {
    let trimmed = literal.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if body.starts_with('-') {
        return Err(Error::InvalidRate(format!(
            "rate must not be negative, got {}",
            literal
        )));
    }

    let (int, frac) = body.split_once('.').unwrap_or((body, ""));
    let digits_only = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (int.is_empty() && frac.is_empty()) || !digits_only(int) || !digits_only(frac) {
        return Err(Error::InvalidRate(format!(
            "expected a plain decimal literal, got {:?}",
            literal
        )));
    }
    Ok((int, frac))
}

fn from_digits(int: &str, frac: &str) -> Result<NativeRate> {
    let all = format!("{}{}", int, frac);
    let significant = all.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(NativeRate::new(0, 0).canonical());
    }

    let digits = significant.trim_end_matches('0');
    let exponent = (significant.len() - digits.len()) as i64 - frac.len() as i64;
    let mut value: u64 = digits.parse().map_err(|_| {
        Error::InvalidRate(format!("{} significant digits do not fit a native rate", digits.len()))
    })?;

    let mut shift = exponent + SHIFT_OFFSET;
    while shift > i16::MAX as i64 {
        value = value
            .checked_mul(10)
            .ok_or(Error::ShiftOutOfRange(shift))?;
        shift -= 1;
    }
    if shift < i16::MIN as i64 {
        return Err(Error::ShiftOutOfRange(shift));
    }

    Ok(NativeRate {
        value,
        shift: shift as i16,
    })
}
