//! Core types for the line ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for amounts)

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Node identifier (opaque, unique within the network)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create new node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unit of value tracked by a settlement line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Equivalent(u32);

impl Equivalent {
    /// Create new equivalent
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric identifier
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Equivalent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eq:{}", self.0)
    }
}

/// Per-equivalent decimal precision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precision {
    default_scale: u32,
    scales: HashMap<Equivalent, u32>,
}

impl Precision {
    /// Create with a default number of fractional digits
    pub fn new(default_scale: u32) -> Self {
        Self {
            default_scale,
            scales: HashMap::new(),
        }
    }

    /// Override the precision of one equivalent
    pub fn with_scale(mut self, equivalent: Equivalent, scale: u32) -> Self {
        self.scales.insert(equivalent, scale);
        self
    }

    /// Fractional digits of an equivalent
    pub fn scale(&self, equivalent: Equivalent) -> u32 {
        self.scales
            .get(&equivalent)
            .copied()
            .unwrap_or(self.default_scale)
    }

    /// Round toward zero to the equivalent's precision
    pub fn round_down(&self, equivalent: Equivalent, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale(equivalent), RoundingStrategy::ToZero)
    }

    /// Round away from zero to the equivalent's precision
    pub fn round_up(&self, equivalent: Equivalent, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale(equivalent), RoundingStrategy::AwayFromZero)
    }

    /// True when the amount is already expressed in the equivalent's precision
    pub fn is_exact(&self, equivalent: Equivalent, amount: Decimal) -> bool {
        self.round_down(equivalent, amount) == amount
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Key of a settlement line as seen by its owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineKey {
    /// The other side of the line
    pub neighbor: NodeId,
    /// Equivalent of the line
    pub equivalent: Equivalent,
}

impl LineKey {
    /// Create new line key
    pub fn new(neighbor: NodeId, equivalent: Equivalent) -> Self {
        Self {
            neighbor,
            equivalent,
        }
    }

    /// Storage key: equivalent (big endian) || neighbor
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = self.equivalent.id().to_be_bytes().to_vec();
        key.extend_from_slice(self.neighbor.as_str().as_bytes());
        key
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.neighbor, self.equivalent)
    }
}

/// Side of the line a reservation holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Funds this node will pay to the neighbor
    Outgoing,
    /// Funds the neighbor will pay to this node
    Incoming,
}

/// Reservation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Generate a fresh, time-ordered reservation ID
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Temporary hold on line capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID
    pub id: ReservationId,

    /// Transaction holding the reservation
    pub transaction: Uuid,

    /// Path inside the transaction
    pub path_id: u32,

    /// Which side of the line is held
    pub direction: Direction,

    /// Held amount
    pub amount: Decimal,

    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Check whether the TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Snapshot of a line returned by queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineView {
    /// Neighbor node
    pub neighbor: NodeId,

    /// Equivalent
    pub equivalent: Equivalent,

    /// Limit this node extends to the neighbor
    pub outgoing_trust: Decimal,

    /// Limit the neighbor extends to this node
    pub incoming_trust: Decimal,

    /// Committed balance (positive: neighbor owes this node)
    pub balance: Decimal,

    /// Sum of outgoing reservations
    pub outgoing_reserved: Decimal,

    /// Sum of incoming reservations
    pub incoming_reserved: Decimal,

    /// What this node can still pay the neighbor
    pub available_outgoing: Decimal,

    /// What the neighbor can still pay this node
    pub available_incoming: Decimal,
}

/// Line whose committed balance is outside its trust bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineViolation {
    /// Affected line
    pub key: LineKey,

    /// Balance at audit time
    pub balance: Decimal,

    /// Lower bound (-incoming trust)
    pub lower_bound: Decimal,

    /// Upper bound (outgoing trust)
    pub upper_bound: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_rounding() {
        let precision = Precision::new(2).with_scale(Equivalent::new(7), 0);
        let eq = Equivalent::new(1);

        assert_eq!(precision.round_down(eq, Decimal::new(12345, 3)), Decimal::new(1234, 2));
        assert_eq!(precision.round_up(eq, Decimal::new(12341, 3)), Decimal::new(1235, 2));
        assert_eq!(precision.round_up(Equivalent::new(7), Decimal::new(101, 2)), Decimal::from(2));
        assert!(precision.is_exact(eq, Decimal::new(1050, 2)));
        assert!(!precision.is_exact(eq, Decimal::new(10501, 3)));
    }

    #[test]
    fn test_line_key_storage_key_groups_by_equivalent() {
        let a = LineKey::new(NodeId::new("alice"), Equivalent::new(1));
        let b = LineKey::new(NodeId::new("bob"), Equivalent::new(1));
        assert_eq!(a.storage_key()[..4], b.storage_key()[..4]);
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn test_reservation_expiry() {
        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::generate(),
            transaction: Uuid::new_v4(),
            path_id: 0,
            direction: Direction::Outgoing,
            amount: Decimal::from(10),
            expires_at: now,
        };
        assert!(reservation.is_expired(now));
        assert!(!reservation.is_expired(now - chrono::Duration::seconds(1)));
    }
}
