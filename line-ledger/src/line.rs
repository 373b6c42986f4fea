//! A single settlement line as seen by its owner
//!
//! The line tracks two trust limits (one per direction), the committed
//! balance and every reservation currently holding capacity.
//!
//! ```text
//! available_outgoing = incoming_trust + balance - outgoing_reserved
//! available_incoming = outgoing_trust - balance - incoming_reserved
//! ```

use crate::{
    types::{Direction, Equivalent, LineKey, LineView, LineViolation, NodeId, Reservation, ReservationId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Settlement line state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLine {
    key: LineKey,
    outgoing_trust: Decimal,
    incoming_trust: Decimal,
    balance: Decimal,
    reservations: BTreeMap<ReservationId, Reservation>,
}

impl SettlementLine {
    /// Open an empty line
    pub fn open(key: LineKey) -> Self {
        Self {
            key,
            outgoing_trust: Decimal::ZERO,
            incoming_trust: Decimal::ZERO,
            balance: Decimal::ZERO,
            reservations: BTreeMap::new(),
        }
    }

    /// Line key
    pub fn key(&self) -> &LineKey {
        &self.key
    }

    /// Neighbor node
    pub fn neighbor(&self) -> &NodeId {
        &self.key.neighbor
    }

    /// Equivalent
    pub fn equivalent(&self) -> Equivalent {
        self.key.equivalent
    }

    /// Committed balance
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    fn reserved(&self, direction: Direction) -> Decimal {
        self.reservations
            .values()
            .filter(|r| r.direction == direction)
            .map(|r| r.amount)
            .sum()
    }

    /// What this node can still pay the neighbor
    pub fn available_outgoing(&self) -> Decimal {
        (self.incoming_trust + self.balance - self.reserved(Direction::Outgoing)).max(Decimal::ZERO)
    }

    /// What the neighbor can still pay this node
    pub fn available_incoming(&self) -> Decimal {
        (self.outgoing_trust - self.balance - self.reserved(Direction::Incoming)).max(Decimal::ZERO)
    }

    fn available(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Outgoing => self.available_outgoing(),
            Direction::Incoming => self.available_incoming(),
        }
    }

    /// Set the limit this node extends to the neighbor
    pub fn set_outgoing_trust(&mut self, amount: Decimal) -> Result<()> {
        ensure_non_negative(amount)?;
        self.outgoing_trust = amount;
        Ok(())
    }

    /// Set the limit the neighbor extends to this node
    pub fn set_incoming_trust(&mut self, amount: Decimal) -> Result<()> {
        ensure_non_negative(amount)?;
        self.incoming_trust = amount;
        Ok(())
    }

    /// Hold capacity for an in-flight transaction
    pub fn reserve(
        &mut self,
        direction: Direction,
        amount: Decimal,
        expires_at: DateTime<Utc>,
        transaction: Uuid,
        path_id: u32,
    ) -> Result<ReservationId> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "reservation amount must be positive, got {}",
                amount
            )));
        }

        let available = self.available(direction);
        if amount > available {
            return Err(Error::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let id = ReservationId::generate();
        self.reservations.insert(
            id,
            Reservation {
                id,
                transaction,
                path_id,
                direction,
                amount,
                expires_at,
            },
        );

        Ok(id)
    }

    /// Drop a reservation, restoring availability
    pub fn release(&mut self, id: ReservationId) -> Result<Reservation> {
        self.reservations
            .remove(&id)
            .ok_or(Error::ReservationNotFound(id))
    }

    /// Move a reservation into the committed balance
    pub fn commit(&mut self, id: ReservationId) -> Result<Reservation> {
        let reservation = self.release(id)?;
        self.settle(reservation.direction, reservation.amount);
        Ok(reservation)
    }

    /// Apply a committed amount directly (used when the hold has already expired)
    pub fn settle(&mut self, direction: Direction, amount: Decimal) {
        match direction {
            Direction::Outgoing => self.balance -= amount,
            Direction::Incoming => self.balance += amount,
        }
    }

    /// Reduce a reservation to the final configured amount
    pub fn shrink(&mut self, id: ReservationId, amount: Decimal) -> Result<()> {
        let reservation = self
            .reservations
            .get_mut(&id)
            .ok_or(Error::ReservationNotFound(id))?;

        if amount > reservation.amount {
            return Err(Error::InvalidAmount(format!(
                "cannot grow reservation {} from {} to {}",
                id, reservation.amount, amount
            )));
        }
        reservation.amount = amount;
        Ok(())
    }

    /// Push the expiry of a reservation forward
    pub fn extend(&mut self, id: ReservationId, expires_at: DateTime<Utc>) -> Result<()> {
        let reservation = self
            .reservations
            .get_mut(&id)
            .ok_or(Error::ReservationNotFound(id))?;
        if expires_at > reservation.expires_at {
            reservation.expires_at = expires_at;
        }
        Ok(())
    }

    /// Look up a reservation
    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    /// All reservations of one transaction
    pub fn reservations_of(&self, transaction: Uuid) -> Vec<Reservation> {
        self.reservations
            .values()
            .filter(|r| r.transaction == transaction)
            .cloned()
            .collect()
    }

    /// Remove and return reservations past their TTL
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Reservation> {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.reservations.remove(&id))
            .collect()
    }

    /// True when the line carries no trust, balance or holds
    pub fn is_idle(&self) -> bool {
        self.outgoing_trust.is_zero()
            && self.incoming_trust.is_zero()
            && self.balance.is_zero()
            && self.reservations.is_empty()
    }

    /// Check the committed balance against both trust limits
    pub fn violation(&self) -> Option<LineViolation> {
        let lower_bound = -self.incoming_trust;
        let upper_bound = self.outgoing_trust;
        if self.balance < lower_bound || self.balance > upper_bound {
            Some(LineViolation {
                key: self.key.clone(),
                balance: self.balance,
                lower_bound,
                upper_bound,
            })
        } else {
            None
        }
    }

    /// Query snapshot
    pub fn view(&self) -> LineView {
        LineView {
            neighbor: self.key.neighbor.clone(),
            equivalent: self.key.equivalent,
            outgoing_trust: self.outgoing_trust,
            incoming_trust: self.incoming_trust,
            balance: self.balance,
            outgoing_reserved: self.reserved(Direction::Outgoing),
            incoming_reserved: self.reserved(Direction::Incoming),
            available_outgoing: self.available_outgoing(),
            available_incoming: self.available_incoming(),
        }
    }
}

fn ensure_non_negative(amount: Decimal) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "trust amount must not be negative, got {}",
            amount
        )));
    }
    Ok(())
}
