//! Settlement line ledger of one node
//!
//! Lines live in a concurrent map, each behind its own mutex: the line is the
//! unit of mutual exclusion. A mutation is applied to a copy of the line,
//! written to storage while the line lock is held, and only then swapped in,
//! so a failed write leaves the in-memory line untouched. A line closed
//! while another caller waited on its lock is detected after locking and
//! never mutated again.
//!
//! # Example
//!
//! ```no_run
//! use line_ledger::{Direction, Equivalent, LedgerConfig, LineLedger, Metrics, NodeId, Storage};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> line_ledger::Result<()> {
//!     let config = LedgerConfig::default();
//!     let storage = Arc::new(Storage::open(&config)?);
//!     let ledger = LineLedger::open(storage, config.precision(), Metrics::new()?)?;
//!
//!     let bob = NodeId::new("bob");
//!     let eq = Equivalent::new(1);
//!     ledger.set_incoming_trust(&bob, eq, Decimal::from(1000))?;
//!
//!     let tx = uuid::Uuid::new_v4();
//!     let id = ledger.reserve(&bob, eq, Direction::Outgoing, Decimal::from(600), Duration::from_secs(30), tx, 0)?;
//!     ledger.commit(&bob, eq, id)?;
//!     Ok(())
//! }
//! ```

use crate::{
    line::SettlementLine,
    storage::{Column, Storage},
    types::{
        Direction, Equivalent, LineKey, LineView, LineViolation, NodeId, Precision, Reservation,
        ReservationId,
    },
    Error, Metrics, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Settlement line ledger
pub struct LineLedger {
    lines: DashMap<LineKey, Arc<Mutex<SettlementLine>>>,
    storage: Arc<Storage>,
    precision: Precision,
    metrics: Metrics,
}

impl std::fmt::Debug for LineLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineLedger")
            .field("lines", &self.lines.len())
            .finish()
    }
}

impl LineLedger {
    /// Open the ledger, loading every persisted line
    pub fn open(storage: Arc<Storage>, precision: Precision, metrics: Metrics) -> Result<Self> {
        let persisted: Vec<(Vec<u8>, SettlementLine)> = storage.scan(Column::Lines)?;

        let lines = DashMap::new();
        for (_, line) in persisted {
            lines.insert(line.key().clone(), Arc::new(Mutex::new(line)));
        }

        metrics.open_lines.set(lines.len() as i64);
        tracing::info!(lines = lines.len(), "Loaded settlement lines");

        Ok(Self {
            lines,
            storage,
            precision,
            metrics,
        })
    }

    /// Precision table used for amounts on these lines
    pub fn precision(&self) -> &Precision {
        &self.precision
    }

    fn line(&self, neighbor: &NodeId, equivalent: Equivalent) -> Result<Arc<Mutex<SettlementLine>>> {
        let key = LineKey::new(neighbor.clone(), equivalent);
        self.lines
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::LineNotFound {
                neighbor: neighbor.clone(),
                equivalent,
            })
    }

    fn line_or_open(&self, neighbor: &NodeId, equivalent: Equivalent) -> Arc<Mutex<SettlementLine>> {
        let key = LineKey::new(neighbor.clone(), equivalent);
        let entry = self
            .lines
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SettlementLine::open(key))));
        let line = entry.value().clone();
        drop(entry);
        self.metrics.open_lines.set(self.lines.len() as i64);
        line
    }

    fn persist(&self, line: &SettlementLine) -> Result<()> {
        self.storage
            .put(Column::Lines, &line.key().storage_key(), line)
    }

    /// True while `line` is the one the map holds for `key`
    fn is_current(&self, key: &LineKey, line: &Arc<Mutex<SettlementLine>>) -> bool {
        self.lines
            .get(key)
            .map_or(false, |entry| Arc::ptr_eq(entry.value(), line))
    }

    /// Apply `f` to a copy, persist it and swap it in
    fn apply<R>(
        &self,
        line: &mut SettlementLine,
        f: impl FnOnce(&mut SettlementLine) -> Result<R>,
    ) -> Result<R> {
        let mut next = line.clone();
        let result = f(&mut next)?;
        self.persist(&next)?;
        *line = next;
        Ok(result)
    }

    fn with_line<R>(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        f: impl FnOnce(&mut SettlementLine) -> Result<R>,
    ) -> Result<R> {
        let key = LineKey::new(neighbor.clone(), equivalent);
        loop {
            let line = self.line(neighbor, equivalent)?;
            let mut guard = line.lock();
            if !self.is_current(&key, &line) {
                continue;
            }
            return self.apply(&mut guard, f);
        }
    }

    /// Open a line with zero trust in both directions (idempotent)
    pub fn open_line(&self, neighbor: &NodeId, equivalent: Equivalent) -> Result<LineView> {
        let key = LineKey::new(neighbor.clone(), equivalent);
        loop {
            let line = self.line_or_open(neighbor, equivalent);
            let guard = line.lock();
            if !self.is_current(&key, &line) {
                continue;
            }
            self.persist(&guard)?;
            return Ok(guard.view());
        }
    }

    /// Check whether a line exists
    pub fn contains(&self, neighbor: &NodeId, equivalent: Equivalent) -> bool {
        self.lines
            .contains_key(&LineKey::new(neighbor.clone(), equivalent))
    }

    /// Set the limit this node extends to the neighbor
    pub fn set_outgoing_trust(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<LineView> {
        self.set_trust(neighbor, equivalent, amount, Direction::Outgoing)
    }

    /// Set the limit the neighbor extends to this node
    pub fn set_incoming_trust(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<LineView> {
        self.set_trust(neighbor, equivalent, amount, Direction::Incoming)
    }

    fn set_trust(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
        direction: Direction,
    ) -> Result<LineView> {
        if !self.precision.is_exact(equivalent, amount) {
            return Err(Error::InvalidAmount(format!(
                "{} has more fractional digits than {} allows",
                amount, equivalent
            )));
        }

        let key = LineKey::new(neighbor.clone(), equivalent);
        loop {
            let line = self.line_or_open(neighbor, equivalent);
            let mut guard = line.lock();
            if !self.is_current(&key, &line) {
                continue;
            }

            let mut next = guard.clone();
            match direction {
                Direction::Outgoing => next.set_outgoing_trust(amount)?,
                Direction::Incoming => next.set_incoming_trust(amount)?,
            }

            // Lines without trust, balance or holds are closed
            if next.is_idle() {
                self.storage.delete(Column::Lines, &key.storage_key())?;
                self.lines
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &line));
                self.metrics.open_lines.set(self.lines.len() as i64);
                tracing::info!(line = %key, "Settlement line closed");
            } else {
                self.persist(&next)?;
                tracing::info!(
                    line = %key,
                    ?direction,
                    %amount,
                    "Settlement line trust updated"
                );
            }

            *guard = next;
            return Ok(guard.view());
        }
    }

    /// Hold capacity on a line
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        direction: Direction,
        amount: Decimal,
        ttl: Duration,
        transaction: Uuid,
        path_id: u32,
    ) -> Result<ReservationId> {
        let expires_at = Utc::now() + to_chrono(ttl);
        let result = self.with_line(neighbor, equivalent, |line| {
            line.reserve(direction, amount, expires_at, transaction, path_id)
        });

        match &result {
            Ok(id) => {
                self.metrics.reservations_total.inc();
                tracing::debug!(
                    %transaction,
                    path = path_id,
                    neighbor = %neighbor,
                    %equivalent,
                    ?direction,
                    %amount,
                    reservation = %id,
                    "Reservation granted"
                );
            }
            Err(e) => {
                self.metrics.reservation_rejections.inc();
                tracing::debug!(
                    %transaction,
                    path = path_id,
                    neighbor = %neighbor,
                    ?direction,
                    %amount,
                    error = %e,
                    "Reservation refused"
                );
            }
        }

        result
    }

    /// Release a reservation
    pub fn release(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        id: ReservationId,
    ) -> Result<Reservation> {
        self.with_line(neighbor, equivalent, |line| line.release(id))
    }

    /// Commit a reservation into the balance
    pub fn commit(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        id: ReservationId,
    ) -> Result<Reservation> {
        let reservation = self.with_line(neighbor, equivalent, |line| line.commit(id))?;
        self.metrics.commits_total.inc();
        Ok(reservation)
    }

    /// Apply an amount to the balance without a reservation
    pub fn settle(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        direction: Direction,
        amount: Decimal,
    ) -> Result<()> {
        let key = LineKey::new(neighbor.clone(), equivalent);
        loop {
            let line = self.line_or_open(neighbor, equivalent);
            let mut guard = line.lock();
            if !self.is_current(&key, &line) {
                continue;
            }
            self.apply(&mut guard, |line| {
                line.settle(direction, amount);
                Ok(())
            })?;
            self.metrics.commits_total.inc();
            return Ok(());
        }
    }

    /// Reduce a reservation to its final amount
    pub fn shrink(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        id: ReservationId,
        amount: Decimal,
    ) -> Result<()> {
        self.with_line(neighbor, equivalent, |line| line.shrink(id, amount))
    }

    /// Look up a reservation
    pub fn reservation(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        id: ReservationId,
    ) -> Option<Reservation> {
        let line = self.line(neighbor, equivalent).ok()?;
        let guard = line.lock();
        guard.reservation(id).cloned()
    }

    /// Push the expiry of every hold of a transaction forward
    pub fn extend_transaction(&self, transaction: Uuid, expires_at: DateTime<Utc>) -> Result<usize> {
        let mut extended = 0;
        for line in self.all_lines() {
            let mut guard = line.lock();
            let holds = guard.reservations_of(transaction);
            if holds.is_empty() {
                continue;
            }
            self.apply(&mut guard, |line| {
                for hold in &holds {
                    line.extend(hold.id, expires_at)?;
                }
                Ok(())
            })?;
            extended += holds.len();
        }
        Ok(extended)
    }

    /// Release every hold of a transaction
    pub fn release_transaction(&self, transaction: Uuid) -> Result<Vec<Reservation>> {
        let mut released = Vec::new();
        for line in self.all_lines() {
            let mut guard = line.lock();
            let holds = guard.reservations_of(transaction);
            if holds.is_empty() {
                continue;
            }
            let removed = self.apply(&mut guard, |line| {
                holds
                    .iter()
                    .map(|hold| line.release(hold.id))
                    .collect::<Result<Vec<_>>>()
            })?;
            released.extend(removed);
        }

        if !released.is_empty() {
            tracing::debug!(%transaction, count = released.len(), "Released transaction holds");
        }
        Ok(released)
    }

    /// Holds of a transaction on every line
    pub fn transaction_reservations(&self, transaction: Uuid) -> Vec<(LineKey, Reservation)> {
        let mut holds = Vec::new();
        for line in self.all_lines() {
            let guard = line.lock();
            for hold in guard.reservations_of(transaction) {
                holds.push((guard.key().clone(), hold));
            }
        }
        holds
    }

    /// Query one line
    pub fn query(&self, neighbor: &NodeId, equivalent: Equivalent) -> Result<LineView> {
        let line = self.line(neighbor, equivalent)?;
        let guard = line.lock();
        Ok(guard.view())
    }

    /// Query every line, ordered by key
    pub fn list(&self) -> Vec<LineView> {
        let mut views: Vec<LineView> = self.all_lines().iter().map(|l| l.lock().view()).collect();
        views.sort_by(|a, b| {
            (a.equivalent, &a.neighbor).cmp(&(b.equivalent, &b.neighbor))
        });
        views
    }

    /// Outgoing availability towards every neighbor in one equivalent
    pub fn outgoing_capacities(&self, equivalent: Equivalent) -> Vec<(NodeId, Decimal)> {
        self.list()
            .into_iter()
            .filter(|view| view.equivalent == equivalent && view.available_outgoing > Decimal::ZERO)
            .map(|view| (view.neighbor, view.available_outgoing))
            .collect()
    }

    /// Neighbors with at least one line
    pub fn neighbors(&self) -> BTreeSet<NodeId> {
        self.lines
            .iter()
            .map(|entry| entry.key().neighbor.clone())
            .collect()
    }

    /// Remove every reservation whose TTL has elapsed
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut expired = Vec::new();
        for line in self.all_lines() {
            let mut guard = line.lock();
            let mut next = guard.clone();
            let removed = next.expire(now);
            if removed.is_empty() {
                continue;
            }
            self.persist(&next)?;
            *guard = next;
            for reservation in &removed {
                tracing::info!(
                    transaction = %reservation.transaction,
                    line = %guard.key(),
                    amount = %reservation.amount,
                    "Reservation expired"
                );
            }
            expired.extend(removed);
        }

        self.metrics.reservations_expired.inc_by(expired.len() as u64);
        Ok(expired)
    }

    /// Lines whose committed balance is outside the current trust limits
    pub fn violations(&self) -> Vec<LineViolation> {
        self.all_lines()
            .iter()
            .filter_map(|line| line.lock().violation())
            .collect()
    }

    fn all_lines(&self) -> Vec<Arc<Mutex<SettlementLine>>> {
        self.lines.iter().map(|entry| entry.value().clone()).collect()
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerConfig;
    use tempfile::TempDir;

    fn test_ledger() -> (LineLedger, LedgerConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = LedgerConfig::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let ledger = LineLedger::open(storage, config.precision(), Metrics::new().unwrap()).unwrap();
        (ledger, config, temp_dir)
    }

    fn bob() -> NodeId {
        NodeId::new("bob")
    }

    const EQ: Equivalent = Equivalent::new(1);
    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_reserve_commit_and_query() {
        let (ledger, _config, _temp) = test_ledger();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(1000)).unwrap();

        let tx = Uuid::new_v4();
        let id = ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::from(600), TTL, tx, 0)
            .unwrap();
        assert_eq!(
            ledger.query(&bob(), EQ).unwrap().available_outgoing,
            Decimal::from(400)
        );

        ledger.commit(&bob(), EQ, id).unwrap();
        let view = ledger.query(&bob(), EQ).unwrap();
        assert_eq!(view.balance, Decimal::from(-600));
        assert_eq!(view.available_outgoing, Decimal::from(400));
        assert_eq!(view.available_incoming, Decimal::from(600));
    }

    #[test]
    fn test_failed_write_leaves_line_unchanged() {
        let (ledger, _config, _temp) = test_ledger();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(1000)).unwrap();
        ledger.storage.drop_column(Column::Lines).unwrap();

        let tx = Uuid::new_v4();
        assert!(ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::from(600), TTL, tx, 0)
            .is_err());
        assert!(ledger
            .settle(&bob(), EQ, Direction::Outgoing, Decimal::from(10))
            .is_err());

        let view = ledger.query(&bob(), EQ).unwrap();
        assert_eq!(view.available_outgoing, Decimal::from(1000));
        assert_eq!(view.balance, Decimal::ZERO);
        assert!(ledger.transaction_reservations(tx).is_empty());
    }

    #[test]
    fn test_closed_line_handle_is_not_reused() {
        let (ledger, _config, _temp) = test_ledger();
        let key = LineKey::new(bob(), EQ);
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(100)).unwrap();
        let stale = ledger.line(&bob(), EQ).unwrap();

        ledger.set_incoming_trust(&bob(), EQ, Decimal::ZERO).unwrap();
        assert!(!ledger.contains(&bob(), EQ));
        assert!(!ledger.is_current(&key, &stale));

        let err = ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::ONE, TTL, Uuid::new_v4(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::LineNotFound { .. }));

        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(50)).unwrap();
        assert!(!Arc::ptr_eq(&stale, &ledger.line(&bob(), EQ).unwrap()));
    }

    #[test]
    fn test_reservations_survive_concurrent_close() {
        let (ledger, _config, _temp) = test_ledger();
        let ledger = Arc::new(ledger);
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(100)).unwrap();

        let toggler = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let trust = if i % 2 == 0 { Decimal::ZERO } else { Decimal::from(100) };
                    let _ = ledger.set_incoming_trust(&bob(), EQ, trust);
                }
            })
        };

        for _ in 0..200 {
            let tx = Uuid::new_v4();
            if let Ok(id) = ledger.reserve(&bob(), EQ, Direction::Outgoing, Decimal::ONE, TTL, tx, 0) {
                assert_eq!(ledger.transaction_reservations(tx).len(), 1);
                ledger.release(&bob(), EQ, id).unwrap();
            }
        }
        toggler.join().unwrap();
    }

    #[test]
    fn test_reserve_on_missing_line() {
        let (ledger, _config, _temp) = test_ledger();
        let err = ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::ONE, TTL, Uuid::new_v4(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::LineNotFound { .. }));
    }

    #[test]
    fn test_trust_precision_validated() {
        let (ledger, _config, _temp) = test_ledger();
        let err = ledger
            .set_outgoing_trust(&bob(), EQ, Decimal::new(1001, 3))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
        assert!(!ledger.contains(&bob(), EQ));
    }

    #[test]
    fn test_zero_trust_closes_idle_line() {
        let (ledger, _config, _temp) = test_ledger();
        ledger.set_outgoing_trust(&bob(), EQ, Decimal::from(10)).unwrap();
        assert!(ledger.contains(&bob(), EQ));

        ledger.set_outgoing_trust(&bob(), EQ, Decimal::ZERO).unwrap();
        assert!(!ledger.contains(&bob(), EQ));
    }

    #[test]
    fn test_line_with_balance_is_kept() {
        let (ledger, _config, _temp) = test_ledger();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(10)).unwrap();
        ledger
            .settle(&bob(), EQ, Direction::Outgoing, Decimal::from(5))
            .unwrap();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::ZERO).unwrap();
        assert!(ledger.contains(&bob(), EQ));
        assert_eq!(ledger.violations().len(), 1);
    }

    #[test]
    fn test_release_and_extend_transaction() {
        let (ledger, _config, _temp) = test_ledger();
        let carol = NodeId::new("carol");
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(100)).unwrap();
        ledger.set_outgoing_trust(&carol, EQ, Decimal::from(100)).unwrap();

        let tx = Uuid::new_v4();
        ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::from(40), TTL, tx, 0)
            .unwrap();
        ledger
            .reserve(&carol, EQ, Direction::Incoming, Decimal::from(40), TTL, tx, 0)
            .unwrap();

        let until = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(ledger.extend_transaction(tx, until).unwrap(), 2);
        assert!(ledger
            .transaction_reservations(tx)
            .iter()
            .all(|(_, r)| r.expires_at == until));

        assert_eq!(ledger.release_transaction(tx).unwrap().len(), 2);
        assert_eq!(
            ledger.query(&bob(), EQ).unwrap().available_outgoing,
            Decimal::from(100)
        );
    }

    #[test]
    fn test_expire_restores_capacity() {
        let (ledger, _config, _temp) = test_ledger();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(100)).unwrap();
        ledger
            .reserve(
                &bob(),
                EQ,
                Direction::Outgoing,
                Decimal::from(100),
                Duration::from_millis(1),
                Uuid::new_v4(),
                0,
            )
            .unwrap();

        let expired = ledger
            .expire(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            ledger.outgoing_capacities(EQ),
            vec![(bob(), Decimal::from(100))]
        );
    }

    #[test]
    fn test_lines_survive_reopen() {
        let (ledger, config, _temp) = test_ledger();
        ledger.set_incoming_trust(&bob(), EQ, Decimal::from(1000)).unwrap();
        let tx = Uuid::new_v4();
        ledger
            .reserve(&bob(), EQ, Direction::Outgoing, Decimal::from(10), TTL, tx, 3)
            .unwrap();
        drop(ledger);

        let storage = Arc::new(Storage::open(&config).unwrap());
        let reopened = LineLedger::open(storage, config.precision(), Metrics::new().unwrap()).unwrap();
        let view = reopened.query(&bob(), EQ).unwrap();
        assert_eq!(view.incoming_trust, Decimal::from(1000));
        assert_eq!(view.outgoing_reserved, Decimal::from(10));
        assert_eq!(reopened.transaction_reservations(tx)[0].1.path_id, 3);
    }
}
