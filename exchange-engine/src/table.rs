//! Versioned exchange-rate and commission table
//!
//! Writers clone the current snapshot, modify the clone and swap it in under a
//! short write lock. Readers take an `Arc` to the snapshot once per protocol
//! stage, so a rate change never alters amounts already computed from an
//! older snapshot.

use crate::{Error, NativeRate, Result};
use chrono::{DateTime, Utc};
use line_ledger::{Column, Equivalent, Storage};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const SNAPSHOT_KEY: &[u8] = b"snapshot";

/// Exchange rate from one equivalent to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Equivalent given to the node
    pub from: Equivalent,

    /// Equivalent paid out by the node
    pub to: Equivalent,

    /// One unit of `from` buys `native` units of `to`
    pub native: NativeRate,

    /// Smallest amount of `from` the node exchanges
    pub min_amount: Option<Decimal>,

    /// Largest amount of `from` the node exchanges
    pub max_amount: Option<Decimal>,

    /// The rate is ignored from this moment on
    pub expires_at: Option<DateTime<Utc>>,
}

impl ExchangeRate {
    /// Create a rate without bounds
    pub fn new(from: Equivalent, to: Equivalent, native: NativeRate) -> Self {
        Self {
            from,
            to,
            native,
            min_amount: None,
            max_amount: None,
            expires_at: None,
        }
    }

    /// Attach min/max bounds
    pub fn with_bounds(mut self, min_amount: Option<Decimal>, max_amount: Option<Decimal>) -> Self {
        self.min_amount = min_amount;
        self.max_amount = max_amount;
        self
    }

    /// Expire the rate `ttl` from now
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    /// True while the rate may be used at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }

    /// Real rate rendering
    pub fn real(&self) -> String {
        self.native.to_real_string()
    }

    /// Rate as a decimal multiplier
    pub fn multiplier(&self) -> Result<Decimal> {
        match self.native.as_decimal() {
            Some(rate) if !rate.is_zero() => Ok(rate),
            _ => Err(Error::Unusable(self.real())),
        }
    }

    /// Check an amount of `from` against the bounds
    pub fn check_bounds(&self, amount: Decimal) -> Result<()> {
        let below = self.min_amount.map_or(false, |min| amount < min);
        let above = self.max_amount.map_or(false, |max| amount > max);
        if below || above {
            return Err(Error::OutOfBounds {
                amount,
                min: self.min_amount,
                max: self.max_amount,
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.from == self.to {
            return Err(Error::InvalidRate(format!(
                "rate from {} to itself",
                self.from
            )));
        }
        for bound in [self.min_amount, self.max_amount].into_iter().flatten() {
            if bound < Decimal::ZERO {
                return Err(Error::InvalidAmount(format!(
                    "exchange bound must not be negative, got {}",
                    bound
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(Error::InvalidAmount(format!(
                    "min {} exceeds max {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// Commission charged by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    /// Equivalent the commission is charged in
    pub equivalent: Equivalent,

    /// Fixed amount
    pub amount: Decimal,
}

/// Immutable view of the table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    version: u64,
    rates: BTreeMap<(Equivalent, Equivalent), ExchangeRate>,
    commissions: BTreeMap<Equivalent, Decimal>,
}

impl ExchangeSnapshot {
    /// Monotonic version, bumped on every write
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Live rate for a pair
    pub fn rate(&self, from: Equivalent, to: Equivalent) -> Option<&ExchangeRate> {
        self.rates
            .get(&(from, to))
            .filter(|rate| rate.is_live(Utc::now()))
    }

    /// Every live rate, ordered by pair
    pub fn rates(&self) -> impl Iterator<Item = &ExchangeRate> {
        let now = Utc::now();
        self.rates.values().filter(move |rate| rate.is_live(now))
    }

    /// Commission in an equivalent
    pub fn commission(&self, equivalent: Equivalent) -> Option<Commission> {
        self.commissions
            .get(&equivalent)
            .map(|amount| Commission {
                equivalent,
                amount: *amount,
            })
    }

    /// Every commission
    pub fn commissions(&self) -> Vec<Commission> {
        self.commissions
            .iter()
            .map(|(equivalent, amount)| Commission {
                equivalent: *equivalent,
                amount: *amount,
            })
            .collect()
    }
}

/// Shared exchange table of one node
pub struct ExchangeTable {
    current: RwLock<Arc<ExchangeSnapshot>>,
    write_lock: Mutex<()>,
    storage: Option<Arc<Storage>>,
}

impl std::fmt::Debug for ExchangeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeTable")
            .field("version", &self.current.read().version)
            .finish()
    }
}

impl ExchangeTable {
    /// Table that is not persisted
    pub fn in_memory() -> Self {
        Self::with_snapshot(ExchangeSnapshot::default(), None)
    }

    /// Load the table from node storage
    pub fn open(storage: Arc<Storage>) -> Result<Self> {
        let snapshot: ExchangeSnapshot = storage
            .get(Column::Exchange, SNAPSHOT_KEY)?
            .unwrap_or_default();

        tracing::info!(
            rates = snapshot.rates.len(),
            commissions = snapshot.commissions.len(),
            version = snapshot.version,
            "Loaded exchange table"
        );

        Ok(Self::with_snapshot(snapshot, Some(storage)))
    }

    fn with_snapshot(snapshot: ExchangeSnapshot, storage: Option<Arc<Storage>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
            storage,
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ExchangeSnapshot> {
        self.current.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ExchangeSnapshot) -> Result<()>) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let mut next = (**self.current.read()).clone();
        f(&mut next)?;
        next.version += 1;

        if let Some(storage) = &self.storage {
            storage.put(Column::Exchange, SNAPSHOT_KEY, &next)?;
        }

        let version = next.version;
        *self.current.write() = Arc::new(next);
        Ok(version)
    }

    /// Insert or replace a rate
    pub fn set_rate(&self, rate: ExchangeRate) -> Result<u64> {
        rate.validate()?;
        tracing::info!(
            from = %rate.from,
            to = %rate.to,
            rate = %rate.real(),
            min = ?rate.min_amount,
            max = ?rate.max_amount,
            expires_at = ?rate.expires_at,
            "Exchange rate set"
        );
        self.update(|snapshot| {
            snapshot.rates.insert((rate.from, rate.to), rate);
            Ok(())
        })
    }

    /// Look up a rate
    pub fn rate(&self, from: Equivalent, to: Equivalent) -> Result<ExchangeRate> {
        self.snapshot()
            .rate(from, to)
            .cloned()
            .ok_or(Error::RateNotFound { from, to })
    }

    /// All rates
    pub fn list_rates(&self) -> Vec<ExchangeRate> {
        self.snapshot().rates().cloned().collect()
    }

    /// Remove every rate
    pub fn clear_rates(&self) -> Result<u64> {
        tracing::info!("Exchange rates cleared");
        self.update(|snapshot| {
            snapshot.rates.clear();
            Ok(())
        })
    }

    /// Set the commission in an equivalent; zero removes it
    pub fn set_commission(&self, equivalent: Equivalent, amount: Decimal) -> Result<u64> {
        if amount < Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "commission must not be negative, got {}",
                amount
            )));
        }
        tracing::info!(%equivalent, %amount, "Commission set");
        self.update(|snapshot| {
            if amount.is_zero() {
                snapshot.commissions.remove(&equivalent);
            } else {
                snapshot.commissions.insert(equivalent, amount);
            }
            Ok(())
        })
    }

    /// All commissions
    pub fn list_commissions(&self) -> Vec<Commission> {
        self.snapshot().commissions()
    }
}
