//! Amount transforms through a node
//!
//! Conversion direction follows the payment: a node receives `incoming` in
//! the equivalent of its upstream line and pays `outgoing` in the equivalent
//! of its downstream line. Forward conversion rounds down to the target
//! precision, inverse conversion rounds up to the source precision, so the
//! node never pays out more than it was given.
//!
//! Commission rule for a charging node: a commission in the outgoing
//! equivalent is added to the outgoing amount before conversion; otherwise a
//! commission in the incoming equivalent is added after conversion.

use crate::{Commission, Error, ExchangeSnapshot, Result};
use line_ledger::{Equivalent, Precision};
use rust_decimal::Decimal;

/// Amounts one node needs to forward a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopAmounts {
    /// Amount the node must receive
    pub incoming: Decimal,

    /// Commission kept by the node, if it charged one
    pub commission: Option<Commission>,
}

/// Convert an amount of `from` into `to`
pub fn forward(
    snapshot: &ExchangeSnapshot,
    precision: &Precision,
    from: Equivalent,
    to: Equivalent,
    amount: Decimal,
) -> Result<Decimal> {
    if from == to {
        return Ok(amount);
    }

    let rate = snapshot
        .rate(from, to)
        .ok_or(Error::RateNotFound { from, to })?;
    rate.check_bounds(amount)?;

    let converted = amount
        .checked_mul(rate.multiplier()?)
        .ok_or(Error::Overflow)?;
    Ok(precision.round_down(to, converted))
}

/// Amount of `from` needed to obtain `target` of `to`
pub fn inverse(
    snapshot: &ExchangeSnapshot,
    precision: &Precision,
    from: Equivalent,
    to: Equivalent,
    target: Decimal,
) -> Result<Decimal> {
    if from == to {
        return Ok(target);
    }

    let rate = snapshot
        .rate(from, to)
        .ok_or(Error::RateNotFound { from, to })?;

    let needed = target
        .checked_div(rate.multiplier()?)
        .ok_or(Error::Overflow)?;
    let needed = precision.round_up(from, needed);
    rate.check_bounds(needed)?;
    Ok(needed)
}

/// Incoming amount a node needs to pay `outgoing` downstream
pub fn required_incoming(
    snapshot: &ExchangeSnapshot,
    precision: &Precision,
    incoming_eq: Equivalent,
    outgoing_eq: Equivalent,
    outgoing: Decimal,
    charge_commission: bool,
) -> Result<HopAmounts> {
    if charge_commission {
        if let Some(commission) = snapshot.commission(outgoing_eq) {
            let gross = outgoing
                .checked_add(commission.amount)
                .ok_or(Error::Overflow)?;
            let incoming = inverse(snapshot, precision, incoming_eq, outgoing_eq, gross)?;
            return Ok(HopAmounts {
                incoming,
                commission: Some(commission),
            });
        }
    }

    let incoming = inverse(snapshot, precision, incoming_eq, outgoing_eq, outgoing)?;
    if charge_commission {
        if let Some(commission) = snapshot.commission(incoming_eq) {
            return Ok(HopAmounts {
                incoming: incoming
                    .checked_add(commission.amount)
                    .ok_or(Error::Overflow)?,
                commission: Some(commission),
            });
        }
    }

    Ok(HopAmounts {
        incoming,
        commission: None,
    })
}

/// Largest outgoing amount a node can pay when it may receive `incoming`
///
/// Exchange bounds clamp the amount instead of failing. Unusable or missing
/// rates yield zero.
pub fn capacity_through(
    snapshot: &ExchangeSnapshot,
    precision: &Precision,
    incoming_eq: Equivalent,
    outgoing_eq: Equivalent,
    incoming: Decimal,
    charge_commission: bool,
) -> Decimal {
    let outgoing_commission = snapshot
        .commission(outgoing_eq)
        .filter(|_| charge_commission);
    let incoming_commission = snapshot
        .commission(incoming_eq)
        .filter(|_| charge_commission && outgoing_commission.is_none());

    let mut exchanged = incoming - incoming_commission.map_or(Decimal::ZERO, |c| c.amount);
    if incoming_eq != outgoing_eq {
        let Some(rate) = snapshot.rate(incoming_eq, outgoing_eq) else {
            return Decimal::ZERO;
        };
        if let Some(max) = rate.max_amount {
            exchanged = exchanged.min(max);
        }
        if rate.min_amount.map_or(false, |min| exchanged < min) {
            return Decimal::ZERO;
        }
    }
    if exchanged <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let outgoing = match forward(snapshot, precision, incoming_eq, outgoing_eq, exchanged) {
        Ok(amount) => amount,
        Err(e) => {
            tracing::debug!(from = %incoming_eq, to = %outgoing_eq, error = %e, "Exchange unusable");
            return Decimal::ZERO;
        }
    };

    (outgoing - outgoing_commission.map_or(Decimal::ZERO, |c| c.amount)).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExchangeRate, ExchangeTable, NativeRate};

    const EQ1: Equivalent = Equivalent::new(1);
    const EQ2: Equivalent = Equivalent::new(2);

    fn table_with_rate(rate: &str) -> ExchangeTable {
        let table = ExchangeTable::in_memory();
        table
            .set_rate(ExchangeRate::new(EQ1, EQ2, NativeRate::parse(rate).unwrap()))
            .unwrap();
        table
    }

    #[test]
    fn test_forward_rounds_down_inverse_rounds_up() {
        let table = table_with_rate("0.3");
        let snapshot = table.snapshot();
        let precision = Precision::default();

        // 0.10 * 0.3 = 0.03; 0.11 * 0.3 = 0.033 -> 0.03
        assert_eq!(
            forward(&snapshot, &precision, EQ1, EQ2, Decimal::new(11, 2)).unwrap(),
            Decimal::new(3, 2)
        );
        // 1.00 / 0.3 = 3.333.. -> 3.34
        assert_eq!(
            inverse(&snapshot, &precision, EQ1, EQ2, Decimal::ONE).unwrap(),
            Decimal::new(334, 2)
        );
    }

    #[test]
    fn test_chain_with_exchange_and_commissions() {
        // Commission 10 (eq1) upstream, exchange 0.05 eq1 -> eq2, commission 3 (eq2) downstream
        let upstream = ExchangeTable::in_memory();
        upstream.set_commission(EQ1, Decimal::from(10)).unwrap();
        let exchanger = table_with_rate("0.05");
        let downstream = ExchangeTable::in_memory();
        downstream.set_commission(EQ2, Decimal::from(3)).unwrap();
        let precision = Precision::default();

        let d = required_incoming(&downstream.snapshot(), &precision, EQ2, EQ2, Decimal::from(100), true)
            .unwrap();
        assert_eq!(d.incoming, Decimal::from(103));

        let c = required_incoming(&exchanger.snapshot(), &precision, EQ1, EQ2, d.incoming, true)
            .unwrap();
        assert_eq!(c.incoming, Decimal::from(2060));
        assert!(c.commission.is_none());

        let b = required_incoming(&upstream.snapshot(), &precision, EQ1, EQ1, c.incoming, true)
            .unwrap();
        assert_eq!(b.incoming, Decimal::from(2070));
    }

    #[test]
    fn test_commission_only_when_charging() {
        let table = ExchangeTable::in_memory();
        table.set_commission(EQ1, Decimal::from(10)).unwrap();
        let hop = required_incoming(&table.snapshot(), &Precision::default(), EQ1, EQ1, Decimal::from(50), false)
            .unwrap();
        assert_eq!(hop.incoming, Decimal::from(50));
        assert!(hop.commission.is_none());
    }

    #[test]
    fn test_outgoing_commission_preferred() {
        let table = table_with_rate("2");
        table.set_commission(EQ1, Decimal::from(7)).unwrap();
        table.set_commission(EQ2, Decimal::from(4)).unwrap();
        let hop = required_incoming(&table.snapshot(), &Precision::default(), EQ1, EQ2, Decimal::from(10), true)
            .unwrap();
        // (10 + 4) / 2
        assert_eq!(hop.incoming, Decimal::from(7));
        assert_eq!(hop.commission.unwrap().equivalent, EQ2);
    }

    #[test]
    fn test_capacity_through_inverts_requirement() {
        let table = table_with_rate("0.05");
        table.set_commission(EQ2, Decimal::from(3)).unwrap();
        let snapshot = table.snapshot();
        let precision = Precision::default();

        let out = capacity_through(&snapshot, &precision, EQ1, EQ2, Decimal::from(2060), true);
        assert_eq!(out, Decimal::from(100));
        let back = required_incoming(&snapshot, &precision, EQ1, EQ2, out, true).unwrap();
        assert!(back.incoming <= Decimal::from(2060));
    }

    #[test]
    fn test_bounds_clamp_capacity_and_fail_transforms() {
        let table = ExchangeTable::in_memory();
        table
            .set_rate(
                ExchangeRate::new(EQ1, EQ2, NativeRate::new(2, 6))
                    .with_bounds(Some(Decimal::from(10)), Some(Decimal::from(100))),
            )
            .unwrap();
        let snapshot = table.snapshot();
        let precision = Precision::default();

        assert_eq!(
            capacity_through(&snapshot, &precision, EQ1, EQ2, Decimal::from(500), false),
            Decimal::from(200)
        );
        assert_eq!(
            capacity_through(&snapshot, &precision, EQ1, EQ2, Decimal::from(5), false),
            Decimal::ZERO
        );
        assert!(matches!(
            inverse(&snapshot, &precision, EQ1, EQ2, Decimal::from(400)),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_missing_rate_blocks_exchange() {
        let table = ExchangeTable::in_memory();
        let snapshot = table.snapshot();
        assert!(matches!(
            forward(&snapshot, &Precision::default(), EQ1, EQ2, Decimal::ONE),
            Err(Error::RateNotFound { .. })
        ));
        assert_eq!(
            capacity_through(&snapshot, &Precision::default(), EQ1, EQ2, Decimal::ONE, false),
            Decimal::ZERO
        );
    }
}
