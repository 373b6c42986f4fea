//! Consistency checks
//!
//! A transaction is consistent when the local outcome agrees with the
//! observing ledger: applied locally means the ledger has not rejected it,
//! rejected locally means the ledger has not accepted a claim for it.

use crate::{node::NodeCore, types::AuditReport, Error, Result};
use line_ledger::LineViolation;
use observing_ledger::ObservingState;
use tracing::{error, warn};
use uuid::Uuid;

impl NodeCore {
    pub(crate) fn audit(&self, transaction: Uuid) -> Result<AuditReport> {
        let record = self
            .store
            .get(transaction)
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction)))?;
        let observing = self.observing.state(transaction);

        let consistent = if record.stage.is_applied() {
            observing != ObservingState::Rejected
        } else if record.stage.is_terminal() {
            !observing.is_accepted()
        } else {
            true
        };

        if record.observing != observing {
            self.store.update(transaction, |record| {
                record.observing = observing;
                Ok(())
            })?;
        }
        if !consistent {
            error!(
                node = %self.id,
                %transaction,
                stage = ?record.stage,
                ?observing,
                "Local outcome disagrees with the observing ledger"
            );
        }

        Ok(AuditReport {
            transaction,
            stage: record.stage,
            observing,
            consistent,
        })
    }

    pub(crate) fn audit_lines(&self) -> Vec<LineViolation> {
        let violations = self.ledger.violations();
        for violation in &violations {
            warn!(
                node = %self.id,
                neighbor = %violation.key.neighbor,
                equivalent = %violation.key.equivalent,
                balance = %violation.balance,
                lower = %violation.lower_bound,
                upper = %violation.upper_bound,
                "Line balance outside trust bounds"
            );
        }
        violations
    }
}
