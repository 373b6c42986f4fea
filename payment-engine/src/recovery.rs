//! Participant recovery and restart handling
//!
//! A participant that voted cannot decide alone. When no final broadcast
//! arrives within `waiting_participants_votes`, it polls the coordinator
//! and its route neighbors a few times, then requests arbitration on the
//! observing ledger and follows whatever the ledger settles on: a claim
//! with the full signature set means commit, an empty window means reject.

use crate::{
    faults::Checkpoint,
    messages::ProtocolMessage,
    node::{unexpected, NodeCore},
    participant::verify_signature_set,
    types::{Decision, RecoveryEvent, Role, Stage},
    Result,
};
use chrono::{DateTime, Utc};
use line_ledger::{NodeId, Reservation};
use observing_ledger::ObservingState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

impl NodeCore {
    /// How long a voted transaction may stay undecided
    fn recovery_horizon(&self) -> Duration {
        let observing = self.observing.config();
        let polling = self.config.recovery_period() * self.config.node_payment_recovery_attempts;
        self.config.waiting_participants_votes()
            + polling
            + observing.claim_window()
            + observing.block_interval() * 3
            + self.config.reservation_ttl()
    }

    /// Expiry for holds of a voted transaction
    pub(crate) fn decision_deadline(&self) -> DateTime<Utc> {
        let horizon = chrono::Duration::from_std(self.recovery_horizon())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Utc::now() + horizon
    }

    /// Wait for the final broadcast, recovering when it does not come
    pub(crate) async fn await_decision(self: Arc<Self>, transaction: Uuid) {
        sleep(self.config.waiting_participants_votes()).await;

        let pending = self
            .store
            .get(transaction)
            .map_or(false, |record| !record.stage.is_terminal());
        if !pending {
            return;
        }
        if let Err(e) = self.recover(transaction).await {
            error!(node = %self.id, %transaction, error = %e, "Recovery failed");
        }
    }

    /// Drive a voted transaction to its final state
    pub(crate) async fn recover(self: &Arc<Self>, transaction: Uuid) -> Result<Stage> {
        let Some(record) = self.store.get(transaction) else {
            return Ok(Stage::Rejected);
        };
        if record.stage.is_terminal() {
            return Ok(record.stage);
        }

        self.store.update(transaction, |record| {
            record.stage = Stage::Recovery;
            Ok(())
        })?;
        self.metrics.recoveries_total.inc();
        self.log(transaction, RecoveryEvent::RecoveryStarted);
        warn!(node = %self.id, %transaction, "No final decision received, recovering");

        let mut targets = vec![record.coordinator.clone()];
        if let Some(configuration) = &record.configuration {
            targets.extend(
                configuration
                    .route_neighbors(&self.id)
                    .into_iter()
                    .filter(|node| node != &record.coordinator),
            );
        }

        for attempt in 1..=self.config.node_payment_recovery_attempts {
            if self.checkpoint(Checkpoint::BeforeRecoveryPoll, Some(transaction))? {
                for target in &targets {
                    if let Some(stage) = self.poll(transaction, target, attempt).await? {
                        return Ok(stage);
                    }
                }
            }
            if let Some(stage) = self.settled(transaction) {
                return Ok(stage);
            }
            sleep(self.config.recovery_period()).await;
        }

        self.arbitrate(transaction).await
    }

    /// Ask one node for the outcome; `Some` once the transaction is settled
    async fn poll(&self, transaction: Uuid, target: &NodeId, attempt: u32) -> Result<Option<Stage>> {
        self.log(
            transaction,
            RecoveryEvent::Poll {
                target: target.clone(),
                attempt,
            },
        );
        let response = self
            .transport
            .request(
                &self.id,
                target,
                ProtocolMessage::Status { transaction },
                self.config.hop_timeout(1),
            )
            .await;

        let decision = match response {
            Ok(ProtocolMessage::Decision(decision)) => decision,
            Ok(other) => {
                self.log(
                    transaction,
                    RecoveryEvent::PollFailed {
                        target: target.clone(),
                        error: unexpected(other).to_string(),
                    },
                );
                return Ok(None);
            }
            Err(e) => {
                debug!(node = %self.id, %transaction, target = %target, error = %e, "Poll failed");
                self.log(
                    transaction,
                    RecoveryEvent::PollFailed {
                        target: target.clone(),
                        error: e.to_string(),
                    },
                );
                return Ok(None);
            }
        };

        let answer = match &decision {
            Decision::Committed { .. } => "committed",
            Decision::Rejected => "rejected",
            Decision::Pending => "pending",
        };
        self.log(
            transaction,
            RecoveryEvent::PollAnswered {
                target: target.clone(),
                decision: answer.to_string(),
            },
        );

        match decision {
            Decision::Committed { digest, signatures } => {
                let record = self.store.get(transaction);
                let configuration = record.as_ref().and_then(|record| record.configuration.as_ref());
                let valid = record.as_ref().map_or(false, |record| record.digest == Some(digest))
                    && configuration.map_or(false, |configuration| {
                        verify_signature_set(configuration, digest, &signatures).is_ok()
                    });
                if !valid {
                    warn!(node = %self.id, %transaction, target = %target, "Ignoring unverifiable commit proof");
                    return Ok(None);
                }
                self.apply_commit(
                    transaction,
                    Stage::Committed,
                    Some((digest, signatures)),
                    ObservingState::NoInfo,
                )?;
                Ok(self.settled(transaction))
            }
            Decision::Rejected => {
                self.apply_reject(transaction, &format!("rejected according to {}", target))?;
                Ok(self.settled(transaction))
            }
            Decision::Pending => Ok(None),
        }
    }

    /// Terminal stage, if any
    fn settled(&self, transaction: Uuid) -> Option<Stage> {
        self.store
            .get(transaction)
            .map(|record| record.stage)
            .filter(Stage::is_terminal)
    }

    /// Follow the observing ledger once polling gave nothing
    async fn arbitrate(&self, transaction: Uuid) -> Result<Stage> {
        let state = self.observing.request_arbitration(transaction, &self.id);
        self.log(transaction, RecoveryEvent::ArbitrationRequested);
        info!(node = %self.id, %transaction, ?state, "Arbitration requested");

        let mut ticker = interval(self.observing.config().block_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = loop {
            ticker.tick().await;
            if let Some(stage) = self.settled(transaction) {
                return Ok(stage);
            }
            let state = self.observing.state(transaction);
            if state.is_final() {
                break state;
            }
        };
        self.log(transaction, RecoveryEvent::Observing(state));

        if state.is_accepted() {
            let claim = self
                .observing
                .record(transaction)
                .and_then(|record| record.claim);
            let local_digest = self.store.get(transaction).and_then(|record| record.digest);
            match claim {
                Some(claim) if Some(claim.digest) == local_digest => {
                    self.apply_commit(
                        transaction,
                        Stage::Claimed,
                        Some((claim.digest, claim.signatures)),
                        state,
                    )?;
                }
                _ => {
                    error!(node = %self.id, %transaction, "Accepted claim does not match the local configuration");
                    self.apply_reject(transaction, "observing ledger accepted another configuration")?;
                }
            }
        } else {
            self.apply_reject(transaction, "claim window closed without a claim")?;
            self.store.update(transaction, |record| {
                record.observing = state;
                Ok(())
            })?;
        }

        Ok(self.settled(transaction).unwrap_or(Stage::Recovery))
    }

    /// Claim open arbitrations this node holds a full signature set for
    pub(crate) async fn watch_observing(self: Arc<Self>) {
        let mut ticker = interval(self.observing.config().block_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for transaction in self.observing.open_arbitrations() {
                let Some(record) = self.store.get(transaction) else {
                    continue;
                };
                let Some(digest) = record.digest else {
                    continue;
                };
                if record.stage == Stage::Rejected || !record.has_full_signature_set() {
                    continue;
                }

                info!(node = %self.id, %transaction, "Answering arbitration request with a claim");
                let state = self.submit_claim(transaction, digest, &record.signatures);
                if state.is_accepted() && !record.stage.is_applied() {
                    if let Err(e) = self.apply_commit(transaction, Stage::Claimed, None, state) {
                        error!(node = %self.id, %transaction, error = %e, "Commit after claim failed");
                    }
                }
            }
        }
    }

    /// Release settled records from memory once nobody can still arbitrate them
    pub(crate) async fn retire_settled(self: Arc<Self>) {
        let observing = self.observing.config();
        let retention = chrono::Duration::from_std(observing.claim_window() + observing.block_interval())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = self.store.evict_settled(Utc::now() - retention);
            if evicted > 0 {
                debug!(node = %self.id, evicted, resident = self.store.resident(), "Settled records released");
            }
        }
    }

    /// Pick up every transaction left in flight by a previous run
    pub(crate) fn resume(self: &Arc<Self>) {
        for record in self.store.list() {
            if record.stage.is_terminal() {
                continue;
            }
            let transaction = record.transaction;
            info!(node = %self.id, %transaction, stage = ?record.stage, role = ?record.role, "Resuming transaction");
            self.log(transaction, RecoveryEvent::Resumed(record.stage));

            let core = self.clone();
            match (record.role, record.stage) {
                (Role::Coordinator, _) => self.spawn(async move {
                    if let Err(e) = core.resume_coordinator(transaction).await {
                        error!(node = %core.id, %transaction, error = %e, "Resume failed");
                    }
                }),
                (_, Stage::Voted | Stage::Recovery) => self.spawn(async move {
                    if let Err(e) = core.recover(transaction).await {
                        error!(node = %core.id, %transaction, error = %e, "Recovery failed");
                    }
                }),
                _ => {
                    if let Err(e) = self.apply_reject(transaction, "node restarted before voting") {
                        error!(node = %self.id, %transaction, error = %e, "Rejection after restart failed");
                    }
                }
            }
        }
    }

    /// A hold expired: forget it, rejecting unvoted participant state left without holds
    pub(crate) fn expire_hold(&self, reservation: &Reservation) -> Result<()> {
        let transaction = reservation.transaction;
        let outcome = self.store.update(transaction, |record| {
            if record.role == Role::Coordinator
                || record.stage.is_terminal()
                || record.stage.is_irrevocable()
            {
                return Ok(false);
            }
            for hold in record.holds.values_mut() {
                if hold.incoming.map_or(false, |(id, _)| id == reservation.id) {
                    hold.incoming = None;
                }
                if hold.outgoing.map_or(false, |(id, _)| id == reservation.id) {
                    hold.outgoing = None;
                }
            }
            record
                .holds
                .retain(|_, hold| hold.incoming.is_some() || hold.outgoing.is_some());
            Ok(record.holds.is_empty())
        })?;

        if outcome == Some(true) {
            self.log(transaction, RecoveryEvent::HoldsExpired);
            self.apply_reject(transaction, "reservations expired")?;
        }
        Ok(())
    }
}
