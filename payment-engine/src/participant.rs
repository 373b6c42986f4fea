//! Intermediate and receiver side of a payment
//!
//! Reservations are made from the receiver back towards the coordinator:
//! an intermediate forwards the request first and only holds its own
//! capacity once everything downstream approved, computing the incoming
//! amount from the downstream one with its current exchange table.

use crate::{
    faults::Checkpoint,
    messages::{AskReserve, ProtocolMessage},
    node::{unexpected, NodeCore},
    types::{
        Decision, PathConfiguration, PathHold, RecoveryEvent, Role, Stage, TransactionRecord,
    },
    Error, Result,
};
use exchange_engine::required_incoming;
use line_ledger::{Direction, Equivalent, NodeId, ReservationId};
use observing_ledger::{ObservingState, ParticipantSignature};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn rejected(reason: impl Into<String>) -> Result<Option<ProtocolMessage>> {
    Ok(Some(ProtocolMessage::ReserveRejected {
        reason: reason.into(),
    }))
}

impl NodeCore {
    pub(crate) async fn on_ask_reserve(
        self: &Arc<Self>,
        from: &NodeId,
        ask: AskReserve,
    ) -> Result<Option<ProtocolMessage>> {
        let transaction = ask.transaction;
        let position = ask.position;
        let route = &ask.route;

        if position == 0
            || route.nodes.get(position) != Some(&self.id)
            || &route.nodes[position - 1] != from
            || route.edges.len() + 1 != route.nodes.len()
            || ask.charging.len() != route.nodes.len()
        {
            return rejected("malformed reservation request");
        }
        if let Some(record) = self.store.get(transaction) {
            if record.stage.is_terminal() || record.stage.is_irrevocable() {
                return rejected(format!("transaction already in stage {:?}", record.stage));
            }
        }

        let upstream = from.clone();
        let incoming_equivalent = route.edges[position - 1];
        if !self.ledger.contains(&upstream, incoming_equivalent) {
            return rejected(format!("no line with {} in {}", upstream, incoming_equivalent));
        }

        if position == route.len() {
            self.reserve_as_receiver(&ask, &upstream, incoming_equivalent)
        } else {
            self.reserve_as_intermediate(&ask, &upstream, incoming_equivalent)
                .await
        }
    }

    fn participant_record(&self, ask: &AskReserve, role: Role) -> TransactionRecord {
        let route = &ask.route;
        TransactionRecord::new(
            ask.transaction,
            role,
            ask.coordinator.clone(),
            route.receiver().cloned().unwrap_or_else(|| self.id.clone()),
            route.edges.first().copied().unwrap_or(Equivalent::new(0)),
            route.edges.last().copied().unwrap_or(Equivalent::new(0)),
            ask.amount,
            Stage::Reserved,
        )
    }

    fn reserve_as_receiver(
        &self,
        ask: &AskReserve,
        upstream: &NodeId,
        equivalent: Equivalent,
    ) -> Result<Option<ProtocolMessage>> {
        let transaction = ask.transaction;
        let hold = match self.ledger.reserve(
            upstream,
            equivalent,
            Direction::Incoming,
            ask.deliver,
            self.config.reservation_ttl(),
            transaction,
            ask.path_id,
        ) {
            Ok(hold) => hold,
            Err(e) => return rejected(e.to_string()),
        };

        let created = self.store.upsert(
            transaction,
            || self.participant_record(ask, Role::Receiver),
            |record| {
                record.holds.insert(
                    ask.path_id,
                    PathHold {
                        route: ask.route.clone(),
                        position: ask.position,
                        incoming: Some((hold, ask.deliver)),
                        outgoing: None,
                        commission: None,
                    },
                );
                Ok(record.holds.len() == 1)
            },
        )?;
        if created {
            self.log(transaction, RecoveryEvent::Stage(Stage::Reserved));
        }
        debug!(node = %self.id, %transaction, path = ask.path_id, amount = %ask.deliver, "Incoming amount reserved");

        self.after_reserve(
            transaction,
            ProtocolMessage::ReserveApproved {
                amounts: vec![ask.deliver],
            },
        )
    }

    async fn reserve_as_intermediate(
        &self,
        ask: &AskReserve,
        upstream: &NodeId,
        incoming_equivalent: Equivalent,
    ) -> Result<Option<ProtocolMessage>> {
        let transaction = ask.transaction;
        let position = ask.position;
        let route = &ask.route;

        if ask.remaining_hops == 0 {
            return rejected("hop budget exhausted");
        }
        if !self.checkpoint(Checkpoint::BeforeAskReserve, Some(transaction))? {
            return Ok(None);
        }

        let next = route.nodes[position + 1].clone();
        let outgoing_equivalent = route.edges[position];
        if !self.ledger.contains(&next, outgoing_equivalent) {
            return rejected(format!("no line with {} in {}", next, outgoing_equivalent));
        }

        let forward = AskReserve {
            position: position + 1,
            remaining_hops: ask.remaining_hops - 1,
            ..ask.clone()
        };
        let response = self
            .transport
            .request(
                &self.id,
                &next,
                ProtocolMessage::AskReserve(forward),
                self.config.hop_timeout(route.len() - position),
            )
            .await;
        let downstream = match response {
            Ok(ProtocolMessage::ReserveApproved { amounts }) if !amounts.is_empty() => amounts,
            Ok(ProtocolMessage::ReserveRejected { reason }) => return rejected(reason),
            Ok(other) => return rejected(unexpected(other).to_string()),
            Err(e) => return rejected(format!("{}: {}", next, e)),
        };

        let outgoing = downstream[0];
        let snapshot = self.exchange.snapshot();
        let hop = match required_incoming(
            &snapshot,
            self.ledger.precision(),
            incoming_equivalent,
            outgoing_equivalent,
            outgoing,
            ask.charging[position],
        ) {
            Ok(hop) => hop,
            Err(e) => return rejected(e.to_string()),
        };

        let ttl = self.config.reservation_ttl();
        let outgoing_hold = match self.ledger.reserve(
            &next,
            outgoing_equivalent,
            Direction::Outgoing,
            outgoing,
            ttl,
            transaction,
            ask.path_id,
        ) {
            Ok(hold) => hold,
            Err(e) => return rejected(e.to_string()),
        };
        let incoming_hold = match self.ledger.reserve(
            upstream,
            incoming_equivalent,
            Direction::Incoming,
            hop.incoming,
            ttl,
            transaction,
            ask.path_id,
        ) {
            Ok(hold) => hold,
            Err(e) => {
                self.ledger
                    .release(&next, outgoing_equivalent, outgoing_hold)?;
                return rejected(e.to_string());
            }
        };

        let created = self.store.upsert(
            transaction,
            || self.participant_record(ask, Role::Intermediate),
            |record| {
                record.holds.insert(
                    ask.path_id,
                    PathHold {
                        route: route.clone(),
                        position,
                        incoming: Some((incoming_hold, hop.incoming)),
                        outgoing: Some((outgoing_hold, outgoing)),
                        commission: hop.commission,
                    },
                );
                Ok(record.holds.len() == 1)
            },
        )?;
        if created {
            self.log(transaction, RecoveryEvent::Stage(Stage::Reserved));
        }
        debug!(
            node = %self.id,
            %transaction,
            path = ask.path_id,
            incoming = %hop.incoming,
            %outgoing,
            commission = ?hop.commission,
            "Path hop reserved"
        );

        let mut amounts = Vec::with_capacity(downstream.len() + 1);
        amounts.push(hop.incoming);
        amounts.extend(downstream);
        self.after_reserve(transaction, ProtocolMessage::ReserveApproved { amounts })
    }

    fn after_reserve(
        &self,
        transaction: Uuid,
        approval: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        if !self.checkpoint(Checkpoint::AfterReserve, Some(transaction))? {
            return Ok(None);
        }
        Ok(Some(approval))
    }

    fn release_hold(&self, hold: &PathHold) {
        let sides = [
            (hold.upstream(), hold.incoming),
            (hold.downstream(), hold.outgoing),
        ];
        for (line, reservation) in sides {
            if let (Some((neighbor, equivalent)), Some((id, _))) = (line, reservation) {
                if let Err(e) = self.ledger.release(neighbor, equivalent, id) {
                    debug!(node = %self.id, reservation = %id, error = %e, "Hold already gone");
                }
            }
        }
    }

    pub(crate) fn on_release_path(&self, from: &NodeId, transaction: Uuid, path_id: u32) -> Result<()> {
        let released = self.store.update(transaction, |record| {
            if &record.coordinator != from
                || record.stage.is_terminal()
                || record.stage.is_irrevocable()
            {
                return Ok(None);
            }
            Ok(record.holds.remove(&path_id))
        })?;

        if let Some(Some(hold)) = released {
            self.release_hold(&hold);
            debug!(node = %self.id, %transaction, path = path_id, "Path released");
        }
        Ok(())
    }

    pub(crate) fn on_configure(&self, from: &NodeId, configuration: PathConfiguration) -> Result<()> {
        if &configuration.coordinator != from {
            return Err(Error::Validation(format!(
                "configuration of {} sent by {}",
                configuration.transaction, from
            )));
        }
        let transaction = configuration.transaction;
        let applied = self.store.update(transaction, |record| {
            if record.stage.is_terminal() || record.stage.is_irrevocable() {
                return Ok(false);
            }
            self.apply_configuration(record, configuration)?;
            Ok(true)
        })?;

        match applied {
            None => Err(Error::NotFound(format!("transaction {}", transaction))),
            Some(true) => {
                self.log(transaction, RecoveryEvent::Stage(Stage::Configured));
                Ok(())
            }
            Some(false) => Ok(()),
        }
    }

    /// Adopt a configuration: drop holds of unused paths and shrink the rest
    fn apply_configuration(
        &self,
        record: &mut TransactionRecord,
        configuration: PathConfiguration,
    ) -> Result<()> {
        let kept: BTreeSet<u32> = configuration
            .paths_of(&self.id)
            .map(|(path, _)| path.path_id)
            .collect();
        let unused: Vec<u32> = record
            .holds
            .keys()
            .filter(|path_id| !kept.contains(path_id))
            .copied()
            .collect();
        for path_id in unused {
            if let Some(hold) = record.holds.remove(&path_id) {
                self.release_hold(&hold);
            }
        }

        for (path, position) in configuration.paths_of(&self.id) {
            let hold = record.holds.get_mut(&path.path_id).ok_or_else(|| {
                Error::Validation(format!("no reservation for path {}", path.path_id))
            })?;
            if position > 0 {
                let (neighbor, equivalent) = (&path.route.nodes[position - 1], path.route.edges[position - 1]);
                fit_hold(self, &mut hold.incoming, neighbor, equivalent, path.amounts[position - 1])?;
            }
            if position < path.route.len() {
                let (neighbor, equivalent) = (&path.route.nodes[position + 1], path.route.edges[position]);
                fit_hold(self, &mut hold.outgoing, neighbor, equivalent, path.amounts[position])?;
            }
        }

        record.digest = Some(configuration.digest()?);
        record.configuration = Some(configuration);
        record.stage = Stage::Configured;
        Ok(())
    }

    pub(crate) fn configuration_for(&self, from: &NodeId, transaction: Uuid) -> Option<PathConfiguration> {
        let record = self.store.get(transaction)?;
        if record.role != Role::Coordinator {
            return None;
        }
        let configuration = record.configuration?;
        configuration
            .participants()
            .contains(from)
            .then_some(configuration)
    }

    pub(crate) async fn on_vote(
        self: &Arc<Self>,
        from: &NodeId,
        transaction: Uuid,
        digest: [u8; 32],
    ) -> Result<Option<ProtocolMessage>> {
        if !self.checkpoint(Checkpoint::BeforeVote, Some(transaction))? {
            return Ok(None);
        }
        let refuse = |reason: String| Ok(Some(ProtocolMessage::VoteRefused { reason }));

        let Some(record) = self.store.get(transaction) else {
            return refuse("unknown transaction".to_string());
        };
        if &record.coordinator != from {
            return refuse(format!("{} does not coordinate {}", from, transaction));
        }
        if record.stage == Stage::Rejected {
            return refuse("transaction already rejected".to_string());
        }
        if record.stage.is_irrevocable() || record.stage.is_applied() {
            if record.digest == Some(digest) {
                return Ok(Some(ProtocolMessage::VoteGranted(self.sign(transaction, &digest))));
            }
            return refuse("already voted for another configuration".to_string());
        }

        if record.digest != Some(digest) {
            let configuration = match self
                .transport
                .request(
                    &self.id,
                    from,
                    ProtocolMessage::GetConfiguration { transaction },
                    self.config.hop_timeout(1),
                )
                .await
            {
                Ok(ProtocolMessage::Configuration(Some(configuration))) => configuration,
                Ok(other) => return refuse(format!("no configuration: {}", unexpected(other))),
                Err(e) => return refuse(format!("no configuration: {}", e)),
            };
            if configuration.transaction != transaction || configuration.digest()? != digest {
                return refuse("configuration does not match the digest".to_string());
            }
            let applied = self.store.update(transaction, |record| {
                if record.stage.is_terminal() || record.stage.is_irrevocable() {
                    return Ok(false);
                }
                self.apply_configuration(record, configuration)
                    .map(|_| true)
            });
            match applied {
                Ok(Some(true)) => {}
                Ok(_) => return refuse("transaction state changed".to_string()),
                Err(e) => return refuse(e.to_string()),
            }
        }

        let voted = self.store.update(transaction, |record| {
            if record.stage.is_terminal() || record.stage.is_irrevocable() {
                return Ok(Err("transaction state changed".to_string()));
            }
            if let Err(reason) = self.verify_holds(record) {
                return Ok(Err(reason));
            }
            self.ledger
                .extend_transaction(transaction, self.decision_deadline())?;
            record.stage = Stage::Voted;
            Ok(Ok(()))
        })?;
        match voted {
            Some(Ok(())) => {}
            Some(Err(reason)) => return refuse(reason),
            None => return refuse("unknown transaction".to_string()),
        }
        self.log(transaction, RecoveryEvent::Stage(Stage::Voted));
        info!(node = %self.id, %transaction, "Voted");

        let core = self.clone();
        self.spawn(async move { core.await_decision(transaction).await });

        let signature = self.sign(transaction, &digest);
        if !self.checkpoint(Checkpoint::AfterVote, Some(transaction))? {
            return Ok(None);
        }
        Ok(Some(ProtocolMessage::VoteGranted(signature)))
    }

    /// Every configured amount must still be held
    fn verify_holds(&self, record: &TransactionRecord) -> std::result::Result<(), String> {
        let configuration = record
            .configuration
            .as_ref()
            .ok_or_else(|| "no configuration".to_string())?;

        for (path, position) in configuration.paths_of(&self.id) {
            let hold = record
                .holds
                .get(&path.path_id)
                .ok_or_else(|| format!("no reservation for path {}", path.path_id))?;
            if position > 0 {
                let neighbor = &path.route.nodes[position - 1];
                let equivalent = path.route.edges[position - 1];
                self.check_hold(hold.incoming, neighbor, equivalent, path.amounts[position - 1])?;
            }
            if position < path.route.len() {
                let neighbor = &path.route.nodes[position + 1];
                let equivalent = path.route.edges[position];
                self.check_hold(hold.outgoing, neighbor, equivalent, path.amounts[position])?;
            }
        }
        Ok(())
    }

    fn check_hold(
        &self,
        hold: Option<(ReservationId, Decimal)>,
        neighbor: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> std::result::Result<(), String> {
        let (id, _) = hold.ok_or_else(|| format!("no hold on the line with {}", neighbor))?;
        match self.ledger.reservation(neighbor, equivalent, id) {
            Some(reservation) if reservation.amount == amount => Ok(()),
            Some(reservation) => Err(format!(
                "hold {} is {}, configured {}",
                id, reservation.amount, amount
            )),
            None => Err(format!("hold {} expired", id)),
        }
    }

    pub(crate) fn on_vote_consistency(
        &self,
        from: &NodeId,
        transaction: Uuid,
        digest: [u8; 32],
        signatures: Vec<ParticipantSignature>,
    ) -> Result<Option<ProtocolMessage>> {
        let record = self
            .store
            .get(transaction)
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction)))?;
        if &record.coordinator != from {
            return Err(Error::Validation(format!("{} does not coordinate {}", from, transaction)));
        }
        if record.stage.is_applied() {
            return Ok(Some(ProtocolMessage::Ack));
        }
        if record.stage == Stage::Rejected {
            return Err(Error::Protocol {
                transaction,
                reason: "transaction already rejected".to_string(),
            });
        }
        if record.digest != Some(digest) {
            return Err(Error::Protocol {
                transaction,
                reason: "signature set for another configuration".to_string(),
            });
        }
        let configuration = record.configuration.as_ref().ok_or_else(|| Error::Protocol {
            transaction,
            reason: "no configuration".to_string(),
        })?;
        verify_signature_set(configuration, digest, &signatures)?;

        if !self.checkpoint(Checkpoint::BeforeCommit, Some(transaction))? {
            return Ok(None);
        }
        self.apply_commit(
            transaction,
            Stage::Committed,
            Some((digest, signatures)),
            ObservingState::NoInfo,
        )?;
        Ok(Some(ProtocolMessage::Ack))
    }

    pub(crate) fn on_reject(&self, from: &NodeId, transaction: Uuid) -> Result<()> {
        let Some(record) = self.store.get(transaction) else {
            return Ok(());
        };
        if &record.coordinator != from {
            warn!(node = %self.id, %transaction, from = %from, "Reject from a node other than the coordinator");
            return Ok(());
        }
        self.apply_reject(transaction, "rejected by the coordinator")?;
        Ok(())
    }

    /// Outcome reported to nodes polling during recovery
    pub(crate) fn decision(&self, transaction: Uuid) -> Decision {
        let Some(record) = self.store.get(transaction) else {
            return Decision::Pending;
        };
        match (record.stage, record.digest) {
            (stage, Some(digest)) if stage.is_applied() && record.has_full_signature_set() => {
                Decision::Committed {
                    digest,
                    signatures: record.signatures,
                }
            }
            (Stage::Rejected, _) => Decision::Rejected,
            _ => Decision::Pending,
        }
    }

    /// Settle every configured amount of this node and release stray holds
    ///
    /// Returns false when the transaction was already terminal.
    pub(crate) fn apply_commit(
        &self,
        transaction: Uuid,
        stage: Stage,
        proof: Option<([u8; 32], Vec<ParticipantSignature>)>,
        observing: ObservingState,
    ) -> Result<bool> {
        let applied = self.store.update(transaction, |record| {
            if record.stage.is_terminal() {
                return Ok(false);
            }
            let configuration = record.configuration.clone().ok_or_else(|| Error::Protocol {
                transaction,
                reason: "commit without configuration".to_string(),
            })?;

            for (path, position) in configuration.paths_of(&self.id) {
                let hold = record.holds.get(&path.path_id).cloned();
                if position > 0 {
                    self.settle_hold(
                        &path.route.nodes[position - 1],
                        path.route.edges[position - 1],
                        Direction::Incoming,
                        hold.as_ref().and_then(|hold| hold.incoming),
                        path.amounts[position - 1],
                    )?;
                }
                if position < path.route.len() {
                    self.settle_hold(
                        &path.route.nodes[position + 1],
                        path.route.edges[position],
                        Direction::Outgoing,
                        hold.as_ref().and_then(|hold| hold.outgoing),
                        path.amounts[position],
                    )?;
                }
            }
            self.ledger.release_transaction(transaction)?;

            if let Some((digest, signatures)) = proof {
                record.digest = Some(digest);
                record.signatures = signatures;
            }
            record.stage = stage;
            record.observing = observing;
            record.error = None;
            Ok(true)
        })?;

        let applied = applied.unwrap_or(false);
        if applied {
            info!(node = %self.id, %transaction, ?stage, "Transaction applied");
            self.log(transaction, RecoveryEvent::Resolved(stage));
        }
        Ok(applied)
    }

    fn settle_hold(
        &self,
        neighbor: &NodeId,
        equivalent: Equivalent,
        direction: Direction,
        hold: Option<(ReservationId, Decimal)>,
        amount: Decimal,
    ) -> Result<()> {
        if let Some((id, _)) = hold {
            match self.ledger.commit(neighbor, equivalent, id) {
                Ok(reservation) => {
                    let difference = amount - reservation.amount;
                    if !difference.is_zero() {
                        self.ledger
                            .settle(neighbor, equivalent, direction, difference)?;
                    }
                    return Ok(());
                }
                Err(line_ledger::Error::ReservationNotFound(_)) => {
                    debug!(node = %self.id, reservation = %id, "Hold gone, settling directly");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.ledger.settle(neighbor, equivalent, direction, amount)?;
        Ok(())
    }

    /// Release every hold and mark the transaction rejected
    ///
    /// Returns false when the transaction was already terminal.
    pub(crate) fn apply_reject(&self, transaction: Uuid, reason: &str) -> Result<bool> {
        let applied = self.store.update(transaction, |record| {
            if record.stage.is_terminal() {
                return Ok(false);
            }
            self.ledger.release_transaction(transaction)?;
            record.holds.clear();
            record.stage = Stage::Rejected;
            record.error = Some(reason.to_string());
            Ok(true)
        })?;

        let applied = applied.unwrap_or(false);
        if applied {
            info!(node = %self.id, %transaction, %reason, "Transaction rejected");
            self.log(transaction, RecoveryEvent::Resolved(Stage::Rejected));
        }
        Ok(applied)
    }
}

/// Shrink a hold to its configured amount
fn fit_hold(
    core: &NodeCore,
    hold: &mut Option<(ReservationId, Decimal)>,
    neighbor: &NodeId,
    equivalent: Equivalent,
    amount: Decimal,
) -> Result<()> {
    let (id, held) = hold.ok_or_else(|| {
        Error::Validation(format!("no hold on the line with {}", neighbor))
    })?;
    if amount > held {
        return Err(Error::Validation(format!(
            "configured {} exceeds the {} held with {}",
            amount, held, neighbor
        )));
    }
    if amount < held {
        core.ledger.shrink(neighbor, equivalent, id, amount)?;
        *hold = Some((id, amount));
    }
    Ok(())
}

/// The signature set must hold exactly one valid vote per node of the configuration
///
/// Each vote is checked against the public key it carries. Nothing binds
/// that key to the node name, so a set is only as trustworthy as the
/// channel it arrived on.
pub(crate) fn verify_signature_set(
    configuration: &PathConfiguration,
    digest: [u8; 32],
    signatures: &[ParticipantSignature],
) -> Result<()> {
    let transaction = configuration.transaction;
    let mut expected = configuration.participants();
    expected.insert(configuration.coordinator.clone());

    let mut signed = BTreeSet::new();
    for signature in signatures {
        if !expected.contains(&signature.node) {
            return Err(Error::Protocol {
                transaction,
                reason: format!("unexpected signer {}", signature.node),
            });
        }
        signature.verify(transaction, &digest)?;
        signed.insert(signature.node.clone());
    }
    if signed != expected {
        return Err(Error::Protocol {
            transaction,
            reason: format!("{} of {} signatures", signed.len(), expected.len()),
        });
    }
    Ok(())
}
