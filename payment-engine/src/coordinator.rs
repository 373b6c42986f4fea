//! Coordinator side of a payment
//!
//! ```text
//! Init -> RequestRoutes -> ReserveAmount [-> SearchAdditionalPath]*
//!      -> VotePrepare -> VotesCollected -> Committed
//! ```
//!
//! Until the vote round starts, any failure releases every hold and sends
//! `Reject` to each node the transaction touched. Once votes are
//! collected the outcome is decided by the signature set: the coordinator
//! commits and, when the final broadcast does not reach everybody, leaves a
//! claim on the observing ledger so that participants in recovery can
//! converge.

use crate::{
    faults::Checkpoint,
    messages::{AskReserve, ProtocolMessage},
    node::{unexpected, NodeCore},
    routing::{cost, delivered, PathPlan, Planner, Topology},
    types::{
        ConfiguredPath, ExchangeFlow, PathConfiguration, PathHold, PaymentRequest, RecoveryEvent,
        Role, Route, Stage, TransactionRecord,
    },
    Error, Result,
};
use futures::future::join_all;
use line_ledger::{Direction, Equivalent, NodeId};
use message_bus::Message;
use observing_ledger::{Claim, ObservingState, ParticipantSignature};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bookkeeping of one reservation attempt
#[derive(Debug)]
struct Attempt {
    transaction: Uuid,
    approved: Vec<ConfiguredPath>,
    failed: HashSet<Route>,
    touched: BTreeSet<NodeId>,
    next_path_id: u32,
    voting: bool,
}

impl Attempt {
    fn new(transaction: Uuid) -> Self {
        Self {
            transaction,
            approved: Vec::new(),
            failed: HashSet::new(),
            touched: BTreeSet::new(),
            next_path_id: 0,
            voting: false,
        }
    }

    fn delivered(&self) -> Decimal {
        self.approved.iter().map(ConfiguredPath::delivered).sum()
    }

    fn paid(&self) -> Decimal {
        self.approved.iter().map(ConfiguredPath::paid).sum()
    }

    /// Intermediates already charging their commission on an approved path
    fn charged(&self) -> HashSet<NodeId> {
        self.approved
            .iter()
            .flat_map(|path| {
                path.route
                    .nodes
                    .iter()
                    .zip(&path.charging)
                    .filter(|(_, charging)| **charging)
                    .map(|(node, _)| node.clone())
            })
            .collect()
    }
}

impl NodeCore {
    /// Coordinate a payment end to end
    pub(crate) async fn pay(self: Arc<Self>, request: PaymentRequest) -> Result<Uuid> {
        self.validate_payment(&request)?;

        let transaction = Uuid::now_v7();
        self.store.insert(TransactionRecord::new(
            transaction,
            Role::Coordinator,
            self.id.clone(),
            request.receiver.clone(),
            request.send_equivalent,
            request.receive_equivalent,
            request.amount,
            Stage::Init,
        ))?;
        self.log(transaction, RecoveryEvent::Stage(Stage::Init));
        info!(
            node = %self.id,
            %transaction,
            receiver = %request.receiver,
            amount = %request.amount,
            send = %request.send_equivalent,
            receive = %request.receive_equivalent,
            "Payment initiated"
        );

        self.metrics.active_transactions.inc();
        let result = self.coordinate(transaction, &request).await;
        self.metrics.active_transactions.dec();

        match &result {
            Ok(()) => {
                self.metrics.record_outcome("committed");
                info!(node = %self.id, %transaction, "Payment committed");
            }
            Err(e) => {
                self.metrics.record_outcome(e.outcome());
                warn!(node = %self.id, %transaction, error = %e, "Payment failed");
            }
        }
        result.map(|_| transaction)
    }

    fn validate_payment(&self, request: &PaymentRequest) -> Result<()> {
        if request.receiver == self.id {
            return Err(Error::Validation("cannot pay self".to_string()));
        }
        if request.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if !self
            .ledger
            .precision()
            .is_exact(request.receive_equivalent, request.amount)
        {
            return Err(Error::Validation(format!(
                "{} has more fractional digits than {} allows",
                request.amount, request.receive_equivalent
            )));
        }
        if let Some(max) = request.max_allowable {
            if max <= Decimal::ZERO {
                return Err(Error::Validation(format!(
                    "max allowable amount must be positive, got {}",
                    max
                )));
            }
        }
        Ok(())
    }

    async fn coordinate(self: &Arc<Self>, transaction: Uuid, request: &PaymentRequest) -> Result<()> {
        let mut attempt = Attempt::new(transaction);

        let prepared = self.prepare(&mut attempt, request).await;
        let (configuration, digest, signatures) = match prepared {
            Ok(prepared) => prepared,
            Err(Error::Terminated) => return Err(Error::Terminated),
            Err(e @ Error::NoConsensus { .. }) => return Err(e),
            Err(e) => {
                self.cancel(&attempt, &e.to_string()).await;
                return Err(e);
            }
        };

        let result = self
            .finalize(transaction, &configuration, digest, &signatures)
            .await;
        if let Err(Error::Injected(checkpoint)) = &result {
            warn!(
                node = %self.id,
                %transaction,
                ?checkpoint,
                "Final stage interrupted, resuming through the observing ledger"
            );
            let core = self.clone();
            let delay = self.config.waiting_participants_votes();
            self.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = core.resume_coordinator(transaction).await {
                    error!(node = %core.id, %transaction, error = %e, "Resume failed");
                }
            });
        }
        result
    }

    /// Everything up to a complete signature set
    async fn prepare(
        self: &Arc<Self>,
        attempt: &mut Attempt,
        request: &PaymentRequest,
    ) -> Result<(PathConfiguration, [u8; 32], Vec<ParticipantSignature>)> {
        let transaction = attempt.transaction;

        self.set_stage(transaction, Stage::RequestRoutes)?;
        let (mut topology, routes) = self
            .routes_to(&request.receiver, request.send_equivalent, request.receive_equivalent)
            .await;
        if routes.is_empty() {
            return Err(Error::NoPaymentRoutes(request.receiver.clone()));
        }

        self.set_stage(transaction, Stage::ReserveAmount)?;
        self.reserve_amount(attempt, request, &mut topology, &routes)
            .await?;

        let paid = attempt.paid();
        if let Some(maximum) = request.max_allowable {
            if paid > maximum {
                return Err(Error::MoreThanMaxAllowableAmount {
                    required: paid,
                    maximum,
                });
            }
        }

        self.set_stage(transaction, Stage::VotePrepare)?;
        let mut paths = attempt.approved.clone();
        paths.sort_by_key(|path| path.path_id);
        let configuration = PathConfiguration {
            transaction,
            coordinator: self.id.clone(),
            receiver: request.receiver.clone(),
            paths,
        };
        let digest = configuration.digest()?;
        self.store.update(transaction, |record| {
            record.configuration = Some(configuration.clone());
            record.digest = Some(digest);
            Ok(())
        })?;
        info!(
            node = %self.id,
            %transaction,
            paths = configuration.paths.len(),
            paid = %configuration.paid(),
            delivered = %configuration.delivered(),
            "Path configuration fixed"
        );

        let participants: Vec<NodeId> = configuration.participants().into_iter().collect();
        if self.checkpoint(Checkpoint::BeforePathConfiguration, Some(transaction))? {
            self.send_configuration(&configuration, &participants).await;
        }

        if !self.checkpoint(Checkpoint::BeforeVote, Some(transaction))? {
            return Err(self
                .reject_voting(attempt, "vote requests lost".to_string())
                .await);
        }
        attempt.voting = true;

        let mut signatures = match self.collect_votes(transaction, digest, &participants).await {
            Ok(signatures) => signatures,
            Err(reason) => return Err(self.reject_voting(attempt, reason).await),
        };
        signatures.push(self.sign(transaction, &digest));

        Ok((configuration, digest, signatures))
    }

    async fn reserve_amount(
        self: &Arc<Self>,
        attempt: &mut Attempt,
        request: &PaymentRequest,
        topology: &mut Topology,
        routes: &[Route],
    ) -> Result<()> {
        let transaction = attempt.transaction;
        let mut reachable = Decimal::ZERO;

        for round in 0..self.config.max_path_search_rounds {
            let remaining = request.amount - attempt.delivered();
            if remaining <= Decimal::ZERO {
                break;
            }
            if round > 0 {
                self.set_stage(transaction, Stage::SearchAdditionalPath)?;
                let local = self.local_info(&topology_equivalents(request));
                crate::routing::refresh_capacities(
                    &*self.transport,
                    local,
                    topology,
                    &topology_equivalents(request),
                    self.config.hop_timeout(1),
                )
                .await;
            }

            let candidates: Vec<Route> = routes
                .iter()
                .filter(|route| !attempt.failed.contains(*route))
                .cloned()
                .collect();
            let plans = Planner::new(topology, self.ledger.precision())
                .with_charged(attempt.charged())
                .allocate(&candidates, remaining);
            let planned = delivered(&plans);
            reachable = attempt.delivered() + planned;
            debug!(
                node = %self.id,
                %transaction,
                round,
                paths = plans.len(),
                %planned,
                %remaining,
                "Reservation round planned"
            );
            if plans.is_empty() || planned < remaining {
                break;
            }

            if let Some(maximum) = request.max_allowable {
                let required = attempt.paid() + cost(&plans);
                if required > maximum {
                    return Err(Error::MoreThanMaxAllowableAmount { required, maximum });
                }
            }

            let reservations = plans.into_iter().map(|plan| {
                let path_id = attempt.next_path_id;
                attempt.next_path_id += 1;
                attempt
                    .touched
                    .extend(plan.route.nodes.iter().skip(1).cloned());
                self.reserve_path(transaction, path_id, plan, request.amount)
            });
            let outcomes = join_all(reservations.collect::<Vec<_>>()).await;

            for outcome in outcomes {
                match outcome? {
                    Ok(path) => attempt.approved.push(path),
                    Err((route, reason)) => {
                        self.metrics.failed_paths_total.inc();
                        warn!(node = %self.id, %transaction, route = %route, %reason, "Path reservation failed");
                        attempt.failed.insert(route);
                    }
                }
            }

            self.redesignate(attempt, topology).await?;
        }

        let delivered = attempt.delivered();
        if delivered < request.amount {
            return Err(Error::InsufficientFunds {
                requested: request.amount,
                available: reachable.min(request.amount).max(delivered),
            });
        }
        Ok(())
    }

    /// Drop approved paths passing a commission-bearing node nobody charges for
    ///
    /// That happens when the path designated to carry a node's commission
    /// failed; the affected paths are released and planned again.
    async fn redesignate(self: &Arc<Self>, attempt: &mut Attempt, topology: &Topology) -> Result<()> {
        let charged = attempt.charged();
        let (keep, redo): (Vec<ConfiguredPath>, Vec<ConfiguredPath>) =
            std::mem::take(&mut attempt.approved)
                .into_iter()
                .partition(|path| {
                    path.route.intermediates().iter().all(|node| {
                        charged.contains(node)
                            || topology
                                .exchange(node)
                                .map_or(true, |snapshot| snapshot.commissions().is_empty())
                    })
                });
        attempt.approved = keep;

        for path in redo {
            info!(
                node = %self.id,
                transaction = %attempt.transaction,
                path = path.path_id,
                "Releasing path to re-plan commission"
            );
            self.release_path(attempt.transaction, &path).await?;
        }
        Ok(())
    }

    /// Reserve one path; the inner error is a path failure, the outer one is fatal
    async fn reserve_path(
        self: &Arc<Self>,
        transaction: Uuid,
        path_id: u32,
        plan: PathPlan,
        amount: Decimal,
    ) -> Result<std::result::Result<ConfiguredPath, (Route, String)>> {
        let deliver = plan.deliver();
        let PathPlan {
            route,
            amounts: planned,
            charging,
        } = plan;
        let next = route.nodes[1].clone();
        let equivalent = route.edges[0];

        if !self.checkpoint(Checkpoint::BeforeAskReserve, Some(transaction))? {
            return Ok(Err((route, "reservation request lost".to_string())));
        }

        let ask = AskReserve {
            transaction,
            coordinator: self.id.clone(),
            path_id,
            route: route.clone(),
            position: 1,
            deliver,
            remaining_hops: self.config.max_hops,
            charging: charging.clone(),
            amount,
        };
        let response = self
            .transport
            .request(
                &self.id,
                &next,
                ProtocolMessage::AskReserve(ask),
                self.config.hop_timeout(route.len()),
            )
            .await;

        let amounts = match response {
            Ok(ProtocolMessage::ReserveApproved { amounts }) => amounts,
            Ok(ProtocolMessage::ReserveRejected { reason }) => {
                self.release_remote(transaction, path_id, &route).await;
                return Ok(Err((route, reason)));
            }
            Ok(other) => {
                self.release_remote(transaction, path_id, &route).await;
                return Ok(Err((route, unexpected(other).to_string())));
            }
            Err(e) => {
                self.release_remote(transaction, path_id, &route).await;
                return Ok(Err((route, e.to_string())));
            }
        };

        if amounts.len() != route.len() {
            self.release_remote(transaction, path_id, &route).await;
            return Ok(Err((
                route,
                format!("expected {} amounts, got {}", planned.len(), amounts.len()),
            )));
        }

        let hold = match self.ledger.reserve(
            &next,
            equivalent,
            Direction::Outgoing,
            amounts[0],
            self.config.reservation_ttl(),
            transaction,
            path_id,
        ) {
            Ok(hold) => hold,
            Err(e) => {
                self.release_remote(transaction, path_id, &route).await;
                return Ok(Err((route, e.to_string())));
            }
        };

        self.store.update(transaction, |record| {
            record.holds.insert(
                path_id,
                PathHold {
                    route: route.clone(),
                    position: 0,
                    incoming: None,
                    outgoing: Some((hold, amounts[0])),
                    commission: None,
                },
            );
            Ok(())
        })?;
        debug!(
            node = %self.id,
            %transaction,
            path = path_id,
            route = %route,
            paid = %amounts[0],
            %deliver,
            "Path reserved"
        );

        Ok(Ok(ConfiguredPath {
            path_id,
            route,
            amounts,
            charging,
        }))
    }

    /// Ask every node of a route to drop its holds for one path
    async fn release_remote(&self, transaction: Uuid, path_id: u32, route: &Route) {
        let sends = route.nodes.iter().skip(1).map(|node| {
            self.transport.send(
                &self.id,
                node,
                ProtocolMessage::ReleasePath {
                    transaction,
                    path_id,
                },
            )
        });
        for result in join_all(sends).await {
            if let Err(e) = result {
                debug!(node = %self.id, %transaction, path = path_id, error = %e, "Release notice not delivered");
            }
        }
    }

    async fn release_path(&self, transaction: Uuid, path: &ConfiguredPath) -> Result<()> {
        let hold = self
            .store
            .update(transaction, |record| Ok(record.holds.remove(&path.path_id)))?
            .flatten();
        if let Some((id, _)) = hold.and_then(|hold| hold.outgoing) {
            if let Err(e) = self.ledger.release(&path.route.nodes[1], path.route.edges[0], id) {
                debug!(node = %self.id, %transaction, error = %e, "Hold already gone");
            }
        }
        self.release_remote(transaction, path.path_id, &path.route)
            .await;
        Ok(())
    }

    async fn send_configuration(&self, configuration: &PathConfiguration, participants: &[NodeId]) {
        let requests = participants.iter().map(|node| {
            self.transport.request(
                &self.id,
                node,
                ProtocolMessage::Configure(configuration.clone()),
                self.config.hop_timeout(1),
            )
        });
        let responses = join_all(requests).await;
        for (node, response) in participants.iter().zip(responses) {
            match response {
                Ok(ProtocolMessage::Ack) => {}
                Ok(other) => debug!(
                    node = %self.id,
                    participant = %node,
                    kind = other.kind(),
                    "Configuration not acknowledged"
                ),
                Err(e) => debug!(
                    node = %self.id,
                    participant = %node,
                    error = %e,
                    "Configuration not delivered"
                ),
            }
        }
    }

    async fn collect_votes(
        &self,
        transaction: Uuid,
        digest: [u8; 32],
        participants: &[NodeId],
    ) -> std::result::Result<Vec<ParticipantSignature>, String> {
        let requests = participants.iter().map(|node| {
            self.transport.request(
                &self.id,
                node,
                ProtocolMessage::Vote {
                    transaction,
                    digest,
                },
                self.config.hop_timeout(2),
            )
        });
        let responses = join_all(requests).await;

        let mut signatures = Vec::with_capacity(participants.len());
        for (node, response) in participants.iter().zip(responses) {
            match response {
                Ok(ProtocolMessage::VoteGranted(signature)) => {
                    if &signature.node != node {
                        return Err(format!("{} answered with a vote of {}", node, signature.node));
                    }
                    signature
                        .verify(transaction, &digest)
                        .map_err(|e| format!("{}: {}", node, e))?;
                    signatures.push(signature);
                }
                Ok(ProtocolMessage::VoteRefused { reason }) => {
                    return Err(format!("{} refused: {}", node, reason))
                }
                Ok(other) => return Err(format!("{}: {}", node, unexpected(other))),
                Err(e) => return Err(format!("{}: {}", node, e)),
            }
        }
        info!(node = %self.id, %transaction, votes = signatures.len(), "Votes collected");
        Ok(signatures)
    }

    /// Abort after the vote round started without a complete signature set
    async fn reject_voting(&self, attempt: &mut Attempt, reason: String) -> Error {
        attempt.voting = true;
        self.cancel(attempt, &reason).await;
        Error::NoConsensus {
            transaction: attempt.transaction,
            reason,
        }
    }

    /// Release everything and tell every touched node the transaction is rejected
    async fn cancel(&self, attempt: &Attempt, reason: &str) {
        let transaction = attempt.transaction;
        if let Err(e) = self.apply_reject(transaction, reason) {
            error!(node = %self.id, %transaction, error = %e, "Local rejection failed");
        }
        if attempt.voting {
            if let Err(e) = self.observing.reject(transaction, &self.id) {
                warn!(node = %self.id, %transaction, error = %e, "Observing ledger refused rejection");
            }
        }
        let touched: Vec<NodeId> = attempt.touched.iter().cloned().collect();
        self.broadcast_reject(transaction, &touched).await;
    }

    pub(crate) async fn broadcast_reject(&self, transaction: Uuid, nodes: &[NodeId]) {
        let sends = nodes.iter().map(|node| {
            self.transport
                .send(&self.id, node, ProtocolMessage::Reject { transaction })
        });
        for (node, result) in nodes.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                debug!(node = %self.id, %transaction, target = %node, error = %e, "Reject not delivered");
            }
        }
    }

    async fn finalize(
        &self,
        transaction: Uuid,
        configuration: &PathConfiguration,
        digest: [u8; 32],
        signatures: &[ParticipantSignature],
    ) -> Result<()> {
        self.store.update(transaction, |record| {
            record.signatures = signatures.to_vec();
            record.stage = Stage::VotesCollected;
            Ok(())
        })?;
        self.log(transaction, RecoveryEvent::Stage(Stage::VotesCollected));
        self.ledger.extend_transaction(transaction, self.decision_deadline())?;

        let mut deliver = self.checkpoint(Checkpoint::AfterVotesCollected, Some(transaction))?;
        deliver &= self.checkpoint(Checkpoint::BeforeVoteConsistency, Some(transaction))?;

        let participants: Vec<NodeId> = configuration.participants().into_iter().collect();
        let missed = if deliver {
            self.broadcast_consistency(transaction, digest, signatures, &participants)
                .await
        } else {
            participants.len()
        };

        let mut observing = ObservingState::NoInfo;
        if missed > 0 {
            observing = self.submit_claim(transaction, digest, signatures);
            if observing == ObservingState::Rejected {
                self.apply_reject(transaction, "observing ledger rejected the claim")?;
                return Err(Error::Protocol {
                    transaction,
                    reason: "observing ledger rejected the claim".to_string(),
                });
            }
        }

        self.checkpoint(Checkpoint::BeforeCommit, Some(transaction))?;
        self.apply_commit(transaction, Stage::Committed, None, observing)?;

        if missed > 0 {
            return Err(Error::Protocol {
                transaction,
                reason: format!("{} participants missed the final broadcast", missed),
            });
        }
        Ok(())
    }

    /// Send the signature set to every participant; returns how many missed it
    pub(crate) async fn broadcast_consistency(
        &self,
        transaction: Uuid,
        digest: [u8; 32],
        signatures: &[ParticipantSignature],
        participants: &[NodeId],
    ) -> usize {
        let requests = participants.iter().map(|node| {
            self.transport.request(
                &self.id,
                node,
                ProtocolMessage::VoteConsistency {
                    transaction,
                    digest,
                    signatures: signatures.to_vec(),
                },
                self.config.hop_timeout(1),
            )
        });
        let responses = join_all(requests).await;

        let mut missed = 0;
        for (node, response) in participants.iter().zip(responses) {
            match response {
                Ok(ProtocolMessage::Ack) => {}
                Ok(other) => {
                    missed += 1;
                    warn!(node = %self.id, %transaction, participant = %node, kind = other.kind(), "Final broadcast refused");
                }
                Err(e) => {
                    missed += 1;
                    warn!(node = %self.id, %transaction, participant = %node, error = %e, "Final broadcast not delivered");
                }
            }
        }
        missed
    }

    /// Submit the signature set to the observing ledger
    pub(crate) fn submit_claim(
        &self,
        transaction: Uuid,
        digest: [u8; 32],
        signatures: &[ParticipantSignature],
    ) -> ObservingState {
        self.metrics.claims_total.inc();
        let claim = Claim {
            transaction,
            digest,
            signatures: signatures.to_vec(),
            submitted_by: self.id.clone(),
        };
        match self.observing.claim(claim) {
            Ok(state) => {
                info!(node = %self.id, %transaction, ?state, "Claim submitted");
                self.log(transaction, RecoveryEvent::ClaimSubmitted(state));
                state
            }
            Err(e) => {
                warn!(node = %self.id, %transaction, error = %e, "Claim refused");
                self.log(transaction, RecoveryEvent::ClaimRefused(e.to_string()));
                match e {
                    observing_ledger::Error::WindowClosed(_)
                    | observing_ledger::Error::AlreadyRejected(_) => ObservingState::Rejected,
                    _ => self.observing.state(transaction),
                }
            }
        }
    }

    /// Finish a coordinated transaction left in flight
    pub(crate) async fn resume_coordinator(&self, transaction: Uuid) -> Result<()> {
        let Some(record) = self.store.get(transaction) else {
            return Ok(());
        };
        if record.stage.is_terminal() {
            return Ok(());
        }

        let participants: Vec<NodeId> = record
            .configuration
            .as_ref()
            .map(|configuration| configuration.participants().into_iter().collect())
            .unwrap_or_default();

        match (record.has_full_signature_set(), record.digest) {
            (true, Some(digest)) => {
                let state = self.submit_claim(transaction, digest, &record.signatures);
                if state.is_accepted() {
                    self.apply_commit(transaction, Stage::Claimed, None, state)?;
                    self.broadcast_consistency(transaction, digest, &record.signatures, &participants)
                        .await;
                } else if state == ObservingState::Rejected {
                    self.apply_reject(transaction, "observing ledger rejected the claim")?;
                    self.broadcast_reject(transaction, &participants).await;
                } else {
                    warn!(node = %self.id, %transaction, ?state, "Claim undecided, leaving to the watcher");
                }
            }
            _ => {
                let mut touched: BTreeSet<NodeId> = participants.into_iter().collect();
                for hold in record.holds.values() {
                    touched.extend(hold.route.nodes.iter().skip(1).cloned());
                }
                if let Err(e) = self.observing.reject(transaction, &self.id) {
                    warn!(node = %self.id, %transaction, error = %e, "Observing ledger refused rejection");
                }
                self.apply_reject(transaction, "coordinator restarted before votes were collected")?;
                let touched: Vec<NodeId> = touched.into_iter().collect();
                self.broadcast_reject(transaction, &touched).await;
            }
        }
        Ok(())
    }

    /// Amount deliverable and its cost over every route
    pub(crate) async fn max_flow(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
    ) -> Result<ExchangeFlow> {
        let (topology, routes) = self
            .routes_to(receiver, send_equivalent, receive_equivalent)
            .await;
        let plans = Planner::new(&topology, self.ledger.precision()).max_flow(&routes);
        let flow = ExchangeFlow {
            receive: delivered(&plans),
            pay: cost(&plans),
        };
        debug!(node = %self.id, receiver = %receiver, receive = %flow.receive, pay = %flow.pay, "Max flow computed");
        Ok(flow)
    }

    pub(crate) async fn estimate_payment(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
        amount: Decimal,
        max_allowable: Option<Decimal>,
    ) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!("amount must be positive, got {}", amount)));
        }
        let (topology, routes) = self
            .routes_to(receiver, send_equivalent, receive_equivalent)
            .await;
        if routes.is_empty() {
            return Err(Error::NoPaymentRoutes(receiver.clone()));
        }

        let plans = Planner::new(&topology, self.ledger.precision()).allocate(&routes, amount);
        let available = delivered(&plans);
        if available < amount {
            return Err(Error::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let required = cost(&plans);
        if let Some(maximum) = max_allowable {
            if required > maximum {
                return Err(Error::MoreThanMaxAllowableAmount { required, maximum });
            }
        }
        Ok(required)
    }

    pub(crate) async fn estimate_receive(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!("amount must be positive, got {}", amount)));
        }
        let (topology, routes) = self
            .routes_to(receiver, send_equivalent, receive_equivalent)
            .await;
        if routes.is_empty() {
            return Err(Error::NoPaymentRoutes(receiver.clone()));
        }

        let capacity = cost(&Planner::new(&topology, self.ledger.precision()).max_flow(&routes));
        if capacity < amount {
            return Err(Error::InsufficientFunds {
                requested: amount,
                available: capacity,
            });
        }

        let plans = Planner::new(&topology, self.ledger.precision()).spend(&routes, amount);
        let received = delivered(&plans);
        if received <= Decimal::ZERO {
            return Err(Error::InsufficientFunds {
                requested: amount,
                available: Decimal::ZERO,
            });
        }
        Ok(received)
    }
}

fn topology_equivalents(request: &PaymentRequest) -> Vec<Equivalent> {
    [request.send_equivalent, request.receive_equivalent]
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
