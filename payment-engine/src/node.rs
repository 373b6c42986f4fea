//! Payment node: control interface, supervisor and message dispatch
//!
//! A [`Node`] is the handle a driver holds. The running state lives in a
//! `NodeCore` owned by a supervisor: every task of the node (dispatcher,
//! protocol handlers, recovery, observing watcher, control operations) runs
//! in the core's `JoinSet`, so a kill aborts all of them, closes the bus
//! mailbox and drops the storage handle. A restart reopens the same data
//! directory and resumes in-flight transactions from their durable records.

use crate::{
    config::Config,
    faults::{Checkpoint, FaultAction, FaultPlan},
    messages::ProtocolMessage,
    metrics::NodeMetrics,
    routing::{
        discover, find_routes, refresh_capacities, LineCapacity, NodeInfo, RouteCache, RouteKey,
        RouteQuery, Topology,
    },
    store::TransactionStore,
    types::{
        AuditReport, ExchangeFlow, PaymentRequest, RecoveryEntry, RecoveryEvent, Route, Stage,
        TransactionView,
    },
    Error, Result,
};
use exchange_engine::{ExchangeRate, ExchangeTable, NativeRate};
use line_ledger::{
    spawn_sweeper, Column, Equivalent, LineLedger, LineView, LineViolation, NodeId, Reservation,
    Storage, SweeperHandle,
};
use message_bus::{Envelope, Mailbox, Message, Transport};
use observing_ledger::{vote_payload, KeyPair, ObservingLedger, ObservingState, ParticipantSignature};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_PREFIX: &[u8] = b"channel/";
const SEED_KEY: &[u8] = b"signing_seed";

/// Exchange rate as entered through the control interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateInput {
    /// Decimal literal such as `"112071.54"`
    Real(String),
    /// Fixed-point value and shift
    Native {
        /// Significand
        value: i64,
        /// Decimal shift
        shift: i64,
    },
}

/// Running state of a node
pub(crate) struct NodeCore {
    pub(crate) id: NodeId,
    pub(crate) config: Config,
    pub(crate) storage: Arc<Storage>,
    pub(crate) ledger: Arc<LineLedger>,
    pub(crate) exchange: ExchangeTable,
    pub(crate) store: TransactionStore,
    pub(crate) keypair: KeyPair,
    pub(crate) transport: Arc<dyn Transport<ProtocolMessage>>,
    pub(crate) observing: Arc<ObservingLedger>,
    pub(crate) faults: Arc<FaultPlan>,
    pub(crate) routes: RouteCache,
    pub(crate) channels: RwLock<BTreeSet<NodeId>>,
    pub(crate) metrics: NodeMetrics,
    tasks: Mutex<JoinSet<()>>,
    sweeper: Mutex<Option<SweeperHandle>>,
    terminated: AtomicBool,
    kill: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("id", &self.id)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

impl NodeCore {
    fn open(
        config: Config,
        transport: Arc<dyn Transport<ProtocolMessage>>,
        observing: Arc<ObservingLedger>,
        faults: Arc<FaultPlan>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let id = config.node();
        let storage = Arc::new(Storage::open(&config.ledger)?);

        let registry = Arc::new(Registry::new());
        let ledger_metrics = line_ledger::Metrics::with_registry(registry.clone())?;
        let metrics = NodeMetrics::with_registry(registry)?;

        let ledger = Arc::new(LineLedger::open(
            storage.clone(),
            config.ledger.precision(),
            ledger_metrics,
        )?);
        let exchange = ExchangeTable::open(storage.clone())?;
        let store = TransactionStore::open(id.clone(), storage.clone())?;
        let keypair = load_keypair(&config, &storage)?;

        let channels: BTreeSet<NodeId> = storage
            .scan_prefix::<NodeId>(Column::Meta, CHANNEL_PREFIX)?
            .into_iter()
            .map(|(_, peer)| peer)
            .collect();

        let (kill, kill_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                id,
                config,
                storage,
                ledger,
                exchange,
                store,
                keypair,
                transport,
                observing,
                faults,
                routes: RouteCache::new(),
                channels: RwLock::new(channels),
                metrics,
                tasks: Mutex::new(JoinSet::new()),
                sweeper: Mutex::new(None),
                terminated: AtomicBool::new(false),
                kill,
            },
            kill_rx,
        ))
    }

    /// Register the mailbox and start the background tasks
    fn launch(self: &Arc<Self>) {
        let mailbox = self.transport.register(&self.id);
        self.spawn(self.clone().dispatch(mailbox));
        self.spawn(self.clone().watch_observing());
        self.spawn(self.clone().retire_settled());

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        *self.sweeper.lock() = Some(spawn_sweeper(
            self.ledger.clone(),
            self.config.sweep_interval(),
            Some(expired_tx),
        ));
        self.spawn(self.clone().on_expired(expired_rx));

        self.resume();
        info!(node = %self.id, "Node started");
    }

    /// Run a task under the supervisor; dropped once the node is terminated
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Ask the supervisor to kill the node
    pub(crate) fn request_kill(&self) {
        let _ = self.kill.send(());
    }

    async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock();
            self.terminated.store(true, Ordering::SeqCst);
            std::mem::take(&mut *guard)
        };
        self.transport.unregister(&self.id);
        tasks.shutdown().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }

    /// Fire a checkpoint; `Ok(false)` means the next message is lost
    pub(crate) fn checkpoint(&self, checkpoint: Checkpoint, transaction: Option<Uuid>) -> Result<bool> {
        let Some(action) = self.faults.take(checkpoint) else {
            return Ok(true);
        };

        warn!(node = %self.id, ?checkpoint, ?action, transaction = ?transaction, "Fault injected");
        if let Some(tx) = transaction {
            self.log(tx, RecoveryEvent::Fault { checkpoint, action });
        }

        match action {
            FaultAction::LoseMessage => Ok(false),
            FaultAction::Exception => Err(Error::Injected(checkpoint)),
            FaultAction::Terminate => {
                self.request_kill();
                Err(Error::Terminated)
            }
        }
    }

    /// Append to the recovery log, logging storage failures
    pub(crate) fn log(&self, transaction: Uuid, event: RecoveryEvent) {
        if let Err(e) = self.store.log(transaction, event) {
            error!(node = %self.id, %transaction, error = %e, "Recovery log write failed");
        }
    }

    /// Move a transaction to a stage
    pub(crate) fn set_stage(&self, transaction: Uuid, stage: Stage) -> Result<()> {
        self.store.update(transaction, |record| {
            record.stage = stage;
            Ok(())
        })?;
        info!(node = %self.id, %transaction, ?stage, "Transaction stage");
        self.log(transaction, RecoveryEvent::Stage(stage));
        Ok(())
    }

    /// Sign a vote
    pub(crate) fn sign(&self, transaction: Uuid, digest: &[u8; 32]) -> ParticipantSignature {
        let payload = vote_payload(transaction, digest);
        ParticipantSignature {
            node: self.id.clone(),
            public_key: self.keypair.public_key(),
            signature: self.keypair.sign(&payload),
        }
    }

    /// What this node reports to topology requests
    pub(crate) fn local_info(&self, equivalents: &[Equivalent]) -> NodeInfo {
        let lines = self
            .ledger
            .list()
            .into_iter()
            .filter(|view| equivalents.contains(&view.equivalent))
            .map(|view| LineCapacity {
                neighbor: view.neighbor,
                equivalent: view.equivalent,
                available: view.available_outgoing,
            })
            .collect();
        NodeInfo {
            node: self.id.clone(),
            lines,
            exchange: self.exchange.snapshot(),
        }
    }

    /// Topology and routes towards a receiver
    ///
    /// Topologies are served from the route cache with refreshed
    /// capacities; a search that finds no route is not cached.
    pub(crate) async fn routes_to(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
    ) -> (Topology, Vec<Route>) {
        let equivalents: Vec<Equivalent> = [send_equivalent, receive_equivalent]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let key = RouteKey::new(receiver.clone(), equivalents.iter().copied());
        let local = self.local_info(&equivalents);
        let timeout = self.config.hop_timeout(1);

        let (topology, cached) = match self.routes.get(&key) {
            Some(mut topology) => {
                refresh_capacities(&*self.transport, local, &mut topology, &equivalents, timeout)
                    .await;
                (topology, true)
            }
            None => (
                discover(
                    &*self.transport,
                    local,
                    receiver,
                    &equivalents,
                    self.config.max_hops,
                    timeout,
                )
                .await,
                false,
            ),
        };

        let routes = find_routes(
            &topology,
            &RouteQuery {
                source: self.id.clone(),
                target: receiver.clone(),
                send_equivalent,
                receive_equivalent,
                max_hops: self.config.max_hops,
                max_paths: self.config.max_paths,
            },
        );
        debug!(
            node = %self.id,
            receiver = %receiver,
            routes = routes.len(),
            cached,
            "Routes resolved"
        );

        if !routes.is_empty() {
            self.routes.insert(key, topology.clone());
        }
        (topology, routes)
    }

    async fn dispatch(self: Arc<Self>, mut mailbox: Mailbox<ProtocolMessage>) {
        while let Some(envelope) = mailbox.recv().await {
            let core = self.clone();
            self.spawn(async move { core.handle(envelope).await });
        }
        debug!(node = %self.id, "Mailbox closed");
    }

    async fn handle(self: Arc<Self>, envelope: Envelope<ProtocolMessage>) {
        let Envelope {
            from,
            message,
            responder,
            ..
        } = envelope;
        let kind = message.kind();

        match self.respond(&from, message).await {
            Ok(Some(response)) => {
                if let Some(responder) = responder {
                    responder.send(response);
                }
            }
            Ok(None) => {}
            Err(Error::Terminated) => {}
            Err(e) => {
                warn!(node = %self.id, from = %from, kind, error = %e, "Handler failed");
                if let Some(responder) = responder {
                    responder.send(ProtocolMessage::Failure {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn respond(
        self: &Arc<Self>,
        from: &NodeId,
        message: ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        match message {
            ProtocolMessage::OpenChannel => {
                self.add_channel(from)?;
                Ok(Some(ProtocolMessage::Ack))
            }
            ProtocolMessage::TrustChanged { equivalent, amount } => {
                if !self.channels.read().contains(from) {
                    return Err(Error::Validation(format!("no channel with {}", from)));
                }
                self.ledger.set_incoming_trust(from, equivalent, amount)?;
                Ok(Some(ProtocolMessage::Ack))
            }
            ProtocolMessage::Neighbors { equivalents } => {
                Ok(Some(ProtocolMessage::NodeInfo(self.local_info(&equivalents))))
            }
            ProtocolMessage::Capacity { equivalents } => Ok(Some(ProtocolMessage::Capacities(
                self.local_info(&equivalents).lines,
            ))),
            ProtocolMessage::AskReserve(ask) => self.on_ask_reserve(from, ask).await,
            ProtocolMessage::ReleasePath {
                transaction,
                path_id,
            } => {
                self.on_release_path(from, transaction, path_id)?;
                Ok(None)
            }
            ProtocolMessage::Configure(configuration) => {
                self.on_configure(from, configuration)?;
                Ok(Some(ProtocolMessage::Ack))
            }
            ProtocolMessage::GetConfiguration { transaction } => Ok(Some(
                ProtocolMessage::Configuration(self.configuration_for(from, transaction)),
            )),
            ProtocolMessage::Vote {
                transaction,
                digest,
            } => self.on_vote(from, transaction, digest).await,
            ProtocolMessage::VoteConsistency {
                transaction,
                digest,
                signatures,
            } => self.on_vote_consistency(from, transaction, digest, signatures),
            ProtocolMessage::Reject { transaction } => {
                self.on_reject(from, transaction)?;
                Ok(None)
            }
            ProtocolMessage::Status { transaction } => {
                Ok(Some(ProtocolMessage::Decision(self.decision(transaction))))
            }
            other => {
                debug!(node = %self.id, from = %from, kind = other.kind(), "Ignoring unsolicited message");
                Ok(None)
            }
        }
    }

    fn add_channel(&self, peer: &NodeId) -> Result<()> {
        let mut key = CHANNEL_PREFIX.to_vec();
        key.extend_from_slice(peer.as_str().as_bytes());
        self.storage.put(Column::Meta, &key, peer)?;
        if self.channels.write().insert(peer.clone()) {
            info!(node = %self.id, peer = %peer, "Channel opened");
        }
        Ok(())
    }

    async fn open_channel(&self, peer: &NodeId) -> Result<()> {
        if peer == &self.id {
            return Err(Error::Validation("cannot open a channel to self".to_string()));
        }
        match self
            .transport
            .request(&self.id, peer, ProtocolMessage::OpenChannel, self.config.hop_timeout(1))
            .await?
        {
            ProtocolMessage::Ack => self.add_channel(peer),
            other => Err(unexpected(other)),
        }
    }

    async fn set_settlement_line(
        &self,
        peer: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<LineView> {
        if amount < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "trust amount must not be negative, got {}",
                amount
            )));
        }
        if !self.ledger.precision().is_exact(equivalent, amount) {
            return Err(Error::Validation(format!(
                "{} has more fractional digits than {} allows",
                amount, equivalent
            )));
        }
        if !self.channels.read().contains(peer) {
            return Err(Error::Validation(format!("no channel with {}", peer)));
        }

        let notice = ProtocolMessage::TrustChanged { equivalent, amount };
        match self
            .transport
            .request(&self.id, peer, notice, self.config.hop_timeout(1))
            .await?
        {
            ProtocolMessage::Ack => {}
            ProtocolMessage::Failure { reason } => return Err(Error::Validation(reason)),
            other => return Err(unexpected(other)),
        }

        let view = self.ledger.set_outgoing_trust(peer, equivalent, amount)?;
        Ok(view)
    }

    async fn on_expired(self: Arc<Self>, mut expired: mpsc::UnboundedReceiver<Reservation>) {
        while let Some(reservation) = expired.recv().await {
            if let Err(e) = self.expire_hold(&reservation) {
                warn!(
                    node = %self.id,
                    transaction = %reservation.transaction,
                    error = %e,
                    "Expiry handling failed"
                );
            }
        }
    }
}

/// Handle of a payment node
pub struct Node {
    id: NodeId,
    config: Config,
    transport: Arc<dyn Transport<ProtocolMessage>>,
    observing: Arc<ObservingLedger>,
    faults: Arc<FaultPlan>,
    core: Arc<RwLock<Option<Arc<NodeCore>>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(core) = self.core.read().as_ref() {
            core.request_kill();
        }
    }
}

impl Node {
    /// Open the node's storage, join the bus and resume in-flight work
    pub async fn start(
        config: Config,
        transport: Arc<dyn Transport<ProtocolMessage>>,
        observing: Arc<ObservingLedger>,
    ) -> Result<Self> {
        config.validate()?;
        let node = Self {
            id: config.node(),
            config,
            transport,
            observing,
            faults: Arc::new(FaultPlan::new()),
            core: Arc::new(RwLock::new(None)),
            supervisor: Mutex::new(None),
        };
        node.boot()?;
        Ok(node)
    }

    fn boot(&self) -> Result<()> {
        let (core, mut kill) = NodeCore::open(
            self.config.clone(),
            self.transport.clone(),
            self.observing.clone(),
            self.faults.clone(),
        )?;
        let core = Arc::new(core);
        *self.core.write() = Some(core.clone());
        core.launch();

        let slot = self.core.clone();
        let id = self.id.clone();
        let supervisor = tokio::spawn(async move {
            let _ = kill.recv().await;
            let core = slot.write().take();
            if let Some(core) = core {
                core.shutdown().await;
            }
            warn!(node = %id, "Node terminated");
        });
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    fn core(&self) -> Result<Arc<NodeCore>> {
        self.core.read().clone().ok_or(Error::Terminated)
    }

    /// Run an operation under the node's supervisor
    async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<NodeCore>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let core = self.core()?;
            let future = operation(core.clone());
            core.spawn(async move {
                let _ = tx.send(future.await);
            });
        }
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Node identifier
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True until the node is terminated
    pub fn is_running(&self) -> bool {
        self.core.read().is_some()
    }

    /// Kill the node and wait until its storage is closed
    pub async fn terminate(&self) {
        if let Some(core) = self.core.read().as_ref() {
            core.request_kill();
        }
        self.wait_stopped().await;
    }

    /// Wait for the supervisor to finish a kill
    pub async fn wait_stopped(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    /// Reopen the node from its data directory
    pub async fn restart(&self) -> Result<()> {
        if self.is_running() {
            self.terminate().await;
        } else {
            self.wait_stopped().await;
        }
        info!(node = %self.id, "Restarting node");
        self.boot()
    }

    /// Arm a fault checkpoint
    pub fn arm_fault(&self, checkpoint: Checkpoint, action: FaultAction) {
        self.faults.arm(checkpoint, action);
    }

    /// Disarm every fault checkpoint
    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Open a channel with a peer
    pub async fn open_channel(&self, peer: &NodeId) -> Result<()> {
        let peer = peer.clone();
        self.run(|core| async move { core.open_channel(&peer).await })
            .await
    }

    /// Set the trust this node extends to a peer
    pub async fn set_settlement_line(
        &self,
        peer: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<LineView> {
        let peer = peer.clone();
        self.run(move |core| async move { core.set_settlement_line(&peer, equivalent, amount).await })
            .await
    }

    /// Every line, ordered by equivalent and neighbor
    pub fn list_lines(&self) -> Result<Vec<LineView>> {
        Ok(self.core()?.ledger.list())
    }

    /// One line
    pub fn line(&self, peer: &NodeId, equivalent: Equivalent) -> Result<LineView> {
        self.core()?
            .ledger
            .query(peer, equivalent)
            .map_err(|_| Error::NotFound(format!("line {} / {}", peer, equivalent)))
    }

    /// Set an exchange rate
    pub fn set_exchange_rate(
        &self,
        from: Equivalent,
        to: Equivalent,
        rate: RateInput,
        min_amount: Option<Decimal>,
        max_amount: Option<Decimal>,
    ) -> Result<ExchangeRate> {
        self.set_expiring_exchange_rate(from, to, rate, min_amount, max_amount, None)
    }

    /// Set an exchange rate that stops applying after `ttl`
    pub fn set_expiring_exchange_rate(
        &self,
        from: Equivalent,
        to: Equivalent,
        rate: RateInput,
        min_amount: Option<Decimal>,
        max_amount: Option<Decimal>,
        ttl: Option<Duration>,
    ) -> Result<ExchangeRate> {
        let core = self.core()?;
        let native = match &rate {
            RateInput::Real(literal) => NativeRate::parse(literal),
            RateInput::Native { value, shift } => NativeRate::from_parts(*value, *shift),
        }
        .map_err(bad_request)?;

        let mut rate = ExchangeRate::new(from, to, native).with_bounds(min_amount, max_amount);
        if let Some(ttl) = ttl {
            rate = rate.with_ttl(ttl);
        }
        core.exchange.set_rate(rate.clone()).map_err(bad_request)?;
        info!(node = %self.id, %from, %to, rate = %rate.real(), "Exchange rate set");
        Ok(rate)
    }

    /// Look up an exchange rate
    pub fn get_exchange_rate(&self, from: Equivalent, to: Equivalent) -> Result<ExchangeRate> {
        self.core()?
            .exchange
            .rate(from, to)
            .map_err(|_| Error::NotFound(format!("exchange rate {} -> {}", from, to)))
    }

    /// Every exchange rate
    pub fn list_exchange_rates(&self) -> Result<Vec<ExchangeRate>> {
        Ok(self.core()?.exchange.list_rates())
    }

    /// Remove every exchange rate
    pub fn clear_exchange_rates(&self) -> Result<()> {
        self.core()?.exchange.clear_rates()?;
        Ok(())
    }

    /// Set the commission charged in an equivalent; zero removes it
    pub fn set_commission(&self, equivalent: Equivalent, amount: Decimal) -> Result<()> {
        self.core()?
            .exchange
            .set_commission(equivalent, amount)
            .map_err(bad_request)?;
        Ok(())
    }

    /// Every commission
    pub fn list_commissions(&self) -> Result<Vec<exchange_engine::Commission>> {
        Ok(self.core()?.exchange.list_commissions())
    }

    /// Pay `amount` of `equivalent` to `receiver`
    pub async fn create_transaction(
        &self,
        receiver: &NodeId,
        equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<Uuid> {
        self.pay(PaymentRequest {
            receiver: receiver.clone(),
            send_equivalent: equivalent,
            receive_equivalent: equivalent,
            amount,
            max_allowable: None,
        })
        .await
    }

    /// Deliver `amount` of `receive_equivalent`, paying in `send_equivalent`
    pub async fn create_exchange_transaction(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        amount: Decimal,
        receive_equivalent: Equivalent,
        max_allowable: Option<Decimal>,
    ) -> Result<Uuid> {
        self.pay(PaymentRequest {
            receiver: receiver.clone(),
            send_equivalent,
            receive_equivalent,
            amount,
            max_allowable,
        })
        .await
    }

    async fn pay(&self, request: PaymentRequest) -> Result<Uuid> {
        self.run(|core| async move { core.pay(request).await }).await
    }

    /// Largest amount deliverable to `receiver` in one equivalent
    pub async fn check_max_flow(&self, receiver: &NodeId, equivalent: Equivalent) -> Result<Decimal> {
        let flow = self
            .check_exchange_max_flow(receiver, equivalent, equivalent)
            .await?;
        Ok(flow.receive)
    }

    /// Largest amount deliverable in `receive_equivalent` when paying in `send_equivalent`
    pub async fn check_exchange_max_flow(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
    ) -> Result<ExchangeFlow> {
        let receiver = receiver.clone();
        self.run(move |core| async move {
            core.max_flow(&receiver, send_equivalent, receive_equivalent)
                .await
        })
        .await
    }

    /// Amount the sender pays so the receiver gets `amount`
    pub async fn estimate_payment_for_receive_amount(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
        amount: Decimal,
        max_allowable: Option<Decimal>,
    ) -> Result<Decimal> {
        let receiver = receiver.clone();
        self.run(move |core| async move {
            core.estimate_payment(&receiver, send_equivalent, receive_equivalent, amount, max_allowable)
                .await
        })
        .await
    }

    /// Amount the receiver gets when the sender pays `amount`
    pub async fn estimate_receive_for_payment_amount(
        &self,
        receiver: &NodeId,
        send_equivalent: Equivalent,
        receive_equivalent: Equivalent,
        amount: Decimal,
    ) -> Result<Decimal> {
        let receiver = receiver.clone();
        self.run(move |core| async move {
            core.estimate_receive(&receiver, send_equivalent, receive_equivalent, amount)
                .await
        })
        .await
    }

    /// Forget every cached topology
    pub fn clear_route_cache(&self) -> Result<()> {
        self.core()?.routes.clear();
        Ok(())
    }

    /// Local view of a transaction
    pub fn transaction(&self, transaction: Uuid) -> Result<TransactionView> {
        self.core()?
            .store
            .get(transaction)
            .map(|record| record.view())
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction)))
    }

    /// Every transaction known locally
    pub fn transactions(&self) -> Result<Vec<TransactionView>> {
        Ok(self
            .core()?
            .store
            .history()?
            .iter()
            .map(|record| record.view())
            .collect())
    }

    /// Number of transaction records held in memory
    pub fn resident_transactions(&self) -> Result<usize> {
        Ok(self.core()?.store.resident())
    }

    /// State of a transaction on the observing ledger
    pub fn observing_state(&self, transaction: Uuid) -> ObservingState {
        self.observing.state(transaction)
    }

    /// Recovery log of one transaction, or of every transaction
    pub fn recovery_log(&self, transaction: Option<Uuid>) -> Result<Vec<RecoveryEntry>> {
        self.core()?.store.recovery_log(transaction)
    }

    /// Compare the local outcome of a transaction with the observing ledger
    pub fn audit(&self, transaction: Uuid) -> Result<AuditReport> {
        self.core()?.audit(transaction)
    }

    /// Lines whose balance is outside the current trust bounds
    pub fn audit_lines(&self) -> Result<Vec<LineViolation>> {
        Ok(self.core()?.audit_lines())
    }

    /// Node metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String> {
        use prometheus::Encoder;

        let core = self.core()?;
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&core.metrics.registry.gather(), &mut buffer)
            .map_err(Error::Metrics)?;
        String::from_utf8(buffer).map_err(|e| Error::Config(e.to_string()))
    }
}

fn load_keypair(config: &Config, storage: &Storage) -> Result<KeyPair> {
    if let Some(seed) = &config.key_seed {
        return KeyPair::from_hex_seed(seed).map_err(|e| Error::Config(e.to_string()));
    }
    if let Some(seed) = storage.get::<[u8; 32]>(Column::Meta, SEED_KEY)? {
        return Ok(KeyPair::from_seed(&seed));
    }
    let keypair = KeyPair::generate();
    storage.put(Column::Meta, SEED_KEY, &keypair.seed())?;
    Ok(keypair)
}

fn bad_request(error: exchange_engine::Error) -> Error {
    match error {
        exchange_engine::Error::Ledger(e) => Error::Ledger(e),
        other => Error::Validation(other.to_string()),
    }
}

pub(crate) fn unexpected(message: ProtocolMessage) -> Error {
    match message {
        ProtocolMessage::Failure { reason } => Error::UnexpectedResponse(reason),
        other => Error::UnexpectedResponse(other.kind().to_string()),
    }
}
