//! Integration tests for the payment engine
//!
//! Every test runs a small network of nodes on one in-process bus with a
//! shared observing ledger:
//! - Direct and multi-hop payments, with and without exchange
//! - Commission accounting across parallel paths
//! - Message loss, injected failures and node restarts
//! - Reservation expiry and concurrent load through a hub

use line_ledger::{Equivalent, NodeId};
use message_bus::{Bus, DropRule};
use observing_ledger::{ObservingConfig, ObservingLedger, ObservingState};
use payment_engine::{
    Checkpoint, Config, Error, FaultAction, Node, ProtocolMessage, RateInput, RecoveryEvent,
    Stage,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const EQ1: Equivalent = Equivalent::new(1);
const EQ2: Equivalent = Equivalent::new(2);
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

fn id(name: &str) -> NodeId {
    NodeId::new(name)
}

fn test_config(name: &str, dir: &TempDir) -> Config {
    let mut config = Config::for_node(name, dir.path().join(name));
    config.ledger.sweep_interval_ms = 50;
    config.hop_timeout_ms = 1_000;
    config.reservation_ttl_ms = 30_000;
    config.waiting_participants_votes_ms = 300;
    config.node_payment_recovery_attempts = 2;
    config.node_payment_recovery_time_period_ms = 100;
    config
}

struct TestNetwork {
    bus: Arc<Bus<ProtocolMessage>>,
    observing: Arc<ObservingLedger>,
    nodes: BTreeMap<String, Node>,
    _dir: TempDir,
}

impl TestNetwork {
    async fn new(names: &[&str]) -> Self {
        Self::with_config(names, |_| {}).await
    }

    async fn with_config(names: &[&str], adjust: impl Fn(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(Bus::<ProtocolMessage>::default());
        let observing = Arc::new(ObservingLedger::new(ObservingConfig {
            cnt_blocks_for_claiming: 4,
            block_interval_ms: 50,
        }));

        let mut nodes = BTreeMap::new();
        for name in names {
            let mut config = test_config(name, &dir);
            adjust(&mut config);
            let node = Node::start(config, bus.clone(), observing.clone())
                .await
                .unwrap();
            nodes.insert(name.to_string(), node);
        }

        Self {
            bus,
            observing,
            nodes,
            _dir: dir,
        }
    }

    fn node(&self, name: &str) -> &Node {
        &self.nodes[name]
    }

    /// `from` extends `amount` of trust to `to`, so `to` can pay `from`
    async fn trust(&self, from: &str, to: &str, equivalent: Equivalent, amount: i64) {
        let node = self.node(from);
        node.open_channel(&id(to)).await.unwrap();
        node.set_settlement_line(&id(to), equivalent, dec(amount))
            .await
            .unwrap();
    }

    fn balance(&self, node: &str, neighbor: &str, equivalent: Equivalent) -> Decimal {
        self.node(node)
            .line(&id(neighbor), equivalent)
            .map(|line| line.balance)
            .unwrap_or(Decimal::ZERO)
    }

    fn stage(&self, node: &str, transaction: Uuid) -> Option<Stage> {
        self.node(node)
            .transaction(transaction)
            .ok()
            .map(|view| view.stage)
    }

    /// Net position of a node over every line of one equivalent
    fn net(&self, node: &str, equivalent: Equivalent) -> Decimal {
        self.node(node)
            .list_lines()
            .unwrap()
            .into_iter()
            .filter(|line| line.equivalent == equivalent)
            .map(|line| line.balance)
            .sum()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// a -1-> b -1-> c -2-> d -2-> e with c exchanging 1 -> 2 at 0.05,
/// b charging 10 in eq 1 and d charging 3 in eq 2
async fn exchange_chain() -> TestNetwork {
    let network = TestNetwork::new(&["a", "b", "c", "d", "e"]).await;
    network.trust("b", "a", EQ1, 3000).await;
    network.trust("c", "b", EQ1, 5000).await;
    network.trust("d", "c", EQ2, 250).await;
    network.trust("e", "d", EQ2, 500).await;

    network.node("b").set_commission(EQ1, dec(10)).unwrap();
    network
        .node("c")
        .set_exchange_rate(EQ1, EQ2, RateInput::Real("0.05".to_string()), None, None)
        .unwrap();
    network.node("d").set_commission(EQ2, dec(3)).unwrap();
    network
}

/// a pays d over two disjoint first hops meeting at hub h
async fn diamond(hub_commission: Option<i64>) -> TestNetwork {
    let network = TestNetwork::new(&["a", "b", "c", "h", "d"]).await;
    network.trust("b", "a", EQ1, 60).await;
    network.trust("c", "a", EQ1, 60).await;
    network.trust("h", "b", EQ1, 100).await;
    network.trust("h", "c", EQ1, 100).await;
    network.trust("d", "h", EQ1, 200).await;
    if let Some(commission) = hub_commission {
        network.node("h").set_commission(EQ1, dec(commission)).unwrap();
    }
    network
}

#[tokio::test]
async fn test_direct_payment_and_payback() {
    let network = TestNetwork::new(&["a", "b"]).await;
    network.trust("b", "a", EQ1, 1000).await;

    let a = network.node("a");
    let b = network.node("b");

    a.create_transaction(&id("b"), EQ1, dec(600)).await.unwrap();
    assert_eq!(a.check_max_flow(&id("b"), EQ1).await.unwrap(), dec(400));
    assert_eq!(network.balance("a", "b", EQ1), dec(-600));
    assert_eq!(network.balance("b", "a", EQ1), dec(600));

    b.create_transaction(&id("a"), EQ1, dec(600)).await.unwrap();
    assert_eq!(a.check_max_flow(&id("b"), EQ1).await.unwrap(), dec(1000));
    assert_eq!(network.balance("a", "b", EQ1), Decimal::ZERO);
}

#[tokio::test]
async fn test_rate_reported_in_both_forms() {
    let network = TestNetwork::new(&["x"]).await;
    let x = network.node("x");

    x.set_exchange_rate(EQ1, EQ2, RateInput::Native { value: 11207154, shift: 4 }, None, None)
        .unwrap();
    let rate = x.get_exchange_rate(EQ1, EQ2).unwrap();
    assert_eq!(rate.real(), "112071.54");

    x.set_exchange_rate(EQ2, EQ1, RateInput::Real("112071.54".to_string()), None, None)
        .unwrap();
    let rate = x.get_exchange_rate(EQ2, EQ1).unwrap();
    assert_eq!((rate.native.value(), rate.native.shift()), (11207154, 4));

    assert_eq!(x.list_exchange_rates().unwrap().len(), 2);
    x.clear_exchange_rates().unwrap();
    assert!(matches!(x.get_exchange_rate(EQ1, EQ2), Err(Error::NotFound(_))));

    x.set_expiring_exchange_rate(
        EQ1,
        EQ2,
        RateInput::Real("0.05".to_string()),
        None,
        None,
        Some(Duration::from_millis(50)),
    )
    .unwrap();
    assert_eq!(x.get_exchange_rate(EQ1, EQ2).unwrap().real(), "0.05");
    sleep(Duration::from_millis(100)).await;
    assert!(matches!(x.get_exchange_rate(EQ1, EQ2), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_invalid_rates_rejected_before_any_change() {
    let network = TestNetwork::new(&["x"]).await;
    let x = network.node("x");

    let too_precise = RateInput::Real("0.12345678901234567".to_string());
    assert!(matches!(
        x.set_exchange_rate(EQ1, EQ2, too_precise, None, None),
        Err(Error::Validation(_))
    ));
    let shift = RateInput::Native { value: 1, shift: 40_000 };
    assert!(matches!(
        x.set_exchange_rate(EQ1, EQ2, shift, None, None),
        Err(Error::Validation(_))
    ));
    let negative = RateInput::Native { value: -5, shift: 6 };
    assert!(matches!(
        x.set_exchange_rate(EQ1, EQ2, negative, None, None),
        Err(Error::Validation(_))
    ));
    assert!(x.list_exchange_rates().unwrap().is_empty());
}

#[tokio::test]
async fn test_exchange_chain_deducts_2070() {
    let network = exchange_chain().await;
    let a = network.node("a");

    let estimate = a
        .estimate_payment_for_receive_amount(&id("e"), EQ1, EQ2, dec(100), None)
        .await
        .unwrap();
    assert_eq!(estimate, dec(2070));

    let transaction = a
        .create_exchange_transaction(&id("e"), EQ1, dec(100), EQ2, None)
        .await
        .unwrap();

    assert_eq!(network.balance("a", "b", EQ1), dec(-2070));
    assert_eq!(network.balance("c", "b", EQ1), dec(2060));
    assert_eq!(network.balance("c", "d", EQ2), dec(-103));
    assert_eq!(network.balance("e", "d", EQ2), dec(100));

    // Intermediates keep exactly their commission
    assert_eq!(network.net("b", EQ1), dec(10));
    assert_eq!(network.net("d", EQ2), dec(3));

    let view = a.transaction(transaction).unwrap();
    assert_eq!(view.stage, Stage::Committed);
    assert_eq!(view.paid, Some(dec(2070)));
    assert_eq!(view.delivered, Some(dec(100)));
    for node in ["b", "c", "d", "e"] {
        assert_eq!(network.stage(node, transaction), Some(Stage::Committed));
    }
}

#[tokio::test]
async fn test_exchange_max_flow_and_receive_estimate() {
    let network = exchange_chain().await;
    let a = network.node("a");

    let flow = a.check_exchange_max_flow(&id("e"), EQ1, EQ2).await.unwrap();
    assert_eq!(flow.receive, Decimal::new(14650, 2));
    assert_eq!(flow.pay, dec(3000));

    let received = a
        .estimate_receive_for_payment_amount(&id("e"), EQ1, EQ2, dec(2070))
        .await
        .unwrap();
    assert_eq!(received, dec(100));
}

#[tokio::test]
async fn test_estimates_beyond_route_capacity_fail() {
    let network = exchange_chain().await;
    let a = network.node("a");

    let err = a
        .estimate_receive_for_payment_amount(&id("e"), EQ1, EQ2, dec(10000))
        .await
        .unwrap_err();
    match err {
        Error::InsufficientFunds { requested, available } => {
            assert_eq!(requested, dec(10000));
            assert_eq!(available, dec(3000));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let received = a
        .estimate_receive_for_payment_amount(&id("e"), EQ1, EQ2, dec(3000))
        .await
        .unwrap();
    assert_eq!(received, Decimal::new(14650, 2));

    let err = a
        .estimate_payment_for_receive_amount(&id("e"), EQ1, EQ2, dec(500), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));

    let err = a
        .estimate_payment_for_receive_amount(&id("e"), EQ1, EQ2, dec(140), Some(dec(2070)))
        .await
        .unwrap_err();
    match err {
        Error::MoreThanMaxAllowableAmount { required, maximum } => {
            assert!(required > dec(2070));
            assert_eq!(maximum, dec(2070));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_max_allowable_amount_enforced() {
    let network = exchange_chain().await;
    let a = network.node("a");

    let err = a
        .create_exchange_transaction(&id("e"), EQ1, dec(100), EQ2, Some(dec(2000)))
        .await
        .unwrap_err();
    match err {
        Error::MoreThanMaxAllowableAmount { required, maximum } => {
            assert_eq!(required, dec(2070));
            assert_eq!(maximum, dec(2000));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(network.balance("a", "b", EQ1), Decimal::ZERO);

    let err = a
        .estimate_payment_for_receive_amount(&id("e"), EQ1, EQ2, dec(100), Some(dec(2000)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MoreThanMaxAllowableAmount { .. }));

    a.create_exchange_transaction(&id("e"), EQ1, dec(100), EQ2, Some(dec(2070)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_commission_charged_once_across_paths() {
    let network = diamond(Some(1)).await;
    let a = network.node("a");

    assert_eq!(a.check_max_flow(&id("d"), EQ1).await.unwrap(), dec(119));

    let transaction = a.create_transaction(&id("d"), EQ1, dec(119)).await.unwrap();
    let view = a.transaction(transaction).unwrap();
    assert_eq!(view.paths, 2);
    assert_eq!(view.paid, Some(dec(120)));

    assert_eq!(network.net("h", EQ1), dec(1));
    assert_eq!(network.net("b", EQ1), Decimal::ZERO);
    assert_eq!(network.net("c", EQ1), Decimal::ZERO);
    assert_eq!(network.net("d", EQ1), dec(119));
    assert_eq!(network.net("a", EQ1), dec(-120));
}

#[tokio::test]
async fn test_balances_sum_to_zero() {
    let network = diamond(Some(1)).await;
    network
        .node("a")
        .create_transaction(&id("d"), EQ1, dec(70))
        .await
        .unwrap();

    let total: Decimal = ["a", "b", "c", "h", "d"]
        .iter()
        .map(|node| network.net(node, EQ1))
        .sum();
    assert_eq!(total, Decimal::ZERO);
    assert_eq!(network.net("h", EQ1), dec(1));
    for node in ["a", "b", "c", "h", "d"] {
        assert!(network.node(node).audit_lines().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_no_routes_and_insufficient_funds() {
    let network = TestNetwork::new(&["a", "b", "z"]).await;
    network.trust("b", "a", EQ1, 1000).await;
    let a = network.node("a");

    let err = a.create_transaction(&id("z"), EQ1, dec(10)).await.unwrap_err();
    assert!(matches!(err, Error::NoPaymentRoutes(_)));

    let err = a.create_transaction(&id("b"), EQ1, dec(1001)).await.unwrap_err();
    match err {
        Error::InsufficientFunds { requested, available } => {
            assert_eq!(requested, dec(1001));
            assert_eq!(available, dec(1000));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let err = a.create_transaction(&id("b"), EQ1, dec(0)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = a
        .create_transaction(&id("b"), EQ1, Decimal::new(1001, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_settlement_line_validation() {
    let network = TestNetwork::new(&["a", "b"]).await;
    let a = network.node("a");

    let err = a
        .set_settlement_line(&id("b"), EQ1, dec(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    a.open_channel(&id("b")).await.unwrap();
    let err = a
        .set_settlement_line(&id("b"), EQ1, dec(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let view = a.set_settlement_line(&id("b"), EQ1, dec(100)).await.unwrap();
    assert_eq!(view.outgoing_trust, dec(100));
    let peer = network.node("b").line(&id("a"), EQ1).unwrap();
    assert_eq!(peer.incoming_trust, dec(100));
    assert_eq!(peer.available_outgoing, dec(100));
}

#[tokio::test]
async fn test_lost_reservation_replanned_on_other_path() {
    let network = diamond(None).await;
    network.bus.add_rule(
        DropRule::any()
            .from("a")
            .to("b")
            .kind("AskReserve")
            .times(1),
    );

    let transaction = network
        .node("a")
        .create_transaction(&id("d"), EQ1, dec(50))
        .await
        .unwrap();

    assert_eq!(network.balance("a", "b", EQ1), Decimal::ZERO);
    assert_eq!(network.balance("a", "c", EQ1), dec(-50));
    assert_eq!(network.balance("d", "h", EQ1), dec(50));
    assert_eq!(network.stage("b", transaction), None);
}

#[tokio::test]
async fn test_refused_vote_rejects_everywhere() {
    let network = TestNetwork::new(&["a", "b", "c"]).await;
    network.trust("b", "a", EQ1, 100).await;
    network.trust("c", "b", EQ1, 100).await;
    network
        .node("c")
        .arm_fault(Checkpoint::AfterVote, FaultAction::Exception);

    let err = network
        .node("a")
        .create_transaction(&id("c"), EQ1, dec(40))
        .await
        .unwrap_err();
    let transaction = match err {
        Error::NoConsensus { transaction, .. } => transaction,
        other => panic!("unexpected error: {:?}", other),
    };

    assert_eq!(network.stage("a", transaction), Some(Stage::Rejected));
    assert!(
        eventually(|| ["b", "c"]
            .iter()
            .all(|node| network.stage(node, transaction) == Some(Stage::Rejected)))
        .await
    );
    assert_eq!(network.observing.state(transaction), ObservingState::Rejected);

    for (node, neighbor) in [("a", "b"), ("b", "c"), ("c", "b")] {
        let line = network.node(node).line(&id(neighbor), EQ1).unwrap();
        assert_eq!(line.balance, Decimal::ZERO);
        assert_eq!(line.outgoing_reserved + line.incoming_reserved, Decimal::ZERO);
    }
    for node in ["a", "b", "c"] {
        assert!(network.node(node).audit(transaction).unwrap().consistent);
    }
}

#[tokio::test]
async fn test_lost_final_broadcast_recovered_by_polling() {
    let network = TestNetwork::new(&["a", "b", "c"]).await;
    network.trust("b", "a", EQ1, 100).await;
    network.trust("c", "b", EQ1, 100).await;
    network
        .node("a")
        .arm_fault(Checkpoint::BeforeVoteConsistency, FaultAction::LoseMessage);

    let err = network
        .node("a")
        .create_transaction(&id("c"), EQ1, dec(40))
        .await
        .unwrap_err();
    let transaction = match err {
        Error::Protocol { transaction, .. } => transaction,
        other => panic!("unexpected error: {:?}", other),
    };
    assert_eq!(network.stage("a", transaction), Some(Stage::Committed));

    assert!(
        eventually(|| ["b", "c"].iter().all(|node| network
            .stage(node, transaction)
            .map_or(false, |stage| stage.is_applied())))
        .await
    );
    assert_eq!(network.balance("c", "b", EQ1), dec(40));
    assert_eq!(network.net("b", EQ1), Decimal::ZERO);

    let log = network.node("c").recovery_log(Some(transaction)).unwrap();
    assert!(log
        .iter()
        .any(|entry| entry.event == RecoveryEvent::RecoveryStarted));
    for node in ["a", "b", "c"] {
        assert!(network.node(node).audit(transaction).unwrap().consistent);
    }
}

#[tokio::test]
async fn test_isolated_participant_follows_observing_ledger() {
    let network = TestNetwork::new(&["a", "b", "c"]).await;
    network.trust("b", "a", EQ1, 100).await;
    network.trust("c", "b", EQ1, 100).await;

    // c never hears the outcome and nobody answers its polls
    network
        .bus
        .add_rule(DropRule::any().to("c").kind("VoteConsistency"));
    network.bus.add_rule(DropRule::any().from("c").kind("Status"));

    let err = network
        .node("a")
        .create_transaction(&id("c"), EQ1, dec(25))
        .await
        .unwrap_err();
    let transaction = err.transaction().unwrap();

    // The coordinator claimed when the broadcast failed
    assert!(network.observing.state(transaction).is_accepted());
    assert_eq!(
        network.node("c").observing_state(transaction),
        network.observing.state(transaction)
    );
    assert!(
        eventually(|| network.stage("c", transaction) == Some(Stage::Claimed)).await,
        "receiver did not converge: {:?}",
        network.stage("c", transaction)
    );
    assert_eq!(network.balance("c", "b", EQ1), dec(25));
    assert!(network
        .stage("b", transaction)
        .map_or(false, |stage| stage.is_applied()));
}

#[tokio::test]
async fn test_coordinator_killed_after_votes_converges_on_restart() {
    let network = TestNetwork::new(&["a", "b", "c"]).await;
    network.trust("b", "a", EQ1, 100).await;
    network.trust("c", "b", EQ1, 100).await;

    let a = network.node("a");
    a.arm_fault(Checkpoint::AfterVotesCollected, FaultAction::Terminate);
    let err = a.create_transaction(&id("c"), EQ1, dec(30)).await.unwrap_err();
    assert!(matches!(err, Error::Terminated));

    a.wait_stopped().await;
    assert!(!a.is_running());
    a.restart().await.unwrap();
    assert!(a.is_running());

    let transaction = a.transactions().unwrap()[0].transaction;
    assert!(
        eventually(|| ["a", "b", "c"].iter().all(|node| network
            .stage(node, transaction)
            .map_or(false, |stage| stage.is_applied())))
        .await
    );

    assert_eq!(network.balance("a", "b", EQ1), dec(-30));
    assert_eq!(network.balance("c", "b", EQ1), dec(30));
    for node in ["a", "b", "c"] {
        assert!(network.node(node).audit(transaction).unwrap().consistent);
    }
}

#[tokio::test]
async fn test_participant_killed_before_vote_is_rejected() {
    let network = TestNetwork::new(&["a", "b", "c"]).await;
    network.trust("b", "a", EQ1, 100).await;
    network.trust("c", "b", EQ1, 100).await;

    let c = network.node("c");
    c.arm_fault(Checkpoint::BeforeVote, FaultAction::Terminate);
    let err = network
        .node("a")
        .create_transaction(&id("c"), EQ1, dec(30))
        .await
        .unwrap_err();
    let transaction = err.transaction().unwrap();
    assert!(matches!(err, Error::NoConsensus { .. }));

    c.wait_stopped().await;
    c.restart().await.unwrap();
    assert!(eventually(|| network.stage("c", transaction) == Some(Stage::Rejected)).await);

    let line = c.line(&id("b"), EQ1).unwrap();
    assert_eq!(line.incoming_reserved, Decimal::ZERO);
    assert_eq!(line.balance, Decimal::ZERO);
    assert!(eventually(|| network.stage("b", transaction) == Some(Stage::Rejected)).await);
}

#[tokio::test]
async fn test_expired_reservation_restores_capacity() {
    let network = TestNetwork::with_config(&["a", "b"], |config| {
        config.reservation_ttl_ms = 400;
    })
    .await;
    network.trust("b", "a", EQ1, 100).await;

    // b holds the amount but its approval, and every cleanup notice, is lost
    network
        .node("b")
        .arm_fault(Checkpoint::AfterReserve, FaultAction::LoseMessage);
    network
        .bus
        .add_rule(DropRule::any().to("b").kind("ReleasePath"));
    network.bus.add_rule(DropRule::any().to("b").kind("Reject"));

    let err = network
        .node("a")
        .create_transaction(&id("b"), EQ1, dec(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(
        network.node("b").line(&id("a"), EQ1).unwrap().incoming_reserved,
        dec(100)
    );

    assert!(
        eventually(|| network
            .node("b")
            .line(&id("a"), EQ1)
            .map_or(false, |line| line.incoming_reserved.is_zero()))
        .await
    );
    network.bus.clear_rules();

    assert_eq!(
        network.node("a").check_max_flow(&id("b"), EQ1).await.unwrap(),
        dec(100)
    );
    network
        .node("a")
        .create_transaction(&id("b"), EQ1, dec(100))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_payments_through_hub() {
    const PAIRS: usize = 8;

    let mut names = vec!["hub".to_string()];
    for i in 0..PAIRS {
        names.push(format!("s{}", i));
        names.push(format!("r{}", i));
    }
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let network = TestNetwork::new(&refs).await;

    for i in 0..PAIRS {
        network.trust("hub", &format!("s{}", i), EQ1, 100).await;
        network.trust(&format!("r{}", i), "hub", EQ1, 100).await;
    }

    let payments = (0..PAIRS).map(|i| {
        let sender = network.node(&format!("s{}", i));
        let receiver = id(&format!("r{}", i));
        async move { sender.create_transaction(&receiver, EQ1, dec(10)).await }
    });
    let results = futures::future::join_all(payments).await;
    for result in &results {
        assert!(result.is_ok(), "payment failed: {:?}", result);
    }

    assert_eq!(network.net("hub", EQ1), Decimal::ZERO);
    for i in 0..PAIRS {
        assert_eq!(network.net(&format!("r{}", i), EQ1), dec(10));
        assert_eq!(network.net(&format!("s{}", i), EQ1), dec(-10));
    }
}

#[tokio::test]
async fn test_restart_keeps_lines_rates_and_history() {
    let network = TestNetwork::new(&["a", "b"]).await;
    network.trust("b", "a", EQ1, 500).await;
    let a = network.node("a");
    a.set_commission(EQ2, dec(2)).unwrap();
    let transaction = a.create_transaction(&id("b"), EQ1, dec(200)).await.unwrap();

    a.terminate().await;
    assert!(matches!(a.list_lines(), Err(Error::Terminated)));
    a.restart().await.unwrap();

    assert_eq!(network.balance("a", "b", EQ1), dec(-200));
    assert_eq!(a.list_commissions().unwrap().len(), 1);
    assert_eq!(a.transaction(transaction).unwrap().stage, Stage::Committed);
    assert!(!a.recovery_log(Some(transaction)).unwrap().is_empty());

    a.clear_route_cache().unwrap();
    assert_eq!(a.check_max_flow(&id("b"), EQ1).await.unwrap(), dec(300));
}

#[tokio::test]
async fn test_settled_transactions_leave_memory_but_stay_queryable() {
    let network = TestNetwork::new(&["a", "b"]).await;
    network.trust("b", "a", EQ1, 100).await;

    let transaction = network
        .node("a")
        .create_transaction(&id("b"), EQ1, dec(40))
        .await
        .unwrap();

    for name in ["a", "b"] {
        let node = network.node(name);
        assert!(
            eventually(|| node.resident_transactions().unwrap() == 0).await,
            "{} still holds settled records",
            name
        );
        assert_eq!(node.transaction(transaction).unwrap().stage, Stage::Committed);
        assert_eq!(node.transactions().unwrap().len(), 1);
    }

    assert_eq!(network.stage("b", transaction), Some(Stage::Committed));
    assert_eq!(network.balance("b", "a", EQ1), dec(40));
}
