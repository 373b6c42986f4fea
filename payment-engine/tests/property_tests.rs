//! Property-based tests for payment planning
//!
//! Randomized diamond topologies: the sender reaches a hub over several
//! first hops, the hub reaches the receiver over one line and may charge
//! a commission.

use exchange_engine::ExchangeTable;
use line_ledger::{Equivalent, NodeId, Precision};
use payment_engine::routing::{cost, delivered, LineCapacity, NodeInfo, Planner, Topology};
use payment_engine::Route;
use proptest::prelude::*;
use rust_decimal::Decimal;

const EQ: Equivalent = Equivalent::new(1);

fn line(neighbor: &str, available: u32) -> LineCapacity {
    LineCapacity {
        neighbor: NodeId::new(neighbor),
        equivalent: EQ,
        available: Decimal::from(available),
    }
}

fn node(id: &str, lines: Vec<LineCapacity>, table: &ExchangeTable) -> NodeInfo {
    NodeInfo {
        node: NodeId::new(id),
        lines,
        exchange: table.snapshot(),
    }
}

fn diamond(first_hops: &[u32], hub_line: u32, commission: u32) -> (Topology, Vec<Route>) {
    let plain = ExchangeTable::in_memory();
    let hub = ExchangeTable::in_memory();
    if commission > 0 {
        hub.set_commission(EQ, Decimal::from(commission)).unwrap();
    }

    let mut topology = Topology::new();
    let mut routes = Vec::new();
    let mut sender_lines = Vec::new();
    for (i, capacity) in first_hops.iter().enumerate() {
        let relay = format!("r{}", i);
        sender_lines.push(line(&relay, *capacity));
        topology.insert(node(&relay, vec![line("hub", 1_000)], &plain));
        routes.push(Route {
            nodes: vec![
                NodeId::new("sender"),
                NodeId::new(relay.as_str()),
                NodeId::new("hub"),
                NodeId::new("receiver"),
            ],
            edges: vec![EQ, EQ, EQ],
        });
    }
    topology.insert(node("sender", sender_lines, &plain));
    topology.insert(node("hub", vec![line("receiver", hub_line)], &hub));
    (topology, routes)
}

proptest! {
    #[test]
    fn test_allocation_never_exceeds_target(
        first_hops in prop::collection::vec(1u32..500, 1..5),
        hub_line in 1u32..2_000,
        commission in 0u32..20,
        target in 1u32..3_000,
    ) {
        let (topology, routes) = diamond(&first_hops, hub_line, commission);
        let precision = Precision::new(2);
        let target = Decimal::from(target);

        let plans = Planner::new(&topology, &precision).allocate(&routes, target);
        let flow = Planner::new(&topology, &precision).max_flow(&routes);

        prop_assert!(delivered(&plans) <= target);
        prop_assert!(delivered(&plans) <= delivered(&flow));
    }

    #[test]
    fn test_sender_pays_at_least_delivered(
        first_hops in prop::collection::vec(1u32..500, 1..5),
        hub_line in 1u32..2_000,
        commission in 0u32..20,
    ) {
        let (topology, routes) = diamond(&first_hops, hub_line, commission);
        let precision = Precision::new(2);

        let plans = Planner::new(&topology, &precision).max_flow(&routes);
        prop_assert!(cost(&plans) >= delivered(&plans));
        if !plans.is_empty() && commission > 0 {
            prop_assert_eq!(cost(&plans) - delivered(&plans), Decimal::from(commission));
        }
    }

    #[test]
    fn test_path_amounts_never_grow(
        first_hops in prop::collection::vec(1u32..500, 1..5),
        hub_line in 1u32..2_000,
        commission in 0u32..20,
    ) {
        let (topology, routes) = diamond(&first_hops, hub_line, commission);
        let precision = Precision::new(2);

        for plan in Planner::new(&topology, &precision).max_flow(&routes) {
            prop_assert!(plan.deliver() > Decimal::ZERO);
            for pair in plan.amounts.windows(2) {
                prop_assert!(pair[0] >= pair[1]);
            }
        }
    }

    #[test]
    fn test_max_flow_bounded_by_cuts(
        first_hops in prop::collection::vec(1u32..500, 1..5),
        hub_line in 1u32..2_000,
        commission in 0u32..20,
    ) {
        let (topology, routes) = diamond(&first_hops, hub_line, commission);
        let precision = Precision::new(2);

        let plans = Planner::new(&topology, &precision).max_flow(&routes);
        let sender_cut: u32 = first_hops.iter().sum();
        prop_assert!(cost(&plans) <= Decimal::from(sender_cut));
        prop_assert!(delivered(&plans) <= Decimal::from(hub_line));
    }
}
