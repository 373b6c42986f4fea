//! Greedy path-by-path flow over residual capacities
//!
//! Each route is filled as far as its bottleneck allows before the next
//! one is considered. A node charges its commission on the first route
//! carrying flow through it; later routes through the same node pass the
//! amount through unchanged. Capacities are clamped by exchange bounds, and
//! per-edge amounts are then recomputed backwards from the delivered amount
//! exactly the way the reserving nodes will compute them.

use super::Topology;
use crate::types::Route;
use exchange_engine::{capacity_through, required_incoming};
use line_ledger::{Equivalent, NodeId, Precision};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Flow assigned to one route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPlan {
    /// Route
    pub route: Route,
    /// Amount on every edge
    pub amounts: Vec<Decimal>,
    /// Commission designation per route position
    pub charging: Vec<bool>,
}

impl PathPlan {
    /// Amount delivered to the receiver
    pub fn deliver(&self) -> Decimal {
        self.amounts.last().copied().unwrap_or(Decimal::ZERO)
    }

    /// Amount paid by the coordinator
    pub fn cost(&self) -> Decimal {
        self.amounts.first().copied().unwrap_or(Decimal::ZERO)
    }
}

/// Total delivered by several plans
pub fn delivered(plans: &[PathPlan]) -> Decimal {
    plans.iter().map(PathPlan::deliver).sum()
}

/// Total paid for several plans
pub fn cost(plans: &[PathPlan]) -> Decimal {
    plans.iter().map(PathPlan::cost).sum()
}

type EdgeKey = (NodeId, NodeId, Equivalent);

/// Greedy flow planner
#[derive(Debug)]
pub struct Planner<'a> {
    topology: &'a Topology,
    precision: &'a Precision,
    residual: HashMap<EdgeKey, Decimal>,
    charged: HashSet<NodeId>,
}

impl<'a> Planner<'a> {
    /// Planner over fresh capacities
    pub fn new(topology: &'a Topology, precision: &'a Precision) -> Self {
        Self {
            topology,
            precision,
            residual: HashMap::new(),
            charged: HashSet::new(),
        }
    }

    /// Treat these nodes as having charged already
    pub fn with_charged(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.charged.extend(nodes);
        self
    }

    fn residual(&self, from: &NodeId, to: &NodeId, equivalent: Equivalent) -> Decimal {
        self.residual
            .get(&(from.clone(), to.clone(), equivalent))
            .copied()
            .unwrap_or_else(|| self.topology.capacity(from, to, equivalent))
    }

    /// Which positions of a route would charge their commission
    pub fn designation(&self, route: &Route) -> Vec<bool> {
        let last = route.nodes.len().saturating_sub(1);
        route
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| i > 0 && i < last && !self.charged.contains(node))
            .collect()
    }

    /// Largest amount the route can deliver
    pub fn path_capacity(&self, route: &Route) -> Decimal {
        if route.is_empty() {
            return Decimal::ZERO;
        }
        let charging = self.designation(route);

        let mut flow = self.residual(&route.nodes[0], &route.nodes[1], route.edges[0]);
        for i in 1..route.edges.len() {
            let Some(exchange) = self.topology.exchange(&route.nodes[i]) else {
                return Decimal::ZERO;
            };
            let through = capacity_through(
                exchange,
                self.precision,
                route.edges[i - 1],
                route.edges[i],
                flow,
                charging[i],
            );
            flow = through.min(self.residual(&route.nodes[i], &route.nodes[i + 1], route.edges[i]));
        }
        flow.max(Decimal::ZERO)
    }

    /// Per-edge amounts needed to deliver `deliver`
    pub fn amounts_for(
        &self,
        route: &Route,
        charging: &[bool],
        deliver: Decimal,
    ) -> exchange_engine::Result<Vec<Decimal>> {
        let mut amounts = vec![Decimal::ZERO; route.edges.len()];
        let Some(last) = amounts.last_mut() else {
            return Ok(amounts);
        };
        *last = deliver;

        for i in (1..route.edges.len()).rev() {
            let exchange = self.topology.exchange(&route.nodes[i]).ok_or_else(|| {
                exchange_engine::Error::Unusable(format!("no exchange table for {}", route.nodes[i]))
            })?;
            let hop = required_incoming(
                exchange,
                self.precision,
                route.edges[i - 1],
                route.edges[i],
                amounts[i],
                charging[i],
            )?;
            amounts[i - 1] = hop.incoming;
        }
        Ok(amounts)
    }

    fn feasible(
        &self,
        route: &Route,
        charging: &[bool],
        deliver: Decimal,
        budget: Option<Decimal>,
    ) -> Option<Vec<Decimal>> {
        let amounts = self.amounts_for(route, charging, deliver).ok()?;
        let within_capacity = amounts.iter().enumerate().all(|(i, amount)| {
            *amount <= self.residual(&route.nodes[i], &route.nodes[i + 1], route.edges[i])
        });
        let within_budget = budget.map_or(true, |b| amounts[0] <= b);
        (within_capacity && within_budget).then_some(amounts)
    }

    /// Largest feasible delivery not above `upper`, in receiver precision units
    fn largest_feasible(
        &self,
        route: &Route,
        charging: &[bool],
        upper: Decimal,
        budget: Option<Decimal>,
    ) -> Option<(Decimal, Vec<Decimal>)> {
        let equivalent = *route.edges.last()?;
        let upper = self.precision.round_down(equivalent, upper);
        if upper <= Decimal::ZERO {
            return None;
        }
        if let Some(amounts) = self.feasible(route, charging, upper, budget) {
            return Some((upper, amounts));
        }

        let unit = Decimal::new(1, self.precision.scale(equivalent));
        let (mut low, mut high) = (Decimal::ZERO, upper);
        let mut best = None;
        while high - low > unit {
            let middle = self
                .precision
                .round_down(equivalent, (low + high) / Decimal::TWO);
            match self.feasible(route, charging, middle, budget) {
                Some(amounts) => {
                    low = middle;
                    best = Some((middle, amounts));
                }
                None => high = middle,
            }
        }
        best
    }

    fn commit(&mut self, route: &Route, charging: Vec<bool>, amounts: Vec<Decimal>) -> PathPlan {
        for (i, amount) in amounts.iter().enumerate() {
            let key = (route.nodes[i].clone(), route.nodes[i + 1].clone(), route.edges[i]);
            let left = self.residual(&key.0, &key.1, key.2) - *amount;
            self.residual.insert(key, left);
        }
        for (node, charges) in route.nodes.iter().zip(&charging) {
            if *charges {
                self.charged.insert(node.clone());
            }
        }
        PathPlan {
            route: route.clone(),
            amounts,
            charging,
        }
    }

    /// Assign up to `deliver` to a route
    pub fn take(&mut self, route: &Route, deliver: Decimal) -> Option<PathPlan> {
        self.take_within(route, deliver, None)
    }

    fn take_within(
        &mut self,
        route: &Route,
        deliver: Decimal,
        budget: Option<Decimal>,
    ) -> Option<PathPlan> {
        let charging = self.designation(route);
        let (_, amounts) = self.largest_feasible(route, &charging, deliver, budget)?;
        Some(self.commit(route, charging, amounts))
    }

    /// Fill every route to its bottleneck
    pub fn max_flow(&mut self, routes: &[Route]) -> Vec<PathPlan> {
        let mut plans = Vec::new();
        for route in routes {
            let capacity = self.path_capacity(route);
            if capacity <= Decimal::ZERO {
                continue;
            }
            if let Some(plan) = self.take(route, capacity) {
                plans.push(plan);
            }
        }
        plans
    }

    /// Fill routes until `target` is delivered
    pub fn allocate(&mut self, routes: &[Route], target: Decimal) -> Vec<PathPlan> {
        let mut remaining = target;
        let mut plans = Vec::new();
        for route in routes {
            if remaining <= Decimal::ZERO {
                break;
            }
            let capacity = self.path_capacity(route);
            if capacity <= Decimal::ZERO {
                continue;
            }
            if let Some(plan) = self.take(route, capacity.min(remaining)) {
                remaining -= plan.deliver();
                plans.push(plan);
            }
        }
        plans
    }

    /// Fill routes while the coordinator's cost stays within `budget`
    pub fn spend(&mut self, routes: &[Route], budget: Decimal) -> Vec<PathPlan> {
        let mut remaining = budget;
        let mut plans = Vec::new();
        for route in routes {
            if remaining <= Decimal::ZERO {
                break;
            }
            let capacity = self.path_capacity(route);
            if capacity <= Decimal::ZERO {
                continue;
            }
            if let Some(plan) = self.take_within(route, capacity, Some(remaining)) {
                remaining -= plan.cost();
                plans.push(plan);
            }
        }
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{LineCapacity, NodeInfo};
    use exchange_engine::{ExchangeRate, ExchangeTable, NativeRate};
    use std::sync::Arc;

    const EQ1: Equivalent = Equivalent::new(1);
    const EQ2: Equivalent = Equivalent::new(2);

    fn route(nodes: &[&str], edges: &[Equivalent]) -> Route {
        Route {
            nodes: nodes.iter().map(|n| NodeId::new(*n)).collect(),
            edges: edges.to_vec(),
        }
    }

    fn add(topology: &mut Topology, id: &str, lines: &[(&str, Equivalent, i64)], table: &ExchangeTable) {
        topology.insert(NodeInfo {
            node: NodeId::new(id),
            lines: lines
                .iter()
                .map(|(n, eq, cap)| LineCapacity {
                    neighbor: NodeId::new(*n),
                    equivalent: *eq,
                    available: Decimal::from(*cap),
                })
                .collect(),
            exchange: table.snapshot(),
        });
    }

    fn chain_with_exchange() -> Topology {
        // a -1-> b -1-> c -2-> d -2-> e, c exchanges at 0.05, b and d charge
        let plain = ExchangeTable::in_memory();
        let b = ExchangeTable::in_memory();
        b.set_commission(EQ1, Decimal::from(10)).unwrap();
        let c = ExchangeTable::in_memory();
        c.set_rate(ExchangeRate::new(EQ1, EQ2, NativeRate::parse("0.05").unwrap()))
            .unwrap();
        let d = ExchangeTable::in_memory();
        d.set_commission(EQ2, Decimal::from(3)).unwrap();

        let mut topology = Topology::new();
        add(&mut topology, "a", &[("b", EQ1, 3000)], &plain);
        add(&mut topology, "b", &[("c", EQ1, 5000)], &b);
        add(&mut topology, "c", &[("d", EQ2, 250)], &c);
        add(&mut topology, "d", &[("e", EQ2, 500)], &d);
        topology
    }

    #[test]
    fn test_exchange_chain_amounts() {
        let topology = chain_with_exchange();
        let precision = Precision::new(2);
        let planner = Planner::new(&topology, &precision);
        let r = route(&["a", "b", "c", "d", "e"], &[EQ1, EQ1, EQ2, EQ2]);

        let charging = planner.designation(&r);
        assert_eq!(charging, vec![false, true, true, true, false]);
        let amounts = planner.amounts_for(&r, &charging, Decimal::from(100)).unwrap();
        assert_eq!(
            amounts,
            vec![
                Decimal::from(2070),
                Decimal::from(2060),
                Decimal::from(103),
                Decimal::from(100)
            ]
        );
    }

    #[test]
    fn test_path_capacity_respects_conversion() {
        let topology = chain_with_exchange();
        let precision = Precision::new(2);
        let planner = Planner::new(&topology, &precision);
        let r = route(&["a", "b", "c", "d", "e"], &[EQ1, EQ1, EQ2, EQ2]);

        // 3000 - 10 = 2990 at c buys 149.5, minus 3 at d
        assert_eq!(planner.path_capacity(&r), Decimal::new(14650, 2));
    }

    fn two_paths() -> Topology {
        let plain = ExchangeTable::in_memory();
        let hub = ExchangeTable::in_memory();
        hub.set_commission(EQ1, Decimal::from(1)).unwrap();

        let mut topology = Topology::new();
        add(&mut topology, "a", &[("b", EQ1, 60), ("c", EQ1, 60)], &plain);
        add(&mut topology, "b", &[("h", EQ1, 100)], &plain);
        add(&mut topology, "c", &[("h", EQ1, 100)], &plain);
        add(&mut topology, "h", &[("d", EQ1, 200)], &hub);
        topology
    }

    #[test]
    fn test_commission_charged_once_across_paths() {
        let topology = two_paths();
        let precision = Precision::new(2);
        let mut planner = Planner::new(&topology, &precision);
        let routes = vec![
            route(&["a", "b", "h", "d"], &[EQ1, EQ1, EQ1]),
            route(&["a", "c", "h", "d"], &[EQ1, EQ1, EQ1]),
        ];

        let plans = planner.max_flow(&routes);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].deliver(), Decimal::from(59));
        assert_eq!(plans[1].deliver(), Decimal::from(60));
        assert_eq!(cost(&plans), Decimal::from(120));
        assert!(plans[0].charging[2]);
        assert!(!plans[1].charging[2]);
    }

    #[test]
    fn test_allocate_stops_at_target() {
        let topology = two_paths();
        let precision = Precision::new(2);
        let mut planner = Planner::new(&topology, &precision);
        let routes = vec![
            route(&["a", "b", "h", "d"], &[EQ1, EQ1, EQ1]),
            route(&["a", "c", "h", "d"], &[EQ1, EQ1, EQ1]),
        ];

        let plans = planner.allocate(&routes, Decimal::from(70));
        assert_eq!(delivered(&plans), Decimal::from(70));
        assert_eq!(plans[1].deliver(), Decimal::from(11));
        assert_eq!(cost(&plans), Decimal::from(71));
    }

    #[test]
    fn test_shared_edges_consume_residual() {
        let plain = ExchangeTable::in_memory();
        let mut topology = Topology::new();
        add(&mut topology, "a", &[("b", EQ1, 100), ("c", EQ1, 100)], &plain);
        add(&mut topology, "b", &[("h", EQ1, 100)], &plain);
        add(&mut topology, "c", &[("h", EQ1, 100)], &plain);
        add(&mut topology, "h", &[("d", EQ1, 150)], &plain);

        let precision = Precision::new(2);
        let mut planner = Planner::new(&topology, &precision);
        let routes = vec![
            route(&["a", "b", "h", "d"], &[EQ1, EQ1, EQ1]),
            route(&["a", "c", "h", "d"], &[EQ1, EQ1, EQ1]),
        ];
        assert_eq!(delivered(&planner.max_flow(&routes)), Decimal::from(150));
    }

    #[test]
    fn test_spend_within_budget() {
        let topology = chain_with_exchange();
        let precision = Precision::new(2);
        let mut planner = Planner::new(&topology, &precision);
        let routes = vec![route(&["a", "b", "c", "d", "e"], &[EQ1, EQ1, EQ2, EQ2])];

        let plans = planner.spend(&routes, Decimal::from(2070));
        assert_eq!(delivered(&plans), Decimal::from(100));
        assert_eq!(cost(&plans), Decimal::from(2070));
    }

    #[test]
    fn test_missing_capacity_yields_nothing() {
        let plain = ExchangeTable::in_memory();
        let mut topology = Topology::new();
        add(&mut topology, "a", &[("d", EQ1, 0)], &plain);
        let precision = Precision::new(2);
        let mut planner = Planner::new(&topology, &precision);
        assert!(planner.max_flow(&[route(&["a", "d"], &[EQ1])]).is_empty());
    }
}
