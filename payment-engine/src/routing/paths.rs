//! Simple paths over (node, equivalent) states
//!
//! Breadth-first, so shorter routes come first. A route may switch
//! equivalents only at a node that publishes a rate for the pair.

use super::Topology;
use crate::types::Route;
use line_ledger::{Equivalent, NodeId};
use std::collections::VecDeque;

const MAX_EXPANSIONS: usize = 100_000;

/// Parameters of a path search
#[derive(Debug, Clone)]
pub struct RouteQuery {
    /// Coordinator
    pub source: NodeId,
    /// Receiver
    pub target: NodeId,
    /// Equivalent of the first edge
    pub send_equivalent: Equivalent,
    /// Equivalent of the last edge
    pub receive_equivalent: Equivalent,
    /// Maximum intermediate nodes
    pub max_hops: u32,
    /// Maximum routes returned
    pub max_paths: usize,
}

/// Routes from source to target, shortest first
pub fn find_routes(topology: &Topology, query: &RouteQuery) -> Vec<Route> {
    let max_edges = query.max_hops as usize + 1;
    let mut routes = Vec::new();
    let mut queue = VecDeque::new();
    let mut expansions = 0;

    queue.push_back(Route {
        nodes: vec![query.source.clone()],
        edges: Vec::new(),
    });

    while let Some(partial) = queue.pop_front() {
        expansions += 1;
        if expansions > MAX_EXPANSIONS {
            tracing::warn!(
                source = %query.source,
                target = %query.target,
                "Path search stopped early"
            );
            break;
        }

        let Some(last) = partial.nodes.last() else {
            continue;
        };

        for line in topology.lines(last) {
            if partial.nodes.contains(&line.neighbor) {
                continue;
            }
            if !can_enter(topology, &partial, last, line.equivalent, query.send_equivalent) {
                continue;
            }

            let mut next = partial.clone();
            next.nodes.push(line.neighbor.clone());
            next.edges.push(line.equivalent);

            if line.neighbor == query.target {
                if line.equivalent == query.receive_equivalent {
                    routes.push(next);
                    if routes.len() >= query.max_paths {
                        return routes;
                    }
                }
            } else if next.edges.len() < max_edges && topology.contains(&line.neighbor) {
                queue.push_back(next);
            }
        }
    }

    routes
}

fn can_enter(
    topology: &Topology,
    partial: &Route,
    node: &NodeId,
    equivalent: Equivalent,
    send_equivalent: Equivalent,
) -> bool {
    match partial.edges.last() {
        None => equivalent == send_equivalent,
        Some(&incoming) if incoming == equivalent => true,
        Some(&incoming) => topology
            .exchange(node)
            .map_or(false, |exchange| exchange.rate(incoming, equivalent).is_some()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{LineCapacity, NodeInfo};
    use exchange_engine::{ExchangeRate, ExchangeTable, NativeRate};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    const EQ1: Equivalent = Equivalent::new(1);
    const EQ2: Equivalent = Equivalent::new(2);

    fn node(topology: &mut Topology, id: &str, lines: &[(&str, Equivalent)]) {
        topology.insert(NodeInfo {
            node: NodeId::new(id),
            lines: lines
                .iter()
                .map(|(n, eq)| LineCapacity {
                    neighbor: NodeId::new(*n),
                    equivalent: *eq,
                    available: Decimal::from(100),
                })
                .collect(),
            exchange: Arc::new(Default::default()),
        });
    }

    fn query(max_hops: u32) -> RouteQuery {
        RouteQuery {
            source: NodeId::new("a"),
            target: NodeId::new("d"),
            send_equivalent: EQ1,
            receive_equivalent: EQ1,
            max_hops,
            max_paths: 16,
        }
    }

    fn diamond() -> Topology {
        let mut topology = Topology::new();
        node(&mut topology, "a", &[("b", EQ1), ("c", EQ1)]);
        node(&mut topology, "b", &[("a", EQ1), ("d", EQ1), ("c", EQ1)]);
        node(&mut topology, "c", &[("a", EQ1), ("d", EQ1), ("b", EQ1)]);
        topology
    }

    #[test]
    fn test_shortest_routes_first() {
        let routes = find_routes(&diamond(), &query(5));
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[0].len(), 2);
        assert_eq!(routes[1].len(), 2);
        assert_eq!(routes[2].len(), 3);
    }

    #[test]
    fn test_hop_limit() {
        let routes = find_routes(&diamond(), &query(1));
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.intermediates().len() == 1));

        assert!(find_routes(&diamond(), &query(0)).is_empty());
    }

    #[test]
    fn test_max_paths() {
        let mut q = query(5);
        q.max_paths = 1;
        assert_eq!(find_routes(&diamond(), &q).len(), 1);
    }

    #[test]
    fn test_equivalent_switch_needs_rate() {
        let mut topology = Topology::new();
        node(&mut topology, "a", &[("b", EQ1)]);
        node(&mut topology, "b", &[("d", EQ2)]);
        let mut q = query(5);
        q.receive_equivalent = EQ2;
        assert!(find_routes(&topology, &q).is_empty());

        let table = ExchangeTable::in_memory();
        table
            .set_rate(ExchangeRate::new(EQ1, EQ2, NativeRate::parse("0.05").unwrap()))
            .unwrap();
        let mut info = topology.get(&NodeId::new("b")).unwrap().clone();
        info.exchange = table.snapshot();
        topology.insert(info);

        let routes = find_routes(&topology, &q);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].edges, vec![EQ1, EQ2]);
    }
}
