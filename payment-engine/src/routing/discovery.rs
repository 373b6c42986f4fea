//! Breadth-first topology discovery over the bus

use super::{NodeInfo, Topology};
use crate::messages::ProtocolMessage;
use futures::future::join_all;
use line_ledger::{Equivalent, NodeId};
use message_bus::{Message, Transport};
use std::collections::HashSet;
use std::time::Duration;

/// Collect the reports of every node within `max_hops` of the coordinator
///
/// The receiver is never expanded: routes end there. Nodes that do not
/// answer are left out.
pub async fn discover(
    transport: &dyn Transport<ProtocolMessage>,
    local: NodeInfo,
    receiver: &NodeId,
    equivalents: &[Equivalent],
    max_hops: u32,
    timeout: Duration,
) -> Topology {
    let me = local.node.clone();
    let mut visited: HashSet<NodeId> = HashSet::from([me.clone(), receiver.clone()]);
    let mut frontier = next_frontier(&local, &mut visited);

    let mut topology = Topology::new();
    topology.insert(local);

    let mut depth = 1;
    while depth <= max_hops && !frontier.is_empty() {
        let requests = frontier.iter().map(|node| {
            let request = ProtocolMessage::Neighbors {
                equivalents: equivalents.to_vec(),
            };
            let me = &me;
            async move { (node, transport.request(me, node, request, timeout).await) }
        });

        let mut reports = Vec::new();
        for (node, response) in join_all(requests).await {
            match response {
                Ok(ProtocolMessage::NodeInfo(info)) => reports.push(info),
                Ok(other) => {
                    tracing::debug!(node = %node, kind = other.kind(), "Unexpected topology answer")
                }
                Err(e) => tracing::debug!(node = %node, error = %e, "Node left out of topology"),
            }
        }

        frontier = Vec::new();
        for info in reports {
            frontier.extend(next_frontier(&info, &mut visited));
            topology.insert(info);
        }
        depth += 1;
    }

    tracing::debug!(
        node = %me,
        receiver = %receiver,
        nodes = topology.len(),
        "Topology discovered"
    );
    topology
}

fn next_frontier(info: &NodeInfo, visited: &mut HashSet<NodeId>) -> Vec<NodeId> {
    let mut frontier = Vec::new();
    for line in &info.lines {
        if visited.insert(line.neighbor.clone()) {
            frontier.push(line.neighbor.clone());
        }
    }
    frontier
}

/// Refresh the capacities of every node of a cached topology
///
/// Exchange tables are kept as cached. Nodes that do not answer lose all
/// capacity.
pub async fn refresh_capacities(
    transport: &dyn Transport<ProtocolMessage>,
    local: NodeInfo,
    topology: &mut Topology,
    equivalents: &[Equivalent],
    timeout: Duration,
) {
    let me = local.node.clone();
    topology.set_capacities(&me, local.lines);

    let remote: Vec<NodeId> = topology.nodes().filter(|n| **n != me).cloned().collect();
    let requests = remote.iter().map(|node| {
        let request = ProtocolMessage::Capacity {
            equivalents: equivalents.to_vec(),
        };
        let me = &me;
        async move { (node, transport.request(me, node, request, timeout).await) }
    });

    for (node, response) in join_all(requests).await {
        match response {
            Ok(ProtocolMessage::Capacities(lines)) => topology.set_capacities(node, lines),
            Ok(_) | Err(_) => {
                tracing::debug!(node = %node, "Capacity refresh failed");
                topology.drain(node);
            }
        }
    }
}
