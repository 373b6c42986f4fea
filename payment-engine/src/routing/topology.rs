//! Snapshot of the network around a coordinator

use exchange_engine::ExchangeSnapshot;
use line_ledger::{Equivalent, NodeId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Outgoing capacity of one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCapacity {
    /// Downstream neighbor
    pub neighbor: NodeId,
    /// Equivalent of the line
    pub equivalent: Equivalent,
    /// What the owner can still pay the neighbor
    pub available: Decimal,
}

/// What a node reports about itself
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Reporting node
    pub node: NodeId,
    /// Lines in the requested equivalents
    pub lines: Vec<LineCapacity>,
    /// Rates and commissions at the time of the report
    pub exchange: Arc<ExchangeSnapshot>,
}

/// Known nodes, their lines and their exchange tables
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: HashMap<NodeId, NodeInfo>,
}

impl Topology {
    /// Empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn insert(&mut self, info: NodeInfo) {
        self.nodes.insert(info.node.clone(), info);
    }

    /// Report of a node
    pub fn get(&self, node: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(node)
    }

    /// Check whether a node was discovered
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    /// Number of discovered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing was discovered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Discovered nodes
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Lines of a node
    pub fn lines(&self, node: &NodeId) -> &[LineCapacity] {
        self.nodes.get(node).map_or(&[], |info| info.lines.as_slice())
    }

    /// Exchange table of a node
    pub fn exchange(&self, node: &NodeId) -> Option<&ExchangeSnapshot> {
        self.nodes.get(node).map(|info| info.exchange.as_ref())
    }

    /// Capacity of the directed edge `from -> to` in `equivalent`
    pub fn capacity(&self, from: &NodeId, to: &NodeId, equivalent: Equivalent) -> Decimal {
        self.lines(from)
            .iter()
            .find(|line| &line.neighbor == to && line.equivalent == equivalent)
            .map_or(Decimal::ZERO, |line| line.available)
    }

    /// Replace the capacities of a node, keeping its exchange table
    pub fn set_capacities(&mut self, node: &NodeId, lines: Vec<LineCapacity>) {
        if let Some(info) = self.nodes.get_mut(node) {
            info.lines = lines;
        }
    }

    /// Zero every capacity of a node that stopped answering
    pub fn drain(&mut self, node: &NodeId) {
        if let Some(info) = self.nodes.get_mut(node) {
            for line in &mut info.lines {
                line.available = Decimal::ZERO;
            }
        }
    }
}
