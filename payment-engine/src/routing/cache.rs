//! Cache of discovered topologies
//!
//! Entries are only dropped by [`RouteCache::clear`] or a restart. Rates and
//! commissions inside a cached topology go stale when the owning node edits
//! them; capacities are refreshed separately on every use.

use super::Topology;
use dashmap::DashMap;
use line_ledger::{Equivalent, NodeId};

/// Cache key: receiver and the equivalents a route may use
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Receiver
    pub receiver: NodeId,
    /// Sorted, deduplicated equivalents
    pub equivalents: Vec<Equivalent>,
}

impl RouteKey {
    /// Build a key, normalising the equivalent set
    pub fn new(receiver: NodeId, equivalents: impl IntoIterator<Item = Equivalent>) -> Self {
        let mut equivalents: Vec<Equivalent> = equivalents.into_iter().collect();
        equivalents.sort();
        equivalents.dedup();
        Self {
            receiver,
            equivalents,
        }
    }
}

/// Topologies per (receiver, equivalent set)
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: DashMap<RouteKey, Topology>,
}

impl RouteCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached topology
    pub fn get(&self, key: &RouteKey) -> Option<Topology> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store a topology
    pub fn insert(&self, key: RouteKey, topology: Topology) {
        self.entries.insert(key, topology);
    }

    /// Drop every entry
    pub fn clear(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        tracing::info!(dropped, "Route cache cleared");
    }

    /// Number of cached topologies
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalises_equivalents() {
        let receiver = NodeId::new("d");
        let first = RouteKey::new(receiver.clone(), [Equivalent::new(2), Equivalent::new(1)]);
        let second = RouteKey::new(
            receiver,
            [Equivalent::new(1), Equivalent::new(2), Equivalent::new(1)],
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_clear() {
        let cache = RouteCache::new();
        let key = RouteKey::new(NodeId::new("d"), [Equivalent::new(1)]);
        cache.insert(key.clone(), Topology::new());
        assert!(cache.get(&key).is_some());
        cache.clear();
        assert!(cache.is_empty());
    }
}
