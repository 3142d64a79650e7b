//! Routing table mapping a node id to where it's reachable from this bus
//! (spec §4.8).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::messages::{BusId, NodeId};

/// Where a non-local node was last seen to live, as inferred from
/// `node-announcement` traffic on bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Hosted by this bus's `LocalNodeManager`.
    Local,
    /// Reachable through the parent bridge.
    Parent,
    /// Reachable through a child bridge, identified by the child's bus id.
    Child(BusId),
}

#[derive(Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<NodeId, NextHop>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&self, node_id: impl Into<NodeId>) {
        self.routes.lock().insert(node_id.into(), NextHop::Local);
    }

    pub fn set_via_parent(&self, node_id: impl Into<NodeId>) {
        self.routes.lock().insert(node_id.into(), NextHop::Parent);
    }

    pub fn set_via_child(&self, node_id: impl Into<NodeId>, child_bus_id: impl Into<BusId>) {
        self.routes.lock().insert(node_id.into(), NextHop::Child(child_bus_id.into()));
    }

    /// Drop a route, e.g. on `node-announcement{op: leave}`.
    pub fn remove(&self, node_id: &str) {
        self.routes.lock().remove(node_id);
    }

    pub fn lookup(&self, node_id: &str) -> Option<NextHop> {
        self.routes.lock().get(node_id).cloned()
    }

    /// Every node id this bus believes is reachable through `child_bus_id`,
    /// used to clear routes when a child bridge disconnects.
    pub fn nodes_via_child(&self, child_bus_id: &str) -> Vec<NodeId> {
        self.routes
            .lock()
            .iter()
            .filter_map(|(id, hop)| match hop {
                NextHop::Child(b) if b == child_bus_id => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every node id routed via the parent bridge, used the same way when
    /// the parent bridge disconnects.
    pub fn nodes_via_parent(&self) -> Vec<NodeId> {
        self.routes
            .lock()
            .iter()
            .filter_map(|(id, hop)| matches!(hop, NextHop::Parent).then(|| id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_local_parent_and_child_routes() {
        let table = RoutingTable::new();
        table.set_local("n1");
        table.set_via_parent("n2");
        table.set_via_child("n3", "bus-a");

        assert_eq!(table.lookup("n1"), Some(NextHop::Local));
        assert_eq!(table.lookup("n2"), Some(NextHop::Parent));
        assert_eq!(table.lookup("n3"), Some(NextHop::Child("bus-a".into())));
        assert_eq!(table.lookup("ghost"), None);
    }

    #[test]
    fn nodes_via_child_survives_unrelated_routes() {
        let table = RoutingTable::new();
        table.set_via_child("n1", "bus-a");
        table.set_via_child("n2", "bus-b");
        table.set_via_child("n3", "bus-a");

        let mut via_a = table.nodes_via_child("bus-a");
        via_a.sort();
        assert_eq!(via_a, vec!["n1".to_string(), "n3".to_string()]);
    }

    #[test]
    fn remove_clears_a_route() {
        let table = RoutingTable::new();
        table.set_local("n1");
        table.remove("n1");
        assert_eq!(table.lookup("n1"), None);
    }
}
