//! Dependency graph: nodes keyed by `(name, version)`, edges computed from
//! each node's resolved `lock` (spec §4.11).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use semver::{Version, VersionReq};

use crate::error::GraphError;

/// A graph node's identity: a package name at a specific resolved version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub name: String,
    pub version: Version,
}

impl NodeKey {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self { name: name.into(), version }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Everything known about one resolved node: which provider offered it,
/// the range it requires of each dependency name, and the locked version
/// actually chosen for each (the graph's edges).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub provider: String,
    pub dependencies: HashMap<String, VersionReq>,
    pub lock: HashMap<String, NodeKey>,
}

impl NodeEntry {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            dependencies: HashMap::new(),
            lock: HashMap::new(),
        }
    }
}

/// Set of resolved nodes and the edges implied by their locks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: HashMap<NodeKey, NodeEntry>,
}

/// The three buckets a structural comparison between two graphs produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDiff {
    pub added: HashSet<NodeKey>,
    pub removed: HashSet<NodeKey>,
    pub modified: HashSet<NodeKey>,
    old_topo: Vec<NodeKey>,
    new_topo: Vec<NodeKey>,
}

/// One step of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Deactivate(NodeKey),
    Activate(NodeKey),
}

/// An ordered sequence of activate/deactivate steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl GraphDiff {
    /// Turn the diff into an ordered plan: dependents deactivate before
    /// their dependencies, dependencies activate before their dependents
    /// (spec §4.11 "diff -> plan").
    pub fn sort(&self) -> Plan {
        let mut steps = Vec::new();
        for key in self.old_topo.iter().rev() {
            if self.removed.contains(key) || self.modified.contains(key) {
                steps.push(PlanStep::Deactivate(key.clone()));
            }
        }
        for key in &self.new_topo {
            if self.added.contains(key) || self.modified.contains(key) {
                steps.push(PlanStep::Activate(key.clone()));
            }
        }
        Plan { steps }
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: NodeKey, entry: NodeEntry) {
        self.nodes.insert(key, entry);
    }

    pub fn get(&self, key: &NodeKey) -> Option<&NodeEntry> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeKey, &NodeEntry)> {
        self.nodes.iter()
    }

    /// Kahn's algorithm: dependencies precede dependents. Errors with the
    /// set of nodes still owing an in-edge once the queue runs dry, i.e.
    /// the cycle.
    pub fn topo_sort(&self) -> Result<Vec<NodeKey>, GraphError> {
        let mut remaining: HashMap<&NodeKey, usize> = HashMap::new();
        let mut dependents: HashMap<&NodeKey, Vec<&NodeKey>> = HashMap::new();
        for (key, entry) in &self.nodes {
            let deps: Vec<&NodeKey> = entry.lock.values().collect();
            remaining.insert(key, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(key);
            }
        }

        let mut ready: Vec<&NodeKey> = Vec::new();
        for (&key, &count) in remaining.iter() {
            if count == 0 {
                ready.push(key);
            }
        }
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while !ready.is_empty() {
            ready.sort();
            let key: &NodeKey = ready.remove(0);
            order.push(key.clone());
            if let Some(deps) = dependents.get(key) {
                for &dependent in deps {
                    let remaining_count = remaining.get_mut(dependent).expect("dependent tracked");
                    *remaining_count -= 1;
                    if *remaining_count == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let mut cyclic: Vec<NodeKey> = Vec::new();
            for (&key, &count) in remaining.iter() {
                if count > 0 {
                    cyclic.push(key.clone());
                }
            }
            return Err(GraphError::Cycle(cyclic));
        }
        Ok(order)
    }

    /// DFS cycle detection, independent of `topo_sort` (spec calls for
    /// both algorithms explicitly).
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&NodeKey, Mark> = HashMap::new();

        fn visit<'a>(
            key: &'a NodeKey,
            nodes: &'a HashMap<NodeKey, NodeEntry>,
            marks: &mut HashMap<&'a NodeKey, Mark>,
        ) -> bool {
            match marks.get(key) {
                Some(Mark::Visiting) => return true,
                Some(Mark::Done) => return false,
                None => {}
            }
            marks.insert(key, Mark::Visiting);
            if let Some(entry) = nodes.get(key) {
                for dep in entry.lock.values() {
                    if visit(dep, nodes, marks) {
                        return true;
                    }
                }
            }
            marks.insert(key, Mark::Done);
            false
        }

        self.nodes.keys().any(|key| visit(key, &self.nodes, &mut marks))
    }

    /// Names with more than one resolved version present simultaneously.
    pub fn disputes(&self) -> Vec<String> {
        let mut by_name: HashMap<&str, HashSet<&Version>> = HashMap::new();
        for key in self.nodes.keys() {
            by_name.entry(&key.name).or_default().insert(&key.version);
        }
        let mut disputed: Vec<String> = by_name
            .into_iter()
            .filter(|(_, versions)| versions.len() > 1)
            .map(|(name, _)| name.to_string())
            .collect();
        disputed.sort();
        disputed
    }

    /// Dependency names a node requires but has no resolved lock entry
    /// for, or whose locked entry doesn't correspond to a node in this
    /// graph.
    pub fn missing_dependencies(&self) -> Vec<(NodeKey, String)> {
        let mut missing = Vec::new();
        for (key, entry) in &self.nodes {
            for dep_name in entry.dependencies.keys() {
                match entry.lock.get(dep_name) {
                    Some(locked) if self.nodes.contains_key(locked) => {}
                    _ => missing.push((key.clone(), dep_name.clone())),
                }
            }
        }
        missing.sort_by(|a, b| (a.0.to_string(), &a.1).cmp(&(b.0.to_string(), &b.1)));
        missing
    }

    /// BFS over the forward (depends-on) edges starting at `key`, not
    /// including `key` itself.
    pub fn dependencies_of(&self, key: &NodeKey) -> HashSet<NodeKey> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if let Some(entry) = self.nodes.get(key) {
            queue.extend(entry.lock.values().cloned());
        }
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                if let Some(entry) = self.nodes.get(&next) {
                    queue.extend(entry.lock.values().cloned());
                }
            }
        }
        seen
    }

    /// BFS over the inverted (depended-on-by) edges starting at `key`,
    /// not including `key` itself.
    pub fn dependents_of(&self, key: &NodeKey) -> HashSet<NodeKey> {
        let mut reverse: HashMap<&NodeKey, Vec<&NodeKey>> = HashMap::new();
        for (node, entry) in &self.nodes {
            for dep in entry.lock.values() {
                reverse.entry(dep).or_default().push(node);
            }
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if let Some(direct) = reverse.get(key) {
            queue.extend(direct.iter().map(|k| (*k).clone()));
        }
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                if let Some(direct) = reverse.get(&next) {
                    queue.extend(direct.iter().map(|k| (*k).clone()));
                }
            }
        }
        seen
    }

    /// Structural comparison against `other` (read as `self` = old graph,
    /// `other` = new graph). A node present in both with an unchanged
    /// `NodeEntry` is left out of all three buckets.
    pub fn diff(&self, other: &Self) -> Result<GraphDiff, GraphError> {
        let mut added = HashSet::new();
        let mut removed = HashSet::new();
        let mut modified = HashSet::new();

        for key in other.nodes.keys() {
            if !self.nodes.contains_key(key) {
                added.insert(key.clone());
            }
        }
        for (key, old_entry) in &self.nodes {
            match other.nodes.get(key) {
                None => {
                    removed.insert(key.clone());
                }
                Some(new_entry) if new_entry != old_entry => {
                    modified.insert(key.clone());
                }
                Some(_) => {}
            }
        }

        Ok(GraphDiff {
            added,
            removed,
            modified,
            old_topo: self.topo_sort()?,
            new_topo: other.topo_sort()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn node(name: &str, version: &str, deps: &[(&str, &str, &str)]) -> (NodeKey, NodeEntry) {
        let mut entry = NodeEntry::new("test-provider");
        for (dep_name, dep_range, dep_version) in deps {
            entry.dependencies.insert(dep_name.to_string(), VersionReq::parse(dep_range).unwrap());
            entry.lock.insert(dep_name.to_string(), NodeKey::new(*dep_name, v(dep_version)));
        }
        (NodeKey::new(name, v(version)), entry)
    }

    #[test]
    fn topo_sort_orders_dependencies_before_dependents() {
        let mut graph = DependencyGraph::new();
        let (a_key, a_entry) = node("a", "1.0.0", &[]);
        let (b_key, b_entry) = node("b", "1.0.0", &[("a", "^1.0.0", "1.0.0")]);
        graph.insert(a_key.clone(), a_entry);
        graph.insert(b_key.clone(), b_entry);

        let order = graph.topo_sort().unwrap();
        let a_pos = order.iter().position(|k| k == &a_key).unwrap();
        let b_pos = order.iter().position(|k| k == &b_key).unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn topo_sort_detects_a_cycle() {
        let mut graph = DependencyGraph::new();
        let (a_key, mut a_entry) = node("a", "1.0.0", &[]);
        let (b_key, mut b_entry) = node("b", "1.0.0", &[]);
        a_entry.lock.insert("b".into(), b_key.clone());
        b_entry.lock.insert("a".into(), a_key.clone());
        graph.insert(a_key, a_entry);
        graph.insert(b_key, b_entry);

        assert!(matches!(graph.topo_sort(), Err(GraphError::Cycle(_))));
        assert!(graph.has_cycle());
    }

    #[test]
    fn disputes_flags_names_with_more_than_one_version() {
        let mut graph = DependencyGraph::new();
        let (k1, e1) = node("p", "1.0.0", &[]);
        let (k2, e2) = node("p", "2.0.0", &[]);
        graph.insert(k1, e1);
        graph.insert(k2, e2);
        assert_eq!(graph.disputes(), vec!["p".to_string()]);
    }

    #[test]
    fn missing_dependencies_flags_an_unresolved_requirement() {
        let mut graph = DependencyGraph::new();
        let mut entry = NodeEntry::new("test-provider");
        entry.dependencies.insert("ghost".into(), VersionReq::parse("^1.0.0").unwrap());
        graph.insert(NodeKey::new("a", v("1.0.0")), entry);

        let missing = graph.missing_dependencies();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].1, "ghost");
    }

    #[test]
    fn bfs_subgraphs_both_directions() {
        let mut graph = DependencyGraph::new();
        let (a_key, a_entry) = node("a", "1.0.0", &[]);
        let (b_key, b_entry) = node("b", "1.0.0", &[("a", "^1.0.0", "1.0.0")]);
        let (c_key, c_entry) = node("c", "1.0.0", &[("b", "^1.0.0", "1.0.0")]);
        graph.insert(a_key.clone(), a_entry);
        graph.insert(b_key.clone(), b_entry);
        graph.insert(c_key.clone(), c_entry);

        assert_eq!(graph.dependencies_of(&c_key), HashSet::from([a_key.clone(), b_key.clone()]));
        assert_eq!(graph.dependents_of(&a_key), HashSet::from([b_key, c_key]));
    }

    #[test]
    fn diff_and_sort_reproduces_the_spec_reconcile_scenario() {
        // Old: a@1, b@1 depends on a@1. New: a@2, b@1 depends on a@2.
        let mut old = DependencyGraph::new();
        let (a1, a1_entry) = node("a", "1.0.0", &[]);
        let (b1, b1_entry_old) = node("b", "1.0.0", &[("a", "^1.0.0", "1.0.0")]);
        old.insert(a1.clone(), a1_entry);
        old.insert(b1.clone(), b1_entry_old);

        let mut new = DependencyGraph::new();
        let (a2, a2_entry) = node("a", "2.0.0", &[]);
        let (b1_new, b1_entry_new) = node("b", "1.0.0", &[("a", "^2.0.0", "2.0.0")]);
        new.insert(a2.clone(), a2_entry);
        new.insert(b1_new.clone(), b1_entry_new);

        let diff = old.diff(&new).unwrap();
        assert_eq!(diff.removed, HashSet::from([a1.clone()]));
        assert_eq!(diff.added, HashSet::from([a2.clone()]));
        assert_eq!(diff.modified, HashSet::from([b1.clone()]));

        let plan = diff.sort();
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Deactivate(b1.clone()),
                PlanStep::Deactivate(a1),
                PlanStep::Activate(a2),
                PlanStep::Activate(b1),
            ]
        );
    }
}
