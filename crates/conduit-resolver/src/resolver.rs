//! Backtracking dependency resolver: Minimum Remaining Values ordering,
//! locked-version preference, and fingerprint memoisation over revisited
//! search states (spec §4.11).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use semver::{Version, VersionReq};

use crate::config::ResolverConfig;
use crate::error::{ResolverError, UnresolvableDiagnostics};
use crate::graph::{DependencyGraph, NodeEntry, NodeKey};
use crate::provider::Provider;

/// Top-level requirements: package name to semver range.
pub type Requirements = HashMap<String, VersionReq>;

type ChosenSet = HashMap<String, (NodeKey, HashMap<String, VersionReq>)>;
type ConstraintSet = HashMap<String, Vec<VersionReq>>;

/// Union of all registered providers, searched in registration order.
pub struct Resolver {
    providers: Vec<Arc<dyn Provider>>,
    config: ResolverConfig,
    cache: Mutex<HashMap<(u64, u64), bool>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            providers: Vec::new(),
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Resolve `requirements` into a graph, preferring `locked`'s pinned
    /// versions where they still satisfy the active range.
    pub fn resolve(&self, requirements: Requirements, locked: Option<&DependencyGraph>) -> Result<DependencyGraph, ResolverError> {
        let mut constraints: ConstraintSet = HashMap::new();
        let mut queue = Vec::new();
        for (name, range) in requirements {
            constraints.entry(name.clone()).or_default().push(range);
            queue.push(name);
        }

        let steps = AtomicUsize::new(0);
        match self.backtrack(queue.clone(), constraints, HashMap::new(), locked, &steps) {
            Some(chosen) => {
                tracing::debug!(
                    packages = chosen.len(),
                    steps = steps.load(Ordering::Relaxed),
                    "dependency resolution succeeded"
                );
                Ok(self.materialize(chosen))
            }
            None => Err(ResolverError::Unresolvable(self.diagnose(&queue))),
        }
    }

    fn materialize(&self, chosen: ChosenSet) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (name, (key, deps)) in &chosen {
            let mut entry = NodeEntry::new(self.provider_name_for(name, &key.version));
            entry.dependencies = deps.clone();
            for dep_name in deps.keys() {
                if let Some((dep_key, _)) = chosen.get(dep_name) {
                    entry.lock.insert(dep_name.clone(), dep_key.clone());
                }
            }
            graph.insert(key.clone(), entry);
        }
        graph
    }

    fn backtrack(
        &self,
        queue: Vec<String>,
        constraints: ConstraintSet,
        chosen: ChosenSet,
        locked: Option<&DependencyGraph>,
        steps: &AtomicUsize,
    ) -> Option<ChosenSet> {
        if queue.is_empty() {
            return Some(chosen);
        }
        if steps.fetch_add(1, Ordering::Relaxed) >= self.config.max_backtrack_steps {
            tracing::warn!(
                max_backtrack_steps = self.config.max_backtrack_steps,
                "backtracking search exhausted its step budget, reporting unresolvable"
            );
            return None;
        }

        let fingerprint = Self::fingerprint(&chosen, &constraints);
        if self.cache.lock().get(&fingerprint) == Some(&false) {
            return None;
        }

        // Minimum Remaining Values: resolve whichever name has the fewest
        // surviving candidates first.
        let mut best: Option<(usize, Vec<Version>)> = None;
        for (idx, name) in queue.iter().enumerate() {
            let offered = self.candidates_for(name);
            let ranges = constraints.get(name).cloned().unwrap_or_default();
            let mut versions: Vec<Version> = offered.keys().filter(|v| ranges.iter().all(|r| r.matches(v))).cloned().collect();
            self.order_candidates(&mut versions, locked, name);
            let better = match &best {
                None => true,
                Some((_, existing)) => versions.len() < existing.len(),
            };
            if better {
                best = Some((idx, versions));
            }
        }
        let (idx, versions) = best.expect("queue non-empty");
        let mut rest = queue;
        let name = rest.remove(idx);
        let offered = self.candidates_for(&name);

        for version in versions {
            let deps = offered.get(&version).cloned().unwrap_or_default();
            let key = NodeKey::new(name.clone(), version.clone());

            let mut next_queue = rest.clone();
            let mut next_constraints = constraints.clone();
            next_constraints.remove(&name);
            let mut next_chosen = chosen.clone();
            next_chosen.insert(name.clone(), (key, deps.clone()));

            let mut ok = true;
            for (dep_name, dep_range) in &deps {
                if let Some((dep_key, _)) = next_chosen.get(dep_name) {
                    if !dep_range.matches(&dep_key.version) {
                        ok = false;
                        break;
                    }
                    continue;
                }
                next_constraints.entry(dep_name.clone()).or_default().push(dep_range.clone());
                if !next_queue.contains(dep_name) {
                    next_queue.push(dep_name.clone());
                }
            }
            if !ok {
                continue;
            }

            if let Some(result) = self.backtrack(next_queue, next_constraints, next_chosen, locked, steps) {
                return Some(result);
            }
        }

        self.cache.lock().insert(fingerprint, false);
        None
    }

    fn candidates_for(&self, name: &str) -> HashMap<Version, HashMap<String, VersionReq>> {
        let mut merged: HashMap<Version, HashMap<String, VersionReq>> = HashMap::new();
        for provider in &self.providers {
            if let Some(versions) = provider.provide(name) {
                for (version, deps) in versions {
                    merged.entry(version).or_insert(deps);
                }
            }
        }
        merged
    }

    fn provider_name_for(&self, name: &str, version: &Version) -> String {
        for provider in &self.providers {
            if let Some(versions) = provider.provide(name) {
                if versions.contains_key(version) {
                    return provider.name().to_string();
                }
            }
        }
        "unknown".to_string()
    }

    /// Descending semver, with a still-valid locked version moved to the
    /// front so an existing graph stays stable across re-resolution.
    fn order_candidates(&self, versions: &mut [Version], locked: Option<&DependencyGraph>, name: &str) {
        versions.sort_by(|a, b| b.cmp(a));
        let Some(locked_graph) = locked else { return };
        let Some(locked_version) = locked_graph.keys().find(|k| k.name == name).map(|k| k.version.clone()) else {
            return;
        };
        if let Some(pos) = versions.iter().position(|v| *v == locked_version) {
            versions[..=pos].rotate_right(1);
        }
    }

    fn diagnose(&self, queue: &[String]) -> UnresolvableDiagnostics {
        let mut missing: Vec<String> = queue.iter().filter(|name| self.candidates_for(name).is_empty()).cloned().collect();
        missing.sort();
        UnresolvableDiagnostics {
            missing,
            cycles: Vec::new(),
            disputes: Vec::new(),
        }
    }

    fn fingerprint(chosen: &ChosenSet, constraints: &ConstraintSet) -> (u64, u64) {
        let mut chosen_entries: Vec<(&String, &NodeKey)> = chosen.iter().map(|(name, (key, _))| (name, key)).collect();
        chosen_entries.sort_by_key(|(name, _)| (*name).clone());
        let mut hasher = DefaultHasher::new();
        for (name, key) in &chosen_entries {
            name.hash(&mut hasher);
            key.hash(&mut hasher);
        }
        let graph_fingerprint = hasher.finish();

        let mut constraint_entries: Vec<(&String, Vec<String>)> = constraints
            .iter()
            .map(|(name, ranges)| {
                let mut rendered: Vec<String> = ranges.iter().map(ToString::to_string).collect();
                rendered.sort();
                (name, rendered)
            })
            .collect();
        constraint_entries.sort_by_key(|(name, _)| (*name).clone());
        let mut hasher = DefaultHasher::new();
        for (name, ranges) in &constraint_entries {
            name.hash(&mut hasher);
            ranges.hash(&mut hasher);
        }
        let constraints_fingerprint = hasher.finish();

        (graph_fingerprint, constraints_fingerprint)
    }
}
