//! Resolver and graph error taxonomy (spec §4.11, §7).

use std::fmt;

use crate::graph::NodeKey;

/// Errors surfaced by [`crate::graph::DependencyGraph`] operations.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A topological sort found no source node on some iteration: the
    /// remaining nodes form a cycle.
    Cycle(Vec<NodeKey>),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Cycle(nodes) => {
                write!(f, "dependency cycle among: {}", nodes.iter().map(NodeKey::to_string).collect::<Vec<_>>().join(", "))
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Diagnostics attached to [`ResolverError::Unresolvable`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnresolvableDiagnostics {
    pub missing: Vec<String>,
    pub cycles: Vec<Vec<NodeKey>>,
    pub disputes: Vec<String>,
}

/// Errors surfaced by [`crate::resolver::Resolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverError {
    /// No combination of candidate versions satisfies every constraint.
    /// The caller should treat the target as infeasible and leave the
    /// system dirty for retry after remediation (spec §4.11).
    Unresolvable(UnresolvableDiagnostics),
    /// A provider-returned version string failed to parse as semver.
    InvalidVersion { name: String, version: String },
    /// A requirement's range string failed to parse as a semver range.
    InvalidRange { name: String, range: String },
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::Unresolvable(diag) => write!(
                f,
                "unresolvable dependencies (missing: {:?}, cycles: {}, disputes: {:?})",
                diag.missing,
                diag.cycles.len(),
                diag.disputes
            ),
            ResolverError::InvalidVersion { name, version } => {
                write!(f, "invalid version {version:?} offered for {name}")
            }
            ResolverError::InvalidRange { name, range } => {
                write!(f, "invalid range {range:?} required for {name}")
            }
        }
    }
}

impl std::error::Error for ResolverError {}
