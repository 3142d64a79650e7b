//! Resolver tuning knobs (spec §4.11 ambient config).

/// Bounds search so a pathological provider graph can't backtrack
/// forever; exceeding it is reported the same way as any other
/// unresolvable search (spec §7 `unresolvable-dependencies`).
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub max_backtrack_steps: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_backtrack_steps: 100_000 }
    }
}
