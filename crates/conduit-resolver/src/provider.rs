//! Dependency provider contract (spec §6 "Dependency provider contract").

use std::collections::HashMap;

use semver::{Version, VersionReq};

/// Offers candidate versions of a package, each with the dependency
/// ranges it in turn requires. Providers are consulted in registration
/// order; the first to offer the requested name wins.
pub trait Provider: Send + Sync {
    /// A stable label recorded on resolved nodes (`NodeEntry::provider`).
    fn name(&self) -> &str;

    /// `None` means this provider has nothing named `name`; the resolver
    /// tries the next one.
    fn provide(&self, name: &str) -> Option<HashMap<Version, HashMap<String, VersionReq>>>;
}

/// An in-memory [`Provider`] built up by hand, used in tests and for
/// small embedded manifests.
#[derive(Debug, Default, Clone)]
pub struct StaticProvider {
    label: String,
    packages: HashMap<String, HashMap<Version, HashMap<String, VersionReq>>>,
}

impl StaticProvider {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            packages: HashMap::new(),
        }
    }

    pub fn with_version(
        mut self,
        name: impl Into<String>,
        version: Version,
        dependencies: HashMap<String, VersionReq>,
    ) -> Self {
        self.packages.entry(name.into()).or_default().insert(version, dependencies);
        self
    }
}

impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.label
    }

    fn provide(&self, name: &str) -> Option<HashMap<Version, HashMap<String, VersionReq>>> {
        self.packages.get(name).cloned()
    }
}
