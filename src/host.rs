//! Host product identity and compatibility checks.

use semver::Version;

use crate::descriptor::ModuleDescriptor;

/// The host product the manager runs inside: its version (checked against
/// descriptor product constraints) plus optional product-specific hooks.
pub trait HostCompatibility: Send + Sync {
    /// The running product version.
    fn current_version(&self) -> Version;

    /// One-time product hook, run before the first metadata scan.
    fn initialize(&self) {}

    /// Product veto over a version-compatible descriptor. The default
    /// accepts everything.
    fn is_compatible(&self, _descriptor: &ModuleDescriptor) -> bool {
        true
    }
}

/// A host with a fixed version and no extra checks.
#[derive(Debug, Clone)]
pub struct StaticHost {
    version: Version,
}

impl StaticHost {
    pub fn new(version: Version) -> Self {
        Self { version }
    }
}

impl HostCompatibility for StaticHost {
    fn current_version(&self) -> Version {
        self.version.clone()
    }
}
