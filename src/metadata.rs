//! Metadata scanning — discovering eligible module descriptors.
//!
//! A scan walks every package in the repository, parses its descriptor
//! resource, drops descriptors the host cannot run, and reconciles
//! duplicates per identity by keeping the highest version. Read and parse
//! failures abort the whole scan; ineligibility only skips the one
//! descriptor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::descriptor::{MetaInfo, ModuleDescriptor, ModuleIdentity, DESCRIPTOR_RESOURCE};
use crate::error::Result;
use crate::host::HostCompatibility;
use crate::storage::PackageRepository;
use crate::version::compare_precedence;

/// Discovered metadata keyed by contract type, then module name.
pub type MetaMap = HashMap<String, HashMap<String, MetaInfo>>;

/// Scans the package repository for eligible module metadata.
pub struct MetadataScanner {
    repository: Arc<dyn PackageRepository>,
    host: Arc<dyn HostCompatibility>,
}

impl MetadataScanner {
    pub fn new(repository: Arc<dyn PackageRepository>, host: Arc<dyn HostCompatibility>) -> Self {
        Self { repository, host }
    }

    /// Runs a scan. With a target identity only matching descriptors are
    /// kept; either way the result holds at most one entry per identity,
    /// the highest eligible version (first discovered wins a tie, and the
    /// repository listing order is deterministic).
    pub fn scan(&self, target: Option<&ModuleIdentity>) -> Result<MetaMap> {
        let host_version = self.host.current_version();
        let mut map: MetaMap = HashMap::new();

        for package in self.repository.list_packages()? {
            if !package.contains(DESCRIPTOR_RESOURCE) {
                continue;
            }
            let bytes = package.read(DESCRIPTOR_RESOURCE)?;
            let descriptors = crate::descriptor::parse_descriptors(&bytes, package.base_location())?;
            for descriptor in descriptors {
                if let Some(target) = target {
                    if descriptor.identity != *target {
                        continue;
                    }
                }
                if !self.eligible(&descriptor, &host_version) {
                    info!(
                        module = %descriptor.versioned_identity(),
                        constraint = %descriptor.product_constraint,
                        host = %host_version,
                        "skipping incompatible module"
                    );
                    continue;
                }
                reconcile(&mut map, descriptor, package.base_location());
            }
        }

        map.retain(|_, names| !names.is_empty());
        Ok(map)
    }

    fn eligible(&self, descriptor: &ModuleDescriptor, host_version: &semver::Version) -> bool {
        let version_ok = descriptor.product_constraint.is_wildcard()
            || descriptor.product_constraint.matches(host_version);
        version_ok && self.host.is_compatible(descriptor)
    }
}

fn reconcile(map: &mut MetaMap, descriptor: ModuleDescriptor, location: &str) {
    let names = map.entry(descriptor.identity.contract.clone()).or_default();
    let candidate = MetaInfo {
        source_location: location.to_string(),
        descriptor,
    };
    match names.get(&candidate.descriptor.identity.name) {
        Some(existing)
            if compare_precedence(&existing.descriptor.version, &candidate.descriptor.version)
                .is_lt() =>
        {
            info!(
                module = %candidate.descriptor.versioned_identity(),
                replaced = %existing.descriptor.version,
                "higher module version replaces earlier discovery"
            );
            names.insert(candidate.descriptor.identity.name.clone(), candidate);
        }
        Some(existing) => {
            debug!(
                module = %candidate.descriptor.versioned_identity(),
                kept = %existing.descriptor.version,
                "keeping earlier discovery"
            );
        }
        None => {
            debug!(module = %candidate.descriptor.versioned_identity(), "discovered module");
            names.insert(candidate.descriptor.identity.name.clone(), candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use crate::storage::DirRepository;
    use semver::Version;
    use std::fs;
    use std::path::Path;

    fn write_pkg(base: &Path, name: &str, doc: &str) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DESCRIPTOR_RESOURCE), doc).unwrap();
    }

    fn scanner(base: &Path, host_version: &str) -> MetadataScanner {
        MetadataScanner::new(
            Arc::new(DirRepository::new(base)),
            Arc::new(StaticHost::new(Version::parse(host_version).unwrap())),
        )
    }

    #[test]
    fn keeps_highest_version_per_identity() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "a-old",
            r#"{"type": "greeter", "name": "hello", "version": "1.0.0", "implementation": "i1"}"#,
        );
        write_pkg(
            tmp.path(),
            "b-new",
            r#"{"type": "greeter", "name": "hello", "version": "1.2.0", "implementation": "i2"}"#,
        );

        let map = scanner(tmp.path(), "1.0.0").scan(None).unwrap();
        let meta = &map["greeter"]["hello"];
        assert_eq!(meta.descriptor.version, Version::new(1, 2, 0));
        assert!(meta.source_location.ends_with("b-new"));
    }

    #[test]
    fn version_tie_keeps_first_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a-first", "b-second"] {
            write_pkg(
                tmp.path(),
                name,
                r#"{"type": "greeter", "name": "hello", "version": "1.0.0", "implementation": "i"}"#,
            );
        }
        let map = scanner(tmp.path(), "1.0.0").scan(None).unwrap();
        assert!(map["greeter"]["hello"].source_location.ends_with("a-first"));
    }

    #[test]
    fn incompatible_descriptors_are_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "pkg",
            r#"[
                {"type": "greeter", "name": "old", "version": "1.0.0",
                 "implementation": "i", "productConstraint": ">=1.0.0 & <2.0.0"},
                {"type": "greeter", "name": "new", "version": "2.0.0",
                 "implementation": "i", "productConstraint": ">=3.0.0"}
            ]"#,
        );
        let map = scanner(tmp.path(), "1.5.0").scan(None).unwrap();
        assert!(map["greeter"].contains_key("old"));
        assert!(!map["greeter"].contains_key("new"));
    }

    #[test]
    fn higher_version_must_also_be_compatible_to_win() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "a",
            r#"{"type": "greeter", "name": "hello", "version": "1.0.0",
                "implementation": "i", "productConstraint": "^1"}"#,
        );
        write_pkg(
            tmp.path(),
            "b",
            r#"{"type": "greeter", "name": "hello", "version": "1.1.0",
                "implementation": "i", "productConstraint": ">=2.0.0"}"#,
        );
        let map = scanner(tmp.path(), "1.0.0").scan(None).unwrap();
        assert_eq!(
            map["greeter"]["hello"].descriptor.version,
            Version::new(1, 0, 0)
        );
    }

    #[test]
    fn wildcard_constraint_is_always_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "pkg",
            r#"{"type": "greeter", "name": "hello", "version": "1.0.0", "implementation": "i"}"#,
        );
        let map = scanner(tmp.path(), "99.0.0-alpha").scan(None).unwrap();
        assert!(map["greeter"].contains_key("hello"));
    }

    #[test]
    fn targeted_scan_filters_to_one_identity() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "pkg",
            r#"[
                {"type": "greeter", "name": "hello", "version": "1.0.0", "implementation": "i"},
                {"type": "greeter", "name": "bye", "version": "1.0.0", "implementation": "i"},
                {"type": "codec", "name": "json", "version": "1.0.0", "implementation": "i"}
            ]"#,
        );
        let target = ModuleIdentity::new("greeter", "bye");
        let map = scanner(tmp.path(), "1.0.0").scan(Some(&target)).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["greeter"].len(), 1);
        assert!(map["greeter"].contains_key("bye"));
    }

    #[test]
    fn malformed_descriptor_aborts_the_scan() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "good",
            r#"{"type": "greeter", "name": "hello", "version": "1.0.0", "implementation": "i"}"#,
        );
        write_pkg(tmp.path(), "bad", "not json");
        assert!(scanner(tmp.path(), "1.0.0").scan(None).is_err());
    }

    #[test]
    fn empty_contract_buckets_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "pkg",
            r#"{"type": "greeter", "name": "hello", "version": "1.0.0",
                "implementation": "i", "productConstraint": ">=9.0.0"}"#,
        );
        let map = scanner(tmp.path(), "1.0.0").scan(None).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn host_predicate_can_veto_compatible_descriptors() {
        struct PickyHost;
        impl HostCompatibility for PickyHost {
            fn current_version(&self) -> Version {
                Version::new(1, 0, 0)
            }
            fn is_compatible(&self, descriptor: &ModuleDescriptor) -> bool {
                descriptor.identity.name != "banned"
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        write_pkg(
            tmp.path(),
            "pkg",
            r#"[
                {"type": "greeter", "name": "ok", "version": "1.0.0", "implementation": "i"},
                {"type": "greeter", "name": "banned", "version": "1.0.0", "implementation": "i"}
            ]"#,
        );
        let scanner = MetadataScanner::new(
            Arc::new(DirRepository::new(tmp.path())),
            Arc::new(PickyHost),
        );
        let map = scanner.scan(None).unwrap();
        assert!(map["greeter"].contains_key("ok"));
        assert!(!map["greeter"].contains_key("banned"));
    }
}
