//! Isolation boundaries — per-module (or shared) resolution scopes.
//!
//! A boundary owns an ordered list of packages and delegates to a host
//! scope. Implementation names resolve boundary-first by default, except
//! for host-first prefixes (framework names always come from the host and
//! are never shadowed). Resource lookups resolve boundary-first, with a
//! pattern filter that can hide host resources from module code.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::context;
use crate::error::{Error, Result};
use crate::storage::Package;

/// Names under this prefix always resolve through the host scope, so
/// modules share the framework's own types instead of shadowing them.
pub const FRAMEWORK_PREFIX: &str = "modhost";

/// The host-side scope a boundary delegates to. The defaults make the
/// host opaque; products override what they deliberately expose.
pub trait HostScope: Send + Sync {
    /// Whether the host can resolve the implementation name.
    fn contains(&self, _name: &str) -> bool {
        false
    }

    /// Reads a host resource, if the host exposes it.
    fn read(&self, _resource: &str) -> Option<Vec<u8>> {
        None
    }
}

/// A host scope exposing nothing.
#[derive(Debug, Default)]
pub struct EmptyHostScope;

impl HostScope for EmptyHostScope {}

/// Where a lookup was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Resolved from a boundary package at this location.
    Boundary { location: String },
    /// Resolved by the host scope.
    Host,
}

type CleanupAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// An isolated resolution scope for one module (or a shared group).
pub struct IsolationBoundary {
    packages: RwLock<Vec<Box<dyn Package>>>,
    parent: Arc<dyn HostScope>,
    host_first_prefixes: RwLock<Vec<String>>,
    ignore_parent_patterns: RwLock<Vec<Regex>>,
    cleanup: Mutex<Vec<CleanupAction>>,
    released: AtomicBool,
}

impl IsolationBoundary {
    pub fn new(packages: Vec<Box<dyn Package>>) -> Self {
        Self::with_parent(packages, Arc::new(EmptyHostScope))
    }

    pub fn with_parent(packages: Vec<Box<dyn Package>>, parent: Arc<dyn HostScope>) -> Self {
        Self {
            packages: RwLock::new(packages),
            parent,
            host_first_prefixes: RwLock::new(vec![FRAMEWORK_PREFIX.to_string()]),
            ignore_parent_patterns: RwLock::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Resolves an implementation name. Host-first prefixes delegate up
    /// unconditionally; everything else is boundary-first with host
    /// fallback.
    pub fn resolve(&self, name: &str) -> Option<Origin> {
        let host_first = self
            .host_first_prefixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| name.starts_with(p.as_str()));
        if host_first {
            return self.parent.contains(name).then_some(Origin::Host);
        }
        if let Some(location) = self.local_package_with(name) {
            return Some(Origin::Boundary { location });
        }
        self.parent.contains(name).then_some(Origin::Host)
    }

    /// Reads a resource boundary-first; falls back to the host unless the
    /// resource's file name matches an ignore pattern.
    pub fn find_resource(&self, path: &str) -> Option<Vec<u8>> {
        let packages = self.packages.read().unwrap_or_else(PoisonError::into_inner);
        for package in packages.iter() {
            if package.contains(path) {
                return package.read(path).ok();
            }
        }
        drop(packages);
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let ignored = self
            .ignore_parent_patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|re| re.is_match(file_name));
        if ignored {
            return None;
        }
        self.parent.read(path)
    }

    /// Adds a name prefix that always resolves through the host.
    pub fn add_host_first_prefix(&self, prefix: impl Into<String>) {
        self.host_first_prefixes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prefix.into());
    }

    /// Adds a regex hiding matching host resources (matched against the
    /// resource file name) from module code.
    pub fn add_ignore_host_resource_pattern(&self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| Error::InvalidResourcePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.ignore_parent_patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(re);
        Ok(())
    }

    /// Registers a cleanup action to run when the boundary is released.
    pub fn add_cleanup_action(&self, action: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        self.cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(action));
    }

    /// Base locations of the packages this boundary spans, in order.
    pub fn locations(&self) -> Vec<String> {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.base_location().to_string())
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the boundary: runs every registered cleanup action with
    /// this boundary ambient, then drops the packages. A failing or
    /// panicking action is logged and never aborts sibling actions.
    /// Idempotent; only the first call does any work.
    pub fn release(self: Arc<Self>) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let actions: Vec<CleanupAction> = std::mem::take(
            &mut *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner),
        );
        debug!(actions = actions.len(), "releasing isolation boundary");
        for action in actions {
            let outcome = {
                let _guard = context::enter(Arc::clone(&self));
                catch_unwind(AssertUnwindSafe(action))
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "boundary cleanup action failed"),
                Err(_) => warn!("boundary cleanup action panicked"),
            }
        }
        self.packages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn local_package_with(&self, name: &str) -> Option<String> {
        let packages = self.packages.read().unwrap_or_else(PoisonError::into_inner);
        packages
            .iter()
            .find(|p| p.contains(name))
            .map(|p| p.base_location().to_string())
    }
}
