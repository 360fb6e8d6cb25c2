//! The module manager — discovery, resolution and the load/unload
//! lifecycle.
//!
//! The manager owns two maps: registered metadata (refreshed by scans)
//! and loaded modules (populated by loads, keyed by identity). All
//! mutating operations serialize on one operations lock so bulk
//! operations observe a consistent world; queries read the maps
//! directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info};

use crate::boundary::{EmptyHostScope, HostScope, IsolationBoundary};
use crate::context;
use crate::contract::ContractRegistry;
use crate::descriptor::{MetaInfo, ModuleIdentity};
use crate::error::{Error, Result};
use crate::host::HostCompatibility;
use crate::loader::{FactoryLoader, ModuleConfig, ModuleInstance, ModuleLoader};
use crate::metadata::{MetaMap, MetadataScanner};
use crate::storage::PackageRepository;

/// A loaded module: its discovery metadata, its isolation boundary and
/// the live instance.
pub struct LoadedModule {
    meta_info: MetaInfo,
    boundary: Arc<IsolationBoundary>,
    instance: Mutex<Box<dyn ModuleInstance>>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field(
                "module",
                &self.meta_info.descriptor.versioned_identity().to_string(),
            )
            .field("source", &self.meta_info.source_location)
            .finish_non_exhaustive()
    }
}

impl LoadedModule {
    pub fn meta_info(&self) -> &MetaInfo {
        &self.meta_info
    }

    pub fn boundary(&self) -> &Arc<IsolationBoundary> {
        &self.boundary
    }

    /// Executes one operation with the module's boundary ambient for the
    /// duration of the call.
    pub fn invoke(
        &self,
        operation: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let mut instance = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        context::with_boundary(&self.boundary, || instance.invoke(operation, payload))
    }

    fn destroy(&self) -> Result<()> {
        let mut instance = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        context::with_boundary(&self.boundary, || instance.on_destroy()).map_err(|cause| {
            Error::UnloadFailure {
                identity: self.meta_info.descriptor.versioned_identity(),
                cause,
            }
        })
    }
}

/// Orchestrates the module lifecycle over one package repository.
pub struct ModuleManager {
    repository: Arc<dyn PackageRepository>,
    host: Arc<dyn HostCompatibility>,
    host_scope: Arc<dyn HostScope>,
    loader: Arc<dyn ModuleLoader>,
    contracts: Arc<ContractRegistry>,
    scanner: MetadataScanner,
    metadata: RwLock<MetaMap>,
    loaded: RwLock<HashMap<ModuleIdentity, Arc<LoadedModule>>>,
    host_initialized: AtomicBool,
    ops: Mutex<()>,
}

impl ModuleManager {
    pub fn builder(
        repository: Arc<dyn PackageRepository>,
        host: Arc<dyn HostCompatibility>,
    ) -> ModuleManagerBuilder {
        ModuleManagerBuilder {
            repository,
            host,
            host_scope: None,
            loader: None,
            contracts: None,
        }
    }

    /// Populates the contract registry, runs the host's one-time hook and
    /// performs the initial metadata scan. Idempotent for the registry and
    /// host hook; the scan merges fresh results on every call.
    pub fn initialize(&self) -> Result<()> {
        let _ops = self.ops_guard();
        self.contracts.populate_once(self.repository.as_ref())?;
        if !self.host_initialized.swap(true, Ordering::AcqRel) {
            self.host.initialize();
        }
        let scanned = self.scanner.scan(None)?;
        self.merge_metadata(scanned);
        info!("module manager initialized");
        Ok(())
    }

    /// Registered metadata for one identity. Errs when the contract type
    /// itself is unsupported; an unknown name under a supported contract
    /// is `None`.
    pub fn get_meta_info(&self, identity: &ModuleIdentity) -> Result<Option<MetaInfo>> {
        if !self.contracts.is_supported(&identity.contract) {
            return Err(Error::UnsupportedContract(identity.contract.clone()));
        }
        let metadata = self.metadata.read().unwrap_or_else(PoisonError::into_inner);
        Ok(metadata
            .get(&identity.contract)
            .and_then(|names| names.get(&identity.name))
            .cloned())
    }

    /// Registered metadata for every module of one contract type.
    pub fn meta_infos(&self, contract: &str) -> Result<Vec<MetaInfo>> {
        if !self.contracts.is_supported(contract) {
            return Err(Error::UnsupportedContract(contract.to_string()));
        }
        let metadata = self.metadata.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<MetaInfo> = metadata
            .get(contract)
            .map(|names| names.values().cloned().collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| a.descriptor.identity.name.cmp(&b.descriptor.identity.name));
        Ok(infos)
    }

    /// The already-loaded module for an identity, if any.
    pub fn loaded(&self, identity: &ModuleIdentity) -> Option<Arc<LoadedModule>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Loads a module in its own boundary. Loading an already-loaded
    /// identity returns the cached module untouched.
    pub fn load(
        &self,
        identity: &ModuleIdentity,
        config: &ModuleConfig,
    ) -> Result<Arc<LoadedModule>> {
        let _ops = self.ops_guard();
        self.load_locked(identity, config, None)
    }

    /// Loads a module inside a caller-supplied boundary. If the identity
    /// is already loaded the cached module wins and the given boundary is
    /// ignored.
    pub fn load_with_boundary(
        &self,
        identity: &ModuleIdentity,
        config: &ModuleConfig,
        boundary: Arc<IsolationBoundary>,
    ) -> Result<Arc<LoadedModule>> {
        let _ops = self.ops_guard();
        self.load_locked(identity, config, Some(boundary))
    }

    /// Loads every registered module of one contract type, each in its own
    /// boundary.
    pub fn load_all(&self, contract: &str, config: &ModuleConfig) -> Result<Vec<Arc<LoadedModule>>> {
        let _ops = self.ops_guard();
        let infos = self.meta_infos(contract)?;
        if infos.is_empty() {
            return Err(Error::ContractHasNoModules(contract.to_string()));
        }
        infos
            .iter()
            .map(|info| self.load_locked(&info.descriptor.identity, config, None))
            .collect()
    }

    /// Loads every registered module of the given contract types into one
    /// shared boundary spanning all of their packages. Identities already
    /// loaded keep their existing boundary.
    pub fn load_all_sharing_boundary(
        &self,
        contracts: &[&str],
        config: &ModuleConfig,
    ) -> Result<Vec<Arc<LoadedModule>>> {
        let _ops = self.ops_guard();
        let mut infos = Vec::new();
        for contract in contracts {
            infos.extend(self.meta_infos(contract)?);
        }
        if infos.is_empty() {
            return Err(Error::ContractHasNoModules(contracts.join(", ")));
        }
        let mut locations: Vec<String> = Vec::new();
        for info in &infos {
            if !locations.contains(&info.source_location) {
                locations.push(info.source_location.clone());
            }
        }
        let shared = self.materialize_boundary(&locations, &infos[0])?;
        infos
            .iter()
            .map(|info| {
                self.load_locked(&info.descriptor.identity, config, Some(Arc::clone(&shared)))
            })
            .collect()
    }

    /// Unloads one module: deactivates the instance, releases its boundary
    /// once no other module shares it, and forgets the identity's
    /// metadata. Unloading an identity that was never loaded still removes
    /// the metadata entry.
    pub fn unload(&self, identity: &ModuleIdentity) -> Result<()> {
        let _ops = self.ops_guard();
        self.unload_locked(identity)
    }

    /// Unloads every module of one contract type, then forgets the whole
    /// contract bucket. The first deactivation failure aborts.
    pub fn unload_contract(&self, contract: &str) -> Result<()> {
        let _ops = self.ops_guard();
        let identities: Vec<ModuleIdentity> = {
            let metadata = self.metadata.read().unwrap_or_else(PoisonError::into_inner);
            metadata
                .get(contract)
                .map(|names| {
                    names
                        .values()
                        .map(|m| m.descriptor.identity.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for identity in &identities {
            self.teardown_if_loaded(identity)?;
        }
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(contract);
        info!(contract, "unloaded contract");
        Ok(())
    }

    /// Unloads everything and forgets all metadata. The first deactivation
    /// failure aborts, leaving the remainder loaded.
    pub fn unload_all(&self) -> Result<()> {
        let _ops = self.ops_guard();
        self.unload_all_locked()
    }

    /// Unloads one identity and re-registers it from a fresh targeted
    /// scan, without reloading it.
    pub fn reset(&self, identity: &ModuleIdentity) -> Result<()> {
        let _ops = self.ops_guard();
        self.unload_locked(identity)?;
        let scanned = self.scanner.scan(Some(identity))?;
        self.merge_metadata(scanned);
        Ok(())
    }

    /// Unloads everything and rebuilds the metadata map from a full scan.
    pub fn reset_all(&self) -> Result<()> {
        let _ops = self.ops_guard();
        self.unload_all_locked()?;
        let scanned = self.scanner.scan(None)?;
        self.merge_metadata(scanned);
        Ok(())
    }

    /// Fresh metadata for one identity when it differs from what is
    /// registered (different version, or not registered at all).
    pub fn check_for_update(&self, identity: &ModuleIdentity) -> Result<Option<MetaInfo>> {
        let registered = self.get_meta_info(identity)?;
        let scanned = self.scanner.scan(Some(identity))?;
        let fresh = scanned
            .get(&identity.contract)
            .and_then(|names| names.get(&identity.name))
            .cloned();
        Ok(match (registered, fresh) {
            (Some(old), Some(new)) if old.descriptor.version != new.descriptor.version => Some(new),
            (None, Some(new)) => Some(new),
            _ => None,
        })
    }

    /// Fresh metadata for every identity whose repository version differs
    /// from the registered one. Contract-registry membership is not
    /// consulted, so updates surface even for identities registered
    /// before their contract bucket emptied.
    pub fn check_for_updates(&self) -> Result<Vec<MetaInfo>> {
        let scanned = self.scanner.scan(None)?;
        let metadata = self.metadata.read().unwrap_or_else(PoisonError::into_inner);
        let mut updates = Vec::new();
        for (contract, names) in &scanned {
            for (name, fresh) in names {
                let registered = metadata.get(contract).and_then(|n| n.get(name));
                let differs = match registered {
                    Some(old) => old.descriptor.version != fresh.descriptor.version,
                    None => true,
                };
                if differs {
                    updates.push(fresh.clone());
                }
            }
        }
        updates.sort_by(|a, b| {
            a.descriptor
                .identity
                .to_string()
                .cmp(&b.descriptor.identity.to_string())
        });
        Ok(updates)
    }

    /// Updates one module in place: when fresh metadata differs, the old
    /// module is unloaded, the fresh metadata registered, and the module
    /// reloaded with an empty configuration. `None` when already current.
    pub fn update(&self, identity: &ModuleIdentity) -> Result<Option<Arc<LoadedModule>>> {
        let _ops = self.ops_guard();
        let Some(fresh) = self.check_for_update(identity)? else {
            debug!(module = %identity, "no update available");
            return Ok(None);
        };
        self.unload_locked(identity)?;
        self.register_meta(fresh);
        let module = self.load_locked(identity, &ModuleConfig::new(), None)?;
        info!(module = %module.meta_info.descriptor.versioned_identity(), "updated module");
        Ok(Some(module))
    }

    /// Updates every stale module: all of them are unloaded first, then
    /// the fresh metadata is registered, then all are reloaded. Returns
    /// the reloaded modules.
    pub fn update_all(&self) -> Result<Vec<Arc<LoadedModule>>> {
        let _ops = self.ops_guard();
        let updates = self.check_for_updates()?;
        for info in &updates {
            self.unload_locked(&info.descriptor.identity)?;
        }
        for info in &updates {
            self.register_meta(info.clone());
        }
        updates
            .iter()
            .map(|info| self.load_locked(&info.descriptor.identity, &ModuleConfig::new(), None))
            .collect()
    }

    fn ops_guard(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Internals below assume the ops lock is held and never re-take it.

    fn load_locked(
        &self,
        identity: &ModuleIdentity,
        config: &ModuleConfig,
        boundary: Option<Arc<IsolationBoundary>>,
    ) -> Result<Arc<LoadedModule>> {
        if let Some(existing) = self.loaded(identity) {
            debug!(module = %identity, "already loaded; returning cached module");
            return Ok(existing);
        }
        let meta = self
            .get_meta_info(identity)?
            .ok_or_else(|| Error::DescriptorNotFound(identity.clone()))?;
        let boundary = match boundary {
            Some(b) => b,
            None => self.materialize_boundary(std::slice::from_ref(&meta.source_location), &meta)?,
        };
        let instance = self.loader.load(&meta, &boundary, config)?;
        let module = Arc::new(LoadedModule {
            meta_info: meta,
            boundary,
            instance: Mutex::new(instance),
        });
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), Arc::clone(&module));
        info!(module = %module.meta_info.descriptor.versioned_identity(), "loaded module");
        Ok(module)
    }

    fn unload_locked(&self, identity: &ModuleIdentity) -> Result<()> {
        self.teardown_if_loaded(identity)?;
        let mut metadata = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(names) = metadata.get_mut(&identity.contract) {
            names.remove(&identity.name);
            if names.is_empty() {
                metadata.remove(&identity.contract);
            }
        }
        info!(module = %identity, "unloaded module");
        Ok(())
    }

    fn unload_all_locked(&self) -> Result<()> {
        let identities: Vec<ModuleIdentity> = {
            let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
            loaded.keys().cloned().collect()
        };
        for identity in &identities {
            self.teardown_if_loaded(identity)?;
        }
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("unloaded all modules");
        Ok(())
    }

    /// Removes the identity from the loaded map and deactivates it. The
    /// boundary is released once no loaded module holds it any more, so
    /// shared boundaries survive until the final member unloads while
    /// caller-held module handles never defer the release.
    fn teardown_if_loaded(&self, identity: &ModuleIdentity) -> Result<()> {
        let removed = self
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        let Some(module) = removed else {
            return Ok(());
        };
        module.destroy()?;
        let still_shared = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|m| Arc::ptr_eq(&m.boundary, &module.boundary));
        if !still_shared {
            Arc::clone(&module.boundary).release();
        }
        Ok(())
    }

    fn materialize_boundary(
        &self,
        locations: &[String],
        meta: &MetaInfo,
    ) -> Result<Arc<IsolationBoundary>> {
        let packages = self
            .repository
            .packages_at(locations)
            .map_err(|e| Error::LoadFailure {
                identity: meta.descriptor.versioned_identity(),
                location: meta.source_location.clone(),
                cause: anyhow::Error::from(e),
            })?;
        Ok(Arc::new(IsolationBoundary::with_parent(
            packages,
            Arc::clone(&self.host_scope),
        )))
    }

    fn register_meta(&self, info: MetaInfo) {
        let mut metadata = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
        metadata
            .entry(info.descriptor.identity.contract.clone())
            .or_default()
            .insert(info.descriptor.identity.name.clone(), info);
    }

    /// Folds scan results into the registered map without disturbing
    /// entries the scan did not touch.
    fn merge_metadata(&self, scanned: MetaMap) {
        let mut metadata = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
        for (contract, names) in scanned {
            metadata.entry(contract).or_default().extend(names);
        }
    }
}

/// Builds a `ModuleManager`; everything beyond the repository and host
/// has a sensible default.
pub struct ModuleManagerBuilder {
    repository: Arc<dyn PackageRepository>,
    host: Arc<dyn HostCompatibility>,
    host_scope: Option<Arc<dyn HostScope>>,
    loader: Option<Arc<dyn ModuleLoader>>,
    contracts: Option<Arc<ContractRegistry>>,
}

impl ModuleManagerBuilder {
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn contracts(mut self, contracts: Arc<ContractRegistry>) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn host_scope(mut self, host_scope: Arc<dyn HostScope>) -> Self {
        self.host_scope = Some(host_scope);
        self
    }

    /// Builds the manager without scanning; call `initialize` before use.
    pub fn build(self) -> ModuleManager {
        let repository = Arc::clone(&self.repository);
        let host = Arc::clone(&self.host);
        ModuleManager {
            scanner: MetadataScanner::new(Arc::clone(&repository), Arc::clone(&host)),
            repository,
            host,
            host_scope: self.host_scope.unwrap_or_else(|| Arc::new(EmptyHostScope)),
            loader: self
                .loader
                .unwrap_or_else(|| Arc::new(FactoryLoader::new())),
            contracts: self.contracts.unwrap_or_else(ContractRegistry::global),
            metadata: RwLock::new(MetaMap::new()),
            loaded: RwLock::new(HashMap::new()),
            host_initialized: AtomicBool::new(false),
            ops: Mutex::new(()),
        }
    }

    /// Builds and immediately initializes the manager.
    pub fn build_initialized(self) -> Result<ModuleManager> {
        let manager = self.build();
        manager.initialize()?;
        Ok(manager)
    }
}
