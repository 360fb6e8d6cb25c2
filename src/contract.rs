//! Contract registry — the set of module contract types the product
//! supports, aggregated from `modhost.contracts.json` resources.
//!
//! The registry maps a contract type to the reference of the host-side
//! interface modules of that type must implement. Population happens at
//! most once per registry; the flag is only set after a fully successful
//! merge so a failed attempt can be retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::PackageRepository;

/// Resource name a package carries to declare contract types.
pub const CONTRACTS_RESOURCE: &str = "modhost.contracts.json";

#[derive(Debug, Deserialize)]
struct RawContract {
    #[serde(rename = "type")]
    contract: String,
    interface: String,
}

/// Registry of supported contract types.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    populated: AtomicBool,
    inner: RwLock<HashMap<String, String>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry instance shared by managers that do not
    /// supply their own.
    pub fn global() -> Arc<ContractRegistry> {
        static CELL: OnceLock<Arc<ContractRegistry>> = OnceLock::new();
        Arc::clone(CELL.get_or_init(|| Arc::new(ContractRegistry::new())))
    }

    /// Scans every package carrying a contract-registry resource and merges
    /// its declarations. Only the first successful call populates; later
    /// calls return immediately.
    pub fn populate_once(&self, repository: &dyn PackageRepository) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.populated.load(Ordering::Acquire) {
            return Ok(());
        }
        for package in repository.list_packages()? {
            if !package.contains(CONTRACTS_RESOURCE) {
                continue;
            }
            let bytes = package.read(CONTRACTS_RESOURCE)?;
            let raws: Vec<RawContract> =
                serde_json::from_slice(&bytes).map_err(|e| Error::MalformedContracts {
                    location: package.base_location().to_string(),
                    reason: e.to_string(),
                })?;
            for raw in raws {
                debug!(contract = %raw.contract, location = %package.base_location(), "registered contract type");
                inner.insert(raw.contract, raw.interface);
            }
        }
        info!(contracts = inner.len(), "contract registry populated");
        self.populated.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_supported(&self, contract: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(contract)
    }

    /// The host-side interface reference registered for a contract type.
    pub fn interface_ref(&self, contract: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(contract)
            .cloned()
    }

    /// All registered contract types, sorted.
    pub fn contracts(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Registers a contract type directly, for hosts that declare their
    /// contracts in code rather than in package resources.
    pub fn register(&self, contract: impl Into<String>, interface: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contract.into(), interface.into());
    }
}
