//! modhost — a runtime module manager.
//!
//! Packages in a repository declare the modules they carry through a
//! well-known descriptor resource. The manager scans them, keeps the
//! highest product-compatible version per `(type, name)` identity, and
//! drives the module lifecycle: load into an isolation boundary, invoke
//! operations with that boundary ambient, unload, reset and update.
//!
//! ```no_run
//! use std::sync::Arc;
//! use modhost::{DirRepository, FactoryLoader, ModuleManager, StaticHost};
//!
//! # fn main() -> modhost::Result<()> {
//! let repository = Arc::new(DirRepository::new("/opt/app/modules"));
//! let host = Arc::new(StaticHost::new(semver::Version::new(1, 4, 0)));
//! let loader = Arc::new(FactoryLoader::new());
//! let manager = ModuleManager::builder(repository, host)
//!     .loader(loader)
//!     .build_initialized()?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod boundary;
pub mod context;
pub mod contract;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod storage;
pub mod version;

pub use boundary::{EmptyHostScope, HostScope, IsolationBoundary, Origin, FRAMEWORK_PREFIX};
pub use contract::{ContractRegistry, CONTRACTS_RESOURCE};
pub use descriptor::{
    MetaInfo, ModuleDescriptor, ModuleIdentity, VersionedIdentity, DESCRIPTOR_RESOURCE,
};
pub use error::{Error, Result};
pub use host::{HostCompatibility, StaticHost};
pub use loader::{FactoryLoader, ModuleConfig, ModuleInstance, ModuleLoader};
pub use manager::{LoadedModule, ModuleManager, ModuleManagerBuilder};
pub use metadata::{MetaMap, MetadataScanner};
pub use storage::{DirPackage, DirRepository, Package, PackageRepository, ZipPackage};
pub use version::{compare_precedence, parse_version, Constraint};
