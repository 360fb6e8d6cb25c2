//! Error types for modhost.

use thiserror::Error;

use crate::descriptor::{ModuleIdentity, VersionedIdentity};

/// Result type alias for modhost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the module manager and its collaborators.
///
/// Everything here is reported to the caller; the only failures that are
/// logged and swallowed are individual deferred-cleanup actions during
/// boundary release, which never abort sibling cleanup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },

    #[error("invalid version constraint '{expr}': {reason}")]
    InvalidConstraint { expr: String, reason: String },

    /// Structural validation failure attributable to one descriptor.
    #[error("invalid descriptor for module {identity}: {reason}")]
    InvalidDescriptor {
        identity: ModuleIdentity,
        reason: String,
    },

    /// The descriptor document could not be parsed at all, so no identity
    /// can be blamed; the package location is named instead.
    #[error("malformed descriptor document in {location}: {reason}")]
    MalformedDescriptor { location: String, reason: String },

    #[error("malformed contract registry document in {location}: {reason}")]
    MalformedContracts { location: String, reason: String },

    /// Queried contract type was never seen in the contract registry.
    #[error("unsupported contract type '{0}'")]
    UnsupportedContract(String),

    /// No eligible metadata entry exists for the identity.
    #[error("no descriptor found for module {0}")]
    DescriptorNotFound(ModuleIdentity),

    #[error("contract '{0}' has no modules")]
    ContractHasNoModules(String),

    #[error("failed to load module {identity} from {location}: {cause}")]
    LoadFailure {
        identity: VersionedIdentity,
        location: String,
        cause: anyhow::Error,
    },

    #[error("failed to unload module {identity}: {cause}")]
    UnloadFailure {
        identity: VersionedIdentity,
        cause: anyhow::Error,
    },

    #[error("failed to read '{resource}' from package {location}: {reason}")]
    ResourceRead {
        location: String,
        resource: String,
        reason: String,
    },

    #[error("failed to scan module repository at {location}: {reason}")]
    RepositoryScan { location: String, reason: String },

    #[error("invalid resource pattern '{pattern}': {reason}")]
    InvalidResourcePattern { pattern: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
