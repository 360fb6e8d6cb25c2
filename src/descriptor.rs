//! Module descriptors — the `modhost.plugin.json` metadata format.
//!
//! A package describes the modules it carries in a single well-known JSON
//! resource holding either one descriptor object or an array of them; the
//! document self-describes which through its top-level value. Validation
//! (parseable version and constraint, non-blank identity, unique attribute
//! names) happens here, at ingestion time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use semver::Version;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::version::{self, Constraint};

/// Resource name every package must carry to describe its modules.
pub const DESCRIPTOR_RESOURCE: &str = "modhost.plugin.json";

/// The `(type, name)` key uniquely selecting one module among those
/// implementing a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity {
    /// Contract type the module implements (e.g. "payment-provider").
    pub contract: String,
    /// Name disambiguating modules implementing the same contract.
    pub name: String,
}

impl ModuleIdentity {
    pub fn new(contract: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contract, self.name)
    }
}

/// An identity pinned to a specific version, for log and error messages.
#[derive(Debug, Clone)]
pub struct VersionedIdentity {
    pub identity: ModuleIdentity,
    pub version: Version,
}

impl fmt::Display for VersionedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.version)
    }
}

/// Everything a package declares about one module. Immutable once built.
///
/// Equality follows the reconciliation key: identity, version and product
/// constraint; display fields, tags and attributes do not participate.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub identity: ModuleIdentity,
    pub version: Version,
    pub product_constraint: Constraint,
    /// Reference naming the module implementation the loader instantiates.
    pub implementation: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub attributes: BTreeMap<String, String>,
}

impl PartialEq for ModuleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.version == other.version
            && self.product_constraint.expr() == other.product_constraint.expr()
    }
}

impl Eq for ModuleDescriptor {}

impl ModuleDescriptor {
    pub fn versioned_identity(&self) -> VersionedIdentity {
        VersionedIdentity {
            identity: self.identity.clone(),
            version: self.version.clone(),
        }
    }

    /// Serializes back to the descriptor wire form.
    pub fn to_document(&self) -> serde_json::Value {
        let mut doc = json!({
            "type": self.identity.contract,
            "name": self.identity.name,
            "version": self.version.to_string(),
            "implementation": self.implementation,
            "productConstraint": self.product_constraint.expr(),
        });
        if let Some(display_name) = &self.display_name {
            doc["displayName"] = json!(display_name);
        }
        if let Some(description) = &self.description {
            doc["description"] = json!(description);
        }
        if !self.tags.is_empty() {
            doc["tags"] = json!(self.tags.iter().collect::<Vec<_>>());
        }
        if !self.attributes.is_empty() {
            doc["attributes"] = json!(self
                .attributes
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect::<Vec<_>>());
        }
        doc
    }
}

/// A descriptor plus the location of the package it was discovered in,
/// used later to materialize the module's isolation boundary.
#[derive(Debug, Clone)]
pub struct MetaInfo {
    pub descriptor: ModuleDescriptor,
    pub source_location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    #[serde(rename = "type")]
    contract: String,
    name: String,
    version: String,
    implementation: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "wildcard_constraint")]
    product_constraint: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    attributes: Vec<RawAttribute>,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    name: String,
    value: String,
}

fn wildcard_constraint() -> String {
    "*".to_string()
}

/// Parses a descriptor resource: one descriptor object or an array of them.
/// `location` names the package for malformed-document errors; validation
/// errors name the offending descriptor's identity instead.
pub fn parse_descriptors(bytes: &[u8], location: &str) -> Result<Vec<ModuleDescriptor>> {
    let malformed = |reason: String| Error::MalformedDescriptor {
        location: location.to_string(),
        reason,
    };
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let raws: Vec<RawDescriptor> = if value.is_array() {
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?
    } else {
        vec![serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?]
    };
    raws.into_iter().map(validate).collect()
}

fn validate(raw: RawDescriptor) -> Result<ModuleDescriptor> {
    let identity = ModuleIdentity::new(raw.contract.trim(), raw.name.trim());
    if identity.contract.is_empty() || identity.name.is_empty() {
        return Err(Error::InvalidDescriptor {
            identity,
            reason: "type and name must be non-blank".to_string(),
        });
    }
    if raw.implementation.trim().is_empty() {
        return Err(Error::InvalidDescriptor {
            identity,
            reason: "implementation must be non-blank".to_string(),
        });
    }
    let version = version::parse_version(&raw.version)?;
    let product_constraint = Constraint::parse(&raw.product_constraint)?;
    let mut attributes = BTreeMap::new();
    for attr in raw.attributes {
        if attributes.insert(attr.name.clone(), attr.value).is_some() {
            return Err(Error::InvalidDescriptor {
                identity,
                reason: format!("duplicate attribute name '{}'", attr.name),
            });
        }
    }
    Ok(ModuleDescriptor {
        identity,
        version,
        product_constraint,
        implementation: raw.implementation,
        display_name: raw.display_name,
        description: raw.description,
        tags: raw.tags.into_iter().collect(),
        attributes,
    })
}
