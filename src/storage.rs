//! Package sources — readable containers of module resources.
//!
//! The core only depends on the two narrow traits here; the default
//! implementation enumerates zip archives and exploded package directories
//! recursively under a base directory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use zip::ZipArchive;

use crate::contract::CONTRACTS_RESOURCE;
use crate::descriptor::DESCRIPTOR_RESOURCE;
use crate::error::{Error, Result};

/// A readable container of resources plus a base location.
pub trait Package: Send + Sync {
    /// Location identifier for the package, a `file://` URL for the
    /// default implementations.
    fn base_location(&self) -> &str;

    fn contains(&self, resource: &str) -> bool;

    fn read(&self, resource: &str) -> Result<Vec<u8>>;
}

/// A repository listing the packages visible to the manager.
pub trait PackageRepository: Send + Sync {
    fn list_packages(&self) -> Result<Vec<Box<dyn Package>>>;

    /// The subset of packages whose base location is in `locations`,
    /// in listing order. Used to materialize isolation boundaries.
    fn packages_at(&self, locations: &[String]) -> Result<Vec<Box<dyn Package>>> {
        Ok(self
            .list_packages()?
            .into_iter()
            .filter(|p| locations.iter().any(|l| l == p.base_location()))
            .collect())
    }
}

/// Strips `file://` / `file:` prefixes from a location identifier.
pub fn location_to_path(location: &str) -> PathBuf {
    let stripped = location
        .strip_prefix("file://")
        .or_else(|| location.strip_prefix("file:"))
        .unwrap_or(location);
    PathBuf::from(stripped)
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// An exploded package: a directory whose files are the resources.
pub struct DirPackage {
    root: PathBuf,
    location: String,
}

impl DirPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let location = file_url(&root);
        Self { root, location }
    }
}

impl Package for DirPackage {
    fn base_location(&self) -> &str {
        &self.location
    }

    fn contains(&self, resource: &str) -> bool {
        self.root.join(resource).is_file()
    }

    fn read(&self, resource: &str) -> Result<Vec<u8>> {
        fs::read(self.root.join(resource)).map_err(|e| Error::ResourceRead {
            location: self.location.clone(),
            resource: resource.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A zip archive package; entry names are the resource names.
pub struct ZipPackage {
    archive: Mutex<ZipArchive<fs::File>>,
    location: String,
}

impl ZipPackage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let location = file_url(&path);
        let scan_err = |reason: String| Error::RepositoryScan {
            location: location.clone(),
            reason,
        };
        let file = fs::File::open(&path).map_err(|e| scan_err(e.to_string()))?;
        let archive = ZipArchive::new(file).map_err(|e| scan_err(e.to_string()))?;
        Ok(Self {
            archive: Mutex::new(archive),
            location,
        })
    }
}

impl Package for ZipPackage {
    fn base_location(&self) -> &str {
        &self.location
    }

    fn contains(&self, resource: &str) -> bool {
        let archive = self
            .archive
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let found = archive.file_names().any(|n| n == resource);
        found
    }

    fn read(&self, resource: &str) -> Result<Vec<u8>> {
        let read_err = |reason: String| Error::ResourceRead {
            location: self.location.clone(),
            resource: resource.to_string(),
            reason,
        };
        let mut archive = self
            .archive
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entry = archive
            .by_name(resource)
            .map_err(|e| read_err(e.to_string()))?;
        // sized by read_to_end, not by the (untrusted) entry header
        let mut out = Vec::new();
        entry
            .read_to_end(&mut out)
            .map_err(|e| read_err(e.to_string()))?;
        Ok(out)
    }
}

/// Default repository: walks a base directory recursively, picking up
/// `.zip` archives and exploded package directories (any directory that
/// directly contains a descriptor or contract-registry resource). Hidden
/// directories are skipped. The listing is sorted by path, which keeps
/// reconciliation tie-breaks deterministic.
pub struct DirRepository {
    base: PathBuf,
}

impl DirRepository {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Accepts a plain path or a `file://` location.
    pub fn from_location(location: &str) -> Self {
        Self::new(location_to_path(location))
    }
}

impl PackageRepository for DirRepository {
    fn list_packages(&self) -> Result<Vec<Box<dyn Package>>> {
        let mut packages: Vec<Box<dyn Package>> = Vec::new();
        if !self.base.is_dir() {
            debug!(base = %self.base.display(), "package repository directory missing; listing empty");
            return Ok(packages);
        }
        walk(&self.base, &mut packages)?;
        Ok(packages)
    }
}

fn walk(dir: &Path, packages: &mut Vec<Box<dyn Package>>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::RepositoryScan {
            location: file_url(dir),
            reason: e.to_string(),
        })?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') {
            continue;
        }
        if path.is_file() {
            if name.ends_with(".zip") {
                packages.push(Box::new(ZipPackage::open(&path)?));
            }
        } else if path.is_dir() {
            if path.join(DESCRIPTOR_RESOURCE).is_file()
                || path.join(CONTRACTS_RESOURCE).is_file()
            {
                packages.push(Box::new(DirPackage::new(&path)));
            } else {
                walk(&path, packages)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_exploded(base: &Path, name: &str, descriptor: &str) -> PathBuf {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DESCRIPTOR_RESOURCE), descriptor).unwrap();
        dir
    }

    #[test]
    fn lists_exploded_packages_recursively_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        write_exploded(tmp.path(), "b-pkg", "{}");
        write_exploded(&tmp.path().join("nested"), "a-pkg", "{}");

        let repo = DirRepository::new(tmp.path());
        let packages = repo.list_packages().unwrap();
        assert_eq!(packages.len(), 2);
        assert!(packages[0].base_location().ends_with("b-pkg"));
        assert!(packages[1].base_location().ends_with("a-pkg"));
    }

    #[test]
    fn skips_hidden_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_exploded(tmp.path(), ".hidden", "{}");
        write_exploded(tmp.path(), "visible", "{}");

        let repo = DirRepository::new(tmp.path());
        let packages = repo.list_packages().unwrap();
        assert_eq!(packages.len(), 1);
        assert!(packages[0].base_location().ends_with("visible"));
    }

    #[test]
    fn missing_base_directory_lists_empty() {
        let repo = DirRepository::new("/definitely/not/here");
        assert!(repo.list_packages().unwrap().is_empty());
    }

    #[test]
    fn zip_packages_are_discovered_and_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("pkg.zip");
        let file = fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(DESCRIPTOR_RESOURCE, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"{\"k\": 1}").unwrap();
        writer.finish().unwrap();

        let repo = DirRepository::new(tmp.path());
        let packages = repo.list_packages().unwrap();
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        assert!(pkg.contains(DESCRIPTOR_RESOURCE));
        assert!(!pkg.contains("other.txt"));
        assert_eq!(pkg.read(DESCRIPTOR_RESOURCE).unwrap(), b"{\"k\": 1}");
    }

    #[test]
    fn packages_at_filters_by_location() {
        let tmp = tempfile::tempdir().unwrap();
        let wanted = write_exploded(tmp.path(), "wanted", "{}");
        write_exploded(tmp.path(), "unwanted", "{}");

        let repo = DirRepository::new(tmp.path());
        let location = format!("file://{}", wanted.display());
        let subset = repo.packages_at(&[location.clone()]).unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].base_location(), location);
    }

    #[test]
    fn location_to_path_strips_file_schemes() {
        assert_eq!(location_to_path("file:///a/b"), PathBuf::from("/a/b"));
        assert_eq!(location_to_path("file:/a/b"), PathBuf::from("/a/b"));
        assert_eq!(location_to_path("/a/b"), PathBuf::from("/a/b"));
    }

    #[test]
    fn dir_package_read_error_names_resource_and_location() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_exploded(tmp.path(), "pkg", "{}");
        let pkg = DirPackage::new(&dir);
        let err = pkg.read("absent.txt").unwrap_err();
        match err {
            Error::ResourceRead { resource, .. } => assert_eq!(resource, "absent.txt"),
            other => panic!("expected ResourceRead, got {other}"),
        }
    }
}
