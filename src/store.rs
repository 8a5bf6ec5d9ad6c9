//! Read the on-disk store of built and installed packages.
//!
//! Layout under `<rootfs>/usr/pkg/`:
//!
//! - `<name>/<version>/` — a built package root
//! - `<name>/<version>/.deps/<depname>` — dependency link; only the
//!   link name carries information
//! - `<name>/latest` — symlink to the currently latest version
//! - `installed/<name>` — symlink into `<name>/<version>`, marking
//!   the package as installed on the target
//! - `version` — reserved file, ignored

use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BuildError, Result};

pub const PACKAGE_DIR: &str = "usr/pkg";
const RESERVED_NAMES: [&str; 2] = ["version", "installed"];
const LATEST_LINK: &str = "latest";
const DEPS_DIR: &str = ".deps";

/// A store record, reconstructed from the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPackage {
    pub name: String,
    pub version: String,
    pub deps: Vec<String>,
}

impl BuiltPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            deps: Vec::new(),
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|dep| dep.to_string()).collect();
        self
    }

    /// Reconstruct a record from a `<store>/<name>/<version>` directory.
    pub fn from_fs(path: &Utf8Path) -> Result<Self> {
        let version = path
            .file_name()
            .ok_or_else(|| BuildError::Store(format!("invalid package path {path}")))?;
        let name = path
            .parent()
            .and_then(Utf8Path::file_name)
            .ok_or_else(|| BuildError::Store(format!("invalid package path {path}")))?;

        let mut deps = Vec::new();
        let deps_dir = path.join(DEPS_DIR);
        if deps_dir.exists() {
            for entry in read_dir(&deps_dir)? {
                deps.push(entry.file_name().to_string());
            }
            deps.sort_unstable();
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            deps,
        })
    }
}

/// All built packages, keyed by name and then by version. The extra
/// `"latest"` key aliases the version the `latest` symlink points at.
#[derive(Debug, Clone, Default)]
pub struct BuiltPackages(HashMap<String, HashMap<String, BuiltPackage>>);

impl BuiltPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under its version key; with `latest` it is
    /// aliased under `"latest"` as well.
    pub fn insert(&mut self, built: BuiltPackage, latest: bool) {
        let versions = self.0.entry(built.name.clone()).or_default();
        if latest {
            versions.insert(LATEST_LINK.into(), built.clone());
        }
        versions.insert(built.version.clone(), built);
    }

    pub fn latest(&self, name: &str) -> Option<&BuiltPackage> {
        self.0.get(name)?.get(LATEST_LINK)
    }

    pub fn get(&self, name: &str, version: &str) -> Option<&BuiltPackage> {
        self.0.get(name)?.get(version)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn contains_version(&self, name: &str, version: &str) -> bool {
        self.get(name, version).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn versions(&self, name: &str) -> Option<&HashMap<String, BuiltPackage>> {
        self.0.get(name)
    }
}

/// Enumerates built and installed packages under a rootfs.
#[derive(Debug, Clone)]
pub struct StoreReader {
    store_dir: Utf8PathBuf,
}

impl StoreReader {
    pub fn new(rootfs: impl AsRef<Utf8Path>) -> Self {
        Self {
            store_dir: rootfs.as_ref().join(PACKAGE_DIR),
        }
    }

    /// All packages present in the store, including the `"latest"`
    /// alias per name. A missing store root yields an empty result; a
    /// missing or dangling `latest` link is an error.
    pub fn built_packages(&self) -> Result<BuiltPackages> {
        let mut result = BuiltPackages::new();

        if !self.store_dir.exists() {
            return Ok(result);
        }

        for entry in read_dir(&self.store_dir)? {
            let name = entry.file_name();
            if RESERVED_NAMES.contains(&name) || !entry.path().is_dir() {
                continue;
            }

            let mut latest_version = None;
            for version_entry in read_dir(entry.path())? {
                if version_entry.file_name() == LATEST_LINK {
                    latest_version = Some(link_file_name(version_entry.path())?);
                    continue;
                }
                result.insert(BuiltPackage::from_fs(version_entry.path())?, false);
            }

            let latest_version = latest_version.ok_or_else(|| {
                BuildError::Store(format!("missing 'latest' link for package '{name}'"))
            })?;
            let latest = result.get(name, &latest_version).cloned().ok_or_else(|| {
                BuildError::Store(format!(
                    "dangling 'latest' link for package '{name}': no version {latest_version}"
                ))
            })?;
            result.insert(latest, true);
        }

        Ok(result)
    }

    /// Packages marked installed on the target, resolved through the
    /// links under `<store>/installed/`.
    pub fn installed_packages(&self) -> Result<HashMap<String, BuiltPackage>> {
        let mut result = HashMap::new();

        let installed_dir = self.store_dir.join("installed");
        if !installed_dir.exists() {
            return Ok(result);
        }

        let store_canonical = canonicalize(&self.store_dir)?;
        for entry in read_dir(&installed_dir)? {
            let target = canonicalize(entry.path())?;
            let grandparent = target.parent().and_then(Utf8Path::parent);
            if grandparent != Some(store_canonical.as_path()) {
                return Err(BuildError::Store(format!(
                    "installed link '{}' does not point two levels into the store",
                    entry.file_name()
                )));
            }
            let installed = BuiltPackage::from_fs(&target)?;
            result.insert(installed.name.clone(), installed);
        }

        Ok(result)
    }
}

fn read_dir(path: &Utf8Path) -> Result<Vec<camino::Utf8DirEntry>> {
    path.read_dir_utf8()
        .and_then(Iterator::collect)
        .map_err(|err| BuildError::Store(format!("couldn't read {path}: {err}")))
}

fn canonicalize(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let resolved = fs::canonicalize(path)
        .map_err(|err| BuildError::Store(format!("couldn't resolve {path}: {err}")))?;
    Utf8PathBuf::from_path_buf(resolved)
        .map_err(|resolved| BuildError::Store(format!("non-UTF-8 store path {resolved:?}")))
}

/// Final path component of a symlink's target.
fn link_file_name(link: &Utf8Path) -> Result<String> {
    let target = fs::read_link(link)
        .map_err(|err| BuildError::Store(format!("couldn't read link {link}: {err}")))?;
    target
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| BuildError::Store(format!("invalid link target for {link}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::fs::symlink;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    /// Lay out one `<name>/<version>` entry the way the target system
    /// does, refreshing the `latest` link.
    pub(crate) fn create_package(
        rootfs: &Utf8Path,
        name: &str,
        version: &str,
        deps: &[&str],
        installed: bool,
    ) {
        let store = rootfs.join(PACKAGE_DIR);
        let package_dir = store.join(name).join(version);
        fs::create_dir_all(&package_dir).unwrap();

        let latest = store.join(name).join(LATEST_LINK);
        let _ = fs::remove_file(&latest);
        symlink(version, &latest).unwrap();

        if !deps.is_empty() {
            let deps_dir = package_dir.join(DEPS_DIR);
            fs::create_dir_all(&deps_dir).unwrap();
            for dep in deps {
                symlink(
                    Utf8PathBuf::from("../../..").join(dep),
                    deps_dir.join(dep),
                )
                .unwrap();
            }
        }

        if installed {
            fs::create_dir_all(store.join("installed")).unwrap();
            symlink(
                Utf8PathBuf::from("..").join(name).join(version),
                store.join("installed").join(name),
            )
            .unwrap();
        }
    }

    fn rootfs() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("root")).unwrap();
        (dir, path)
    }

    #[test]
    fn built_packages_of_missing_store_are_empty() {
        let (_guard, rootfs) = rootfs();
        let reader = StoreReader::new(&rootfs);
        assert!(reader.built_packages().unwrap().is_empty());
        assert!(reader.installed_packages().unwrap().is_empty());
    }

    #[test]
    fn built_packages_enumerates_versions_and_latest() {
        let (_guard, rootfs) = rootfs();
        fs::create_dir_all(rootfs.join(PACKAGE_DIR)).unwrap();
        fs::write(rootfs.join(PACKAGE_DIR).join("version"), "").unwrap();
        create_package(&rootfs, "built", "1.0.0", &[], true);
        create_package(&rootfs, "built2", "1.0.0", &["built"], false);
        create_package(&rootfs, "built2", "2.0.0", &[], false);

        let built = StoreReader::new(&rootfs).built_packages().unwrap();

        assert_eq!(
            built.get("built", "1.0.0"),
            Some(&BuiltPackage::new("built", "1.0.0"))
        );
        assert_eq!(built.latest("built"), Some(&BuiltPackage::new("built", "1.0.0")));
        assert_eq!(
            built.get("built2", "1.0.0"),
            Some(&BuiltPackage::new("built2", "1.0.0").with_deps(&["built"]))
        );
        assert_eq!(
            built.get("built2", "2.0.0"),
            Some(&BuiltPackage::new("built2", "2.0.0"))
        );
        assert_eq!(
            built.latest("built2"),
            Some(&BuiltPackage::new("built2", "2.0.0"))
        );
        assert_eq!(built.versions("built2").unwrap().len(), 3);
    }

    #[test]
    fn missing_latest_link_is_fatal() {
        let (_guard, rootfs) = rootfs();
        let package_dir = rootfs.join(PACKAGE_DIR).join("broken").join("1.0.0");
        fs::create_dir_all(&package_dir).unwrap();

        let err = StoreReader::new(&rootfs).built_packages().unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing 'latest' link for package 'broken'"
        );
    }

    #[test]
    fn dangling_latest_link_is_fatal() {
        let (_guard, rootfs) = rootfs();
        create_package(&rootfs, "broken", "1.0.0", &[], false);
        let latest = rootfs.join(PACKAGE_DIR).join("broken").join(LATEST_LINK);
        fs::remove_file(&latest).unwrap();
        symlink("2.0.0", &latest).unwrap();

        let err = StoreReader::new(&rootfs).built_packages().unwrap_err();
        assert_eq!(
            err.to_string(),
            "dangling 'latest' link for package 'broken': no version 2.0.0"
        );
    }

    #[test]
    fn installed_packages_resolves_links() {
        let (_guard, rootfs) = rootfs();
        create_package(&rootfs, "notinstalled", "1.0.0", &[], false);
        create_package(&rootfs, "installed-pkg", "1.0.0", &[], true);
        create_package(&rootfs, "installed-pkg2", "1.0.0", &["installed-pkg"], true);

        let installed = StoreReader::new(&rootfs).installed_packages().unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(
            installed["installed-pkg"],
            BuiltPackage::new("installed-pkg", "1.0.0")
        );
        assert_eq!(
            installed["installed-pkg2"],
            BuiltPackage::new("installed-pkg2", "1.0.0").with_deps(&["installed-pkg"])
        );
    }

    #[test]
    fn installed_link_outside_the_store_is_fatal() {
        let (_guard, rootfs) = rootfs();
        create_package(&rootfs, "ok", "1.0.0", &[], false);
        let installed_dir = rootfs.join(PACKAGE_DIR).join("installed");
        fs::create_dir_all(&installed_dir).unwrap();
        symlink(rootfs.join(PACKAGE_DIR).join("ok"), installed_dir.join("ok")).unwrap();

        let err = StoreReader::new(&rootfs).installed_packages().unwrap_err();
        assert!(err
            .to_string()
            .contains("does not point two levels into the store"));
    }
}
