//! Catalog data model: builds, the packages they produce, their
//! dependencies and their remote sources.
//!
//! The catalog is produced by an external ingestion layer and is
//! read-only for the rest of the crate. Builds own their packages;
//! cross-references go through [`BuildId`] and [`PackageId`] so the
//! arena stays free of ownership cycles.

use std::collections::HashMap;
use std::fmt;

use camino::Utf8PathBuf;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// A single named requirement inside an OR-group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Satisfied only by an entry already present in the store, never
    /// by scheduling a build.
    #[serde(default)]
    pub select_built: bool,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            select_built: false,
        }
    }

    pub fn built(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            select_built: true,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.select_built {
            write!(f, "{}:built", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// `A OR B`: an ordered, nonempty list of alternatives, exactly one
/// of which has to be satisfiable.
pub type DepGroup = Vec<Dependency>;

/// Render an OR-group the way it appears in diagnostics.
pub fn render_group(group: &DepGroup) -> String {
    group.iter().map(ToString::to_string).join(" OR ")
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    Git,
    Local,
}

/// Where a git source is pinned. A branch alone would be a moving
/// target, so it always carries the expected commit as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitRev {
    Tag(String),
    Commit(String),
    Branch { branch: String, commit: String },
}

/// A remote (or local) input consumed by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Http {
        url: String,
        sha256sum: Option<String>,
        gpgsig: Option<String>,
        gpgkey: Option<Utf8PathBuf>,
    },
    Git {
        url: String,
        sha256sum: String,
        rev: GitRev,
    },
    Local {
        url: String,
        abs_path: Utf8PathBuf,
    },
}

impl Source {
    pub fn http(url: impl Into<String>, sha256sum: impl Into<String>) -> Self {
        Source::Http {
            url: url.into(),
            sha256sum: Some(sha256sum.into()),
            gpgsig: None,
            gpgkey: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Http { .. } => SourceKind::Http,
            Source::Git { .. } => SourceKind::Git,
            Source::Local { .. } => SourceKind::Local,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Source::Http { url, .. } | Source::Git { url, .. } | Source::Local { url, .. } => url,
        }
    }

    pub fn gpgsig(&self) -> Option<&str> {
        match self {
            Source::Http { gpgsig, .. } => gpgsig.as_deref(),
            _ => None,
        }
    }

    pub fn sha256sum(&self) -> Option<&str> {
        match self {
            Source::Http { sha256sum, .. } => sha256sum.as_deref(),
            Source::Git { sha256sum, .. } => Some(sha256sum),
            Source::Local { .. } => None,
        }
    }

    /// How many fetches a download job for this source performs: the
    /// source itself, plus its detached signature if it has one.
    pub fn download_total(&self) -> usize {
        match self.gpgsig() {
            Some(_) => 2,
            None => 1,
        }
    }
}

/// One opaque shell-session entry of a build or hook script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    pub expected_output: Option<String>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            expected_output: None,
        }
    }
}

/// An installable artifact produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Install-time dependencies. Ordering is advisory: cycles here
    /// are tolerated by the resolver.
    pub deps: Vec<DepGroup>,
    pub install: bool,
    pub pre_install: Vec<Command>,
    pub post_install: Vec<Command>,
    pub pre_upgrade: Vec<Command>,
    pub post_upgrade: Vec<Command>,
    pub pre_remove: Vec<Command>,
    pub post_remove: Vec<Command>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deps: Vec::new(),
            install: true,
            pre_install: Vec::new(),
            post_install: Vec::new(),
            pre_upgrade: Vec::new(),
            post_upgrade: Vec::new(),
            pre_remove: Vec::new(),
            post_remove: Vec::new(),
        }
    }

    pub fn with_deps(mut self, deps: Vec<DepGroup>) -> Self {
        self.deps = deps;
        self
    }
}

/// The unit of work: builds one or more packages from its sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub name: String,
    pub version: String,
    pub build_deps: Vec<DepGroup>,
    pub sources: Vec<Source>,
    pub bootstrap: bool,
    pub build_steps: Vec<Command>,
    pub packages: Vec<Package>,
}

impl Build {
    /// A build producing a single package of the same name.
    pub fn package(name: impl Into<String>) -> Self {
        let name = name.into();
        Build {
            packages: vec![Package::new(name.as_str())],
            name,
            ..Default::default()
        }
    }
}

impl Default for Build {
    fn default() -> Self {
        Build {
            name: String::new(),
            version: "0.0.0".into(),
            build_deps: Vec::new(),
            sources: Vec::new(),
            bootstrap: false,
            build_steps: Vec::new(),
            packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildId(usize);

/// Index of a package inside its producing build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId {
    build: BuildId,
    package: usize,
}

impl PackageId {
    pub fn build(&self) -> BuildId {
        self.build
    }
}

/// Arena of all builds and packages of one document set.
#[derive(Debug, Default)]
pub struct Catalog {
    builds: Vec<Build>,
    by_build_name: HashMap<String, BuildId>,
    by_package_name: HashMap<String, PackageId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a build and index it and its packages by name.
    pub fn add_build(&mut self, build: Build) -> Result<BuildId> {
        if self.by_build_name.contains_key(&build.name) {
            return Err(BuildError::Catalog(format!(
                "duplicate build declaration of '{}'",
                build.name
            )));
        }
        let id = BuildId(self.builds.len());
        for (index, package) in build.packages.iter().enumerate() {
            if self.by_package_name.contains_key(&package.name) {
                return Err(BuildError::Catalog(format!(
                    "duplicate package declaration of '{}'",
                    package.name
                )));
            }
            self.by_package_name
                .insert(package.name.clone(), PackageId { build: id, package: index });
        }
        self.by_build_name.insert(build.name.clone(), id);
        self.builds.push(build);
        Ok(id)
    }

    pub fn build(&self, id: BuildId) -> &Build {
        &self.builds[id.0]
    }

    pub fn build_by_name(&self, name: &str) -> Option<(BuildId, &Build)> {
        let id = *self.by_build_name.get(name)?;
        Some((id, self.build(id)))
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.builds[id.build.0].packages[id.package]
    }

    pub fn package_by_name(&self, name: &str) -> Option<(PackageId, &Package)> {
        let id = *self.by_package_name.get(name)?;
        Some((id, self.package(id)))
    }

    /// A package's version is the version of the build producing it.
    pub fn package_version(&self, id: PackageId) -> &str {
        &self.builds[id.build.0].version
    }

    pub fn builds(&self) -> impl Iterator<Item = (BuildId, &Build)> {
        self.builds
            .iter()
            .enumerate()
            .map(|(index, build)| (BuildId(index), build))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_rendering() {
        let group = vec![Dependency::built("nonexistent"), Dependency::new("fallback")];
        assert_eq!(render_group(&group), "nonexistent:built OR fallback");
    }

    #[test]
    fn download_total_counts_the_detached_signature() {
        let plain = Source::http("http://host/src", "a");
        assert_eq!(plain.download_total(), 1);

        let signed = Source::Http {
            url: "http://host/src".into(),
            sha256sum: None,
            gpgsig: Some("http://host/src.sig".into()),
            gpgkey: Some("keys/upstream.gpg".into()),
        };
        assert_eq!(signed.download_total(), 2);
    }

    #[test]
    fn add_build_rejects_duplicates() {
        let mut catalog = Catalog::new();
        catalog.add_build(Build::package("foo")).unwrap();

        let err = catalog.add_build(Build::package("foo")).unwrap_err();
        assert_eq!(err.to_string(), "duplicate build declaration of 'foo'");

        let err = catalog
            .add_build(Build {
                name: "other".into(),
                packages: vec![Package::new("foo")],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "duplicate package declaration of 'foo'");
    }

    #[test]
    fn package_lookup_goes_through_the_producing_build() {
        let mut catalog = Catalog::new();
        let id = catalog
            .add_build(Build {
                name: "toolchain".into(),
                version: "1.2.0".into(),
                packages: vec![Package::new("cc"), Package::new("ld")],
                ..Default::default()
            })
            .unwrap();

        let (pkg_id, package) = catalog.package_by_name("ld").unwrap();
        assert_eq!(package.name, "ld");
        assert_eq!(pkg_id.build(), id);
        assert_eq!(catalog.package_version(pkg_id), "1.2.0");
    }
}
