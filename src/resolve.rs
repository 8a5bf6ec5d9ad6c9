//! Install-order resolution of package dependencies.
//!
//! The resolver works over anything package-shaped: catalog packages,
//! store records, or the mixed lists the graph builder accumulates.
//! Build-time ordering is handled elsewhere and is strict; the
//! ordering produced here is advisory, so cycles degrade to a warning
//! instead of an error.

use std::collections::HashMap;

use itertools::Itertools;

use crate::catalog::{Catalog, Package};
use crate::error::{BuildError, Result};
use crate::store::{BuiltPackage, BuiltPackages};

/// Anything with a name and install-time dependency groups.
pub trait PackageLike {
    fn name(&self) -> &str;

    /// OR-groups of candidate dependency names, in declaration order.
    fn dep_groups(&self) -> Vec<Vec<&str>>;
}

impl PackageLike for &Package {
    fn name(&self) -> &str {
        &self.name
    }

    fn dep_groups(&self) -> Vec<Vec<&str>> {
        self.deps
            .iter()
            .map(|group| group.iter().map(|dep| dep.name.as_str()).collect())
            .collect()
    }
}

impl PackageLike for &BuiltPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn dep_groups(&self) -> Vec<Vec<&str>> {
        self.deps.iter().map(|dep| vec![dep.as_str()]).collect()
    }
}

/// Uniform lookup over the heterogeneous dependency tables.
pub trait Lookup<T> {
    fn lookup(&self, name: &str) -> Option<T>;
}

impl<'a> Lookup<&'a Package> for &'a Catalog {
    fn lookup(&self, name: &str) -> Option<&'a Package> {
        self.package_by_name(name).map(|(_, package)| package)
    }
}

/// The versioned store table resolves to the `"latest"` entry.
impl<'a> Lookup<&'a BuiltPackage> for &'a BuiltPackages {
    fn lookup(&self, name: &str) -> Option<&'a BuiltPackage> {
        self.latest(name)
    }
}

enum Mark {
    Visiting,
    Done,
}

/// Topologically order `targets` so that every dependency precedes
/// its dependents, without duplicates. With `include_deps` the
/// transitive closure is emitted; without it only members of
/// `targets` appear, but the closure is still walked.
///
/// Install-time cycles are tolerated: the offender is reported once
/// and the cycle is broken by not re-entering the node.
pub fn resolve_deps<T, L>(targets: &[T], table: &L, include_deps: bool) -> Result<Vec<T>>
where
    T: PackageLike + Clone,
    L: Lookup<T>,
{
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut resolved = Vec::new();
    let wanted: Vec<&str> = targets.iter().map(|target| target.name()).collect();

    for target in targets.iter().rev() {
        visit(target.clone(), table, include_deps, &wanted, &mut marks, &mut resolved)?;
    }

    Ok(resolved)
}

fn visit<T, L>(
    item: T,
    table: &L,
    include_deps: bool,
    wanted: &[&str],
    marks: &mut HashMap<String, Mark>,
    resolved: &mut Vec<T>,
) -> Result<()>
where
    T: PackageLike + Clone,
    L: Lookup<T>,
{
    if matches!(marks.get(item.name()), Some(Mark::Done)) {
        return Ok(());
    }
    marks.insert(item.name().to_string(), Mark::Visiting);

    for group in item.dep_groups() {
        let dep = group
            .iter()
            .find_map(|candidate| table.lookup(candidate))
            .ok_or_else(|| BuildError::UnsatisfiableDep {
                dep: group.iter().join(" OR "),
                package: item.name().to_string(),
            })?;

        match marks.get(dep.name()) {
            Some(Mark::Done) => {}
            Some(Mark::Visiting) => {
                tracing::warn!(
                    "package '{}' will be installed before its dependency '{}'",
                    item.name(),
                    dep.name()
                );
            }
            None => visit(dep, table, include_deps, wanted, marks, resolved)?,
        }
    }

    marks.insert(item.name().to_string(), Mark::Done);
    if include_deps || wanted.contains(&item.name()) {
        resolved.push(item);
    }
    Ok(())
}
