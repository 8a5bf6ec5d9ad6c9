//! Turn target builds plus the built store into an executable DAG of
//! jobs.
//!
//! Nodes are builds that actually need building, deduplicated
//! downloads for their remote sources, and no-op synchronization
//! points for builds whose packages are all present in the store.
//! Edges mean "must complete before". Build-time cycles are fatal
//! here; install-time cycles are the resolver's business.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::catalog::{
    render_group, BuildId, Catalog, Package, PackageId, Source, SourceKind,
};
use crate::error::{BuildError, Result};
use crate::resolve::{resolve_deps, Lookup, PackageLike};
use crate::store::{BuiltPackage, BuiltPackages};

/// A build-time dependency pinned to what will satisfy it: a catalog
/// package scheduled for building, or a record from the store.
#[derive(Debug, Clone)]
pub enum ResolvedBuildDep {
    Pkg(PackageId),
    Built(BuiltPackage),
}

impl ResolvedBuildDep {
    pub fn name<'a>(&'a self, catalog: &'a Catalog) -> &'a str {
        match self {
            ResolvedBuildDep::Pkg(id) => &catalog.package(*id).name,
            ResolvedBuildDep::Built(built) => &built.name,
        }
    }

    pub fn version<'a>(&'a self, catalog: &'a Catalog) -> &'a str {
        match self {
            ResolvedBuildDep::Pkg(id) => catalog.package_version(*id),
            ResolvedBuildDep::Built(built) => &built.version,
        }
    }
}

#[derive(Debug)]
pub enum Job {
    /// Pure dependency edge, no work.
    Nop { name: String },
    Build {
        build: BuildId,
        /// Full transitive install order materialized in the sandbox
        /// before the build steps run.
        resolved_build_deps: Vec<ResolvedBuildDep>,
    },
    Download {
        source: Arc<Source>,
        /// Fetches this job performs (source, plus detached signature).
        download_total: usize,
    },
}

#[derive(Debug)]
pub struct JobNode {
    pub job: Job,
    /// `1 + max(successor priorities)`; leaves are 1. Deeper chains
    /// below a job schedule it earlier.
    pub priority: u32,
}

/// The executable job DAG, rooted in a single no-op.
#[derive(Debug)]
pub struct BuildJobGraph {
    graph: DiGraph<JobNode, ()>,
    root: NodeIndex,
    /// Build and download jobs; no-ops don't count.
    job_count: usize,
}

impl BuildJobGraph {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }

    pub fn node(&self, node: NodeIndex) -> &JobNode {
        &self.graph[node]
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn num_incident(&self, node: NodeIndex) -> usize {
        self.graph.edges_directed(node, Direction::Incoming).count()
    }

    /// Out-neighbors in edge insertion order.
    pub fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut successors: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        successors.reverse();
        successors
    }

    pub fn label(&self, catalog: &Catalog, node: NodeIndex) -> String {
        match &self.graph[node].job {
            Job::Nop { name } => format!("NopJob({name})"),
            Job::Build { build, .. } => format!("BuildJob({})", catalog.build(*build).name),
            Job::Download { source, .. } => format!("DownloadJob({})", source.url()),
        }
    }

    /// Graphviz rendering of the graph, breadth-first from the root.
    /// With `dump_deps` each build job also lists its resolved
    /// build-time dependency closure.
    pub fn dot(&self, catalog: &Catalog, dump_deps: bool) -> String {
        let mut out = String::from("digraph dump {\n");
        let _ = writeln!(out, "  graph [label=\"job_count: {}\"];", self.job_count);

        let mut queue = VecDeque::from([self.root]);
        let mut seen = HashSet::from([self.root]);
        while let Some(node) = queue.pop_front() {
            out.push('\n');
            let name = self.label(catalog, node);

            let mut label = format!(
                "{name}\\nnum_incident: {}\\npriority: {}",
                self.num_incident(node),
                self.graph[node].priority
            );
            if dump_deps {
                if let Job::Build {
                    resolved_build_deps, ..
                } = &self.graph[node].job
                {
                    label.push_str("\\nresolved_build_deps:\\n");
                    for dep in resolved_build_deps {
                        let _ = write!(label, "{}-{}\\n", dep.name(catalog), dep.version(catalog));
                    }
                }
            }
            let _ = writeln!(out, "  \"{name}\" [label=\"{label}\"];");

            for successor in self.successors(node) {
                let _ = writeln!(out, "  \"{name}\" -> \"{}\";", self.label(catalog, successor));
                if seen.insert(successor) {
                    queue.push_back(successor);
                }
            }
        }

        out.push('}');
        out
    }
}

/// Build the job graph for `targets`, deduplicating downloads and
/// failing on build-time dependency cycles.
pub fn create_build_job_graph(
    targets: &[BuildId],
    catalog: &Catalog,
    store: &BuiltPackages,
) -> Result<BuildJobGraph> {
    let mut graph = DiGraph::new();
    let root = graph.add_node(JobNode {
        job: Job::Nop { name: "root".into() },
        priority: 0,
    });

    let mut builder = GraphBuilder {
        catalog,
        store,
        graph,
        root,
        jobs: HashMap::new(),
        visiting: HashSet::new(),
        downloads: HashMap::new(),
        job_count: 0,
    };

    for target in targets {
        builder.add_build_job(*target)?;
    }
    builder.assign_priorities();

    Ok(BuildJobGraph {
        graph: builder.graph,
        root,
        job_count: builder.job_count,
    })
}

struct GraphBuilder<'a> {
    catalog: &'a Catalog,
    store: &'a BuiltPackages,
    graph: DiGraph<JobNode, ()>,
    root: NodeIndex,
    jobs: HashMap<BuildId, NodeIndex>,
    visiting: HashSet<BuildId>,
    downloads: HashMap<(SourceKind, String), NodeIndex>,
    job_count: usize,
}

impl<'a> GraphBuilder<'a> {
    fn add_build_job(&mut self, id: BuildId) -> Result<NodeIndex> {
        let catalog = self.catalog;
        let store = self.store;
        let build = catalog.build(id);

        if self.visiting.contains(&id) {
            return Err(BuildError::DependencyCycle {
                cycle: vec![build.name.clone()],
            });
        }
        if let Some(&node) = self.jobs.get(&id) {
            return Ok(node);
        }

        let need_build = !build
            .packages
            .iter()
            .all(|package| store.contains_version(&package.name, &build.version));

        let node = self.graph.add_node(JobNode {
            job: if need_build {
                Job::Build {
                    build: id,
                    resolved_build_deps: Vec::new(),
                }
            } else {
                Job::Nop {
                    name: build.name.clone(),
                }
            },
            priority: 0,
        });
        if need_build {
            self.job_count += 1;
        }
        self.visiting.insert(id);

        let mut build_deps: Vec<BuildDepRef<'a>> = Vec::new();
        for group in &build.build_deps {
            let mut satisfied = false;
            for dep in group {
                if dep.select_built {
                    let Some(latest) = store.latest(&dep.name) else {
                        continue;
                    };
                    if need_build {
                        build_deps.push(BuildDepRef::Built(latest));
                    }
                    satisfied = true;
                    break;
                }

                let Some((package_id, package)) = catalog.package_by_name(&dep.name) else {
                    continue;
                };
                if need_build {
                    build_deps.push(BuildDepRef::Pkg(package_id, package));
                }
                let dep_node = match self.add_build_job(package_id.build()) {
                    Err(BuildError::DependencyCycle { mut cycle }) => {
                        let closed = cycle.len() > 1 && cycle.first() == cycle.last();
                        if !closed {
                            cycle.push(build.name.clone());
                        }
                        return Err(BuildError::DependencyCycle { cycle });
                    }
                    other => other?,
                };
                self.graph.add_edge(dep_node, node, ());
                satisfied = true;
                break;
            }

            if !satisfied {
                return Err(BuildError::UnsatisfiableBuildDep {
                    group: render_group(group),
                    build: build.name.clone(),
                });
            }
        }

        if need_build {
            let lookup = BuildDepLookup { catalog, store };
            let resolved: Vec<ResolvedBuildDep> = resolve_deps(&build_deps, &lookup, true)?
                .into_iter()
                .map(BuildDepRef::into_resolved)
                .collect();
            if let Job::Build {
                resolved_build_deps,
                ..
            } = &mut self.graph[node].job
            {
                *resolved_build_deps = resolved;
            }
        }

        self.visiting.remove(&id);
        self.jobs.insert(id, node);

        if need_build {
            for source in &build.sources {
                if source.kind() == SourceKind::Local {
                    continue;
                }
                let key = (source.kind(), source.url().to_string());
                let download = match self.downloads.get(&key) {
                    Some(&download) => download,
                    None => {
                        let download = self.graph.add_node(JobNode {
                            job: Job::Download {
                                source: Arc::new(source.clone()),
                                download_total: source.download_total(),
                            },
                            priority: 0,
                        });
                        self.job_count += 1;
                        self.graph.add_edge(self.root, download, ());
                        self.downloads.insert(key, download);
                        download
                    }
                };
                self.graph.add_edge(download, node, ());
            }
        }

        if self
            .graph
            .edges_directed(node, Direction::Incoming)
            .next()
            .is_none()
        {
            self.graph.add_edge(self.root, node, ());
        }

        Ok(node)
    }

    fn assign_priorities(&mut self) {
        let mut memo = HashMap::new();
        priority_of(&mut self.graph, &mut memo, self.root);
    }
}

fn priority_of(
    graph: &mut DiGraph<JobNode, ()>,
    memo: &mut HashMap<NodeIndex, u32>,
    node: NodeIndex,
) -> u32 {
    if let Some(&priority) = memo.get(&node) {
        return priority;
    }
    let children: Vec<NodeIndex> = graph.neighbors(node).collect();
    let priority = 1 + children
        .into_iter()
        .map(|child| priority_of(graph, memo, child))
        .max()
        .unwrap_or(0);
    graph[node].priority = priority;
    memo.insert(node, priority);
    priority
}

/// A build-time dependency while the graph is under construction.
#[derive(Clone, Copy)]
enum BuildDepRef<'a> {
    Pkg(PackageId, &'a Package),
    Built(&'a BuiltPackage),
}

impl BuildDepRef<'_> {
    fn into_resolved(self) -> ResolvedBuildDep {
        match self {
            BuildDepRef::Pkg(id, _) => ResolvedBuildDep::Pkg(id),
            BuildDepRef::Built(built) => ResolvedBuildDep::Built(built.clone()),
        }
    }
}

impl PackageLike for BuildDepRef<'_> {
    fn name(&self) -> &str {
        match self {
            BuildDepRef::Pkg(_, package) => &package.name,
            BuildDepRef::Built(built) => &built.name,
        }
    }

    fn dep_groups(&self) -> Vec<Vec<&str>> {
        match self {
            BuildDepRef::Pkg(_, package) => package.dep_groups(),
            BuildDepRef::Built(built) => built.dep_groups(),
        }
    }
}

/// Build-dep names resolve against the catalog first, then against
/// the latest entries of the built store.
struct BuildDepLookup<'a> {
    catalog: &'a Catalog,
    store: &'a BuiltPackages,
}

impl<'a> Lookup<BuildDepRef<'a>> for BuildDepLookup<'a> {
    fn lookup(&self, name: &str) -> Option<BuildDepRef<'a>> {
        if let Some((id, package)) = self.catalog.package_by_name(name) {
            return Some(BuildDepRef::Pkg(id, package));
        }
        self.store.latest(name).map(BuildDepRef::Built)
    }
}
