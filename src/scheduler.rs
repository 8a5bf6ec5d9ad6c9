//! Load-adaptive parallel driver for the build job graph.
//!
//! One cooperative loop owns all scheduling state; build, download
//! and verify tasks run in a [`JoinSet`] and report back through it,
//! so nothing here needs a lock. Builds are admitted by priority
//! under a parallelism cap, paused youngest-first when the load
//! median climbs too high, and resumed oldest-first once it drops.
//! Downloads are admitted mirror-aware under global and per-host
//! connection caps.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use petgraph::graph::NodeIndex;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::Instrument;

use crate::catalog::{Catalog, Command};
use crate::config::{Config, MirrorRule};
use crate::download::Fetcher;
use crate::error::{BuildError, Result};
use crate::graph::{BuildJobGraph, Job};
use crate::load::{LoadSampler, ProcLoadavg};
use crate::pathing;
use crate::Hostname;

/// Everything the sandbox needs to run one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build: String,
    pub version: String,
    pub bootstrap: bool,
    pub build_steps: Vec<Command>,
    /// `(name, version)` of the build-time dependency closure, in
    /// install order.
    pub resolved_build_deps: Vec<(String, String)>,
}

/// Sandbox seam: runs builds and freezes/thaws them on request.
pub trait BuildRunner: Send + Sync + 'static {
    fn run(&self, request: BuildRequest) -> impl Future<Output = Result<()>> + Send;

    /// Stop the build's processes from consuming CPU (SIGSTOP
    /// semantics). The task itself stays in flight.
    fn pause(&self, build: &str) -> Result<()>;

    fn resume(&self, build: &str) -> Result<()>;
}

pub struct Scheduler<R, F, L> {
    runner: Arc<R>,
    fetcher: Arc<F>,
    load: L,
    max_parallel_builds: usize,
    max_load: u32,
    load_sampling_period: Duration,
    load_sample_size: usize,
    configure_delay: Duration,
    max_connections: usize,
    max_connections_per_host: usize,
    mirrors: Vec<MirrorRule>,
}

impl<R, F> Scheduler<R, F, ProcLoadavg>
where
    R: BuildRunner,
    F: Fetcher,
{
    /// Scheduler sampling `/proc/loadavg`, the normal production setup.
    pub fn with_proc_loadavg(runner: R, fetcher: F, config: &Config) -> Self {
        Self::new(runner, fetcher, ProcLoadavg, config)
    }
}

impl<R, F, L> Scheduler<R, F, L>
where
    R: BuildRunner,
    F: Fetcher,
    L: LoadSampler,
{
    pub fn new(runner: R, fetcher: F, load: L, config: &Config) -> Self {
        Self {
            runner: Arc::new(runner),
            fetcher: Arc::new(fetcher),
            load,
            max_parallel_builds: config.max_parallel_builds,
            max_load: config.max_load,
            load_sampling_period: Duration::from_secs_f64(config.load_sampling_period),
            load_sample_size: config.load_sample_size,
            configure_delay: Duration::from_secs_f64(config.configure_delay),
            max_connections: config.max_connections,
            max_connections_per_host: config.max_connections_per_host,
            mirrors: config.mirrors.clone(),
        }
    }

    /// Drive the graph to completion. On the first failure every
    /// paused build is resumed so its task can observe cancellation,
    /// all in-flight tasks are cancelled and awaited, and the
    /// original error is returned.
    pub async fn run(&mut self, graph: &BuildJobGraph, catalog: &Catalog) -> Result<()> {
        let mut state = RunState::new(graph);
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        match self.drive(graph, catalog, &mut state, &mut tasks).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!("build failed, cancelling all jobs: {err}");
                self.cancel(&mut state, &mut tasks).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        graph: &BuildJobGraph,
        catalog: &Catalog,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
    ) -> Result<()> {
        let load_delay = self.load_sampling_period * self.load_sample_size as u32;
        let mut window: VecDeque<u32> = VecDeque::with_capacity(self.load_sample_size);
        let mut next_sampling = Instant::now();
        let mut next_scheduling = Instant::now();

        // The root is a pure synchronization point; completing it
        // seeds the queues.
        state.propagate(graph, graph.root());

        loop {
            if state.idle() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= next_scheduling {
                let median = median(&window);
                if !state.paused_builds.is_empty()
                    && median < self.max_parallel_builds as f64
                    && state.running_builds.len() < self.max_parallel_builds
                {
                    let build = state.paused_builds.pop_front().unwrap();
                    tracing::info!("resuming build {}", build.name);
                    self.runner.resume(&build.name)?;
                    state.running_builds.push(build);
                    next_scheduling = now + load_delay;
                } else if !state.runnable_builds.is_empty()
                    && median < self.max_parallel_builds as f64
                    && state.running_builds.len() < self.max_parallel_builds
                {
                    let runnable = state.runnable_builds.pop().unwrap();
                    self.start_build(catalog, graph, state, tasks, runnable.node);
                    next_scheduling = now + load_delay + self.configure_delay;
                } else if median >= self.max_load as f64 && state.running_builds.len() >= 2 {
                    let build = state.running_builds.pop().unwrap();
                    tracing::info!("pausing build {}", build.name);
                    self.runner.pause(&build.name)?;
                    state.paused_builds.push_back(build);
                    next_scheduling = now + load_delay;
                }
            }

            self.admit_downloads(graph, state, tasks)?;

            let completed = if tasks.is_empty() {
                time::sleep_until(next_sampling).await;
                None
            } else {
                match time::timeout_at(next_sampling, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => None,
                }
            };

            match completed {
                None => {
                    let sample = self
                        .load
                        .sample()
                        .map_err(|err| BuildError::Sandbox(err.into()))?;
                    push_sample(&mut window, sample, self.load_sample_size);
                    tracing::trace!("load median: {}", median(&window));
                    next_sampling = Instant::now() + self.load_sampling_period;
                }
                Some(Ok(output)) => self.handle_output(graph, state, tasks, output)?,
                Some(Err(join_error)) => {
                    return Err(BuildError::Sandbox(anyhow::anyhow!(
                        "job task died: {join_error}"
                    )));
                }
            }
        }
    }

    fn start_build(
        &self,
        catalog: &Catalog,
        graph: &BuildJobGraph,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
        node: NodeIndex,
    ) {
        let Some(request) = build_request(catalog, graph, node) else {
            return;
        };
        let name = request.build.clone();
        tracing::info!("building {name}");

        let task = state.next_task_id();
        let runner = Arc::clone(&self.runner);
        let span = crate::tracing::job_span("build", &name);
        tasks.spawn(
            async move {
                let result = runner.run(request).await;
                TaskOutput::Build { task, node, result }
            }
            .instrument(span),
        );
        state.running_builds.push(RunningBuild { task, node, name });
    }

    /// Admit waiting downloads in priority order. Per admission the
    /// mirror with the fewest in-flight connections on its host wins,
    /// hosts at the per-host cap are excluded, and the total cap
    /// stops admission altogether.
    fn admit_downloads(
        &self,
        graph: &BuildJobGraph,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
    ) -> Result<()> {
        let mut index = 0;
        while index < state.waiting_downloads.len() {
            if state.total_connections() >= self.max_connections {
                break;
            }

            let admission = &state.waiting_downloads[index];
            let mut chosen: Option<(Hostname, String)> = None;
            let mut fewest = usize::MAX;
            for mirror_url in pathing::find_mirrors(&self.mirrors, &admission.url) {
                let host = pathing::hostname(&mirror_url)?;
                let in_flight = state.connections.get(&host).copied().unwrap_or(0);
                if in_flight >= self.max_connections_per_host {
                    continue;
                }
                if in_flight < fewest {
                    fewest = in_flight;
                    chosen = Some((host, mirror_url));
                }
            }
            let Some((host, mirror_url)) = chosen else {
                index += 1;
                continue;
            };
            let Job::Download { source, .. } = &graph.node(admission.node).job else {
                index += 1;
                continue;
            };
            let source = Arc::clone(source);

            let admission = state.waiting_downloads.remove(index);
            *state.connections.entry(host.clone()).or_insert(0) += 1;
            tracing::info!("fetching {} via {mirror_url}", admission.url);

            let task = state.next_task_id();
            state.downloading.insert(task, (host.clone(), admission.node));
            let fetcher = Arc::clone(&self.fetcher);
            let node = admission.node;
            let url = admission.url;
            let span = crate::tracing::job_span("download", &url);
            tasks.spawn(
                async move {
                    let result = fetcher.download(source, url, mirror_url).await;
                    TaskOutput::Download { task, node, host, result }
                }
                .instrument(span),
            );
        }
        Ok(())
    }

    fn handle_output(
        &self,
        graph: &BuildJobGraph,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
        output: TaskOutput,
    ) -> Result<()> {
        match output {
            TaskOutput::Build { task, node, result } => {
                result?;
                state.running_builds.retain(|build| build.task != task);
                state.paused_builds.retain(|build| build.task != task);
                state.propagate(graph, node);
            }
            TaskOutput::Download { task, node, host, result } => {
                result?;
                state.downloading.remove(&task);
                state.release_connection(&host);
                state.downloads_done[node.index()] += 1;

                let Job::Download { source, download_total } = &graph.node(node).job else {
                    return Ok(());
                };
                if state.downloads_done[node.index()] == *download_total {
                    let task = state.next_task_id();
                    state.verifying.insert(task, node);
                    let fetcher = Arc::clone(&self.fetcher);
                    let source = Arc::clone(source);
                    let span = crate::tracing::job_span("verify", source.url());
                    tasks.spawn(
                        async move {
                            let result = fetcher.verify(source).await;
                            TaskOutput::Verify { task, node, result }
                        }
                        .instrument(span),
                    );
                }
            }
            TaskOutput::Verify { task, node, result } => {
                result?;
                state.verifying.remove(&task);
                state.propagate(graph, node);
            }
        }
        Ok(())
    }

    async fn cancel(&self, state: &mut RunState, tasks: &mut JoinSet<TaskOutput>) {
        // Paused builds are frozen; thaw them so their tasks observe
        // the cancellation and finish their cleanup.
        while let Some(paused) = state.paused_builds.pop_front() {
            if let Err(err) = self.runner.resume(&paused.name) {
                tracing::warn!("couldn't resume {} for cancellation: {err}", paused.name);
            }
            state.running_builds.push(paused);
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

enum TaskOutput {
    Build {
        task: u64,
        node: NodeIndex,
        result: Result<()>,
    },
    Download {
        task: u64,
        node: NodeIndex,
        host: Hostname,
        result: Result<()>,
    },
    Verify {
        task: u64,
        node: NodeIndex,
        result: Result<()>,
    },
}

struct RunningBuild {
    task: u64,
    node: NodeIndex,
    name: String,
}

struct Runnable {
    priority: u32,
    seq: u64,
    node: NodeIndex,
}

impl PartialEq for Runnable {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Runnable {}

impl PartialOrd for Runnable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher priority first, FIFO among equals.
impl Ord for Runnable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Admission {
    priority: u32,
    seq: u64,
    node: NodeIndex,
    url: String,
}

struct RunState {
    /// Completed-predecessor counter per node.
    completion: Vec<usize>,
    /// Finished fetches per download node.
    downloads_done: Vec<usize>,
    runnable_builds: std::collections::BinaryHeap<Runnable>,
    /// Highest priority first, FIFO among equals.
    waiting_downloads: Vec<Admission>,
    /// LIFO stack in start/resume order; the youngest gets paused.
    running_builds: Vec<RunningBuild>,
    /// Oldest pause resumes first.
    paused_builds: VecDeque<RunningBuild>,
    downloading: HashMap<u64, (Hostname, NodeIndex)>,
    verifying: HashMap<u64, NodeIndex>,
    connections: HashMap<Hostname, usize>,
    next_task: u64,
    next_seq: u64,
}

impl RunState {
    fn new(graph: &BuildJobGraph) -> Self {
        let nodes = graph.node_indices().count();
        Self {
            completion: vec![0; nodes],
            downloads_done: vec![0; nodes],
            runnable_builds: std::collections::BinaryHeap::new(),
            waiting_downloads: Vec::new(),
            running_builds: Vec::new(),
            paused_builds: VecDeque::new(),
            downloading: HashMap::new(),
            verifying: HashMap::new(),
            connections: HashMap::new(),
            next_task: 0,
            next_seq: 0,
        }
    }

    fn idle(&self) -> bool {
        self.runnable_builds.is_empty()
            && self.running_builds.is_empty()
            && self.paused_builds.is_empty()
            && self.waiting_downloads.is_empty()
            && self.downloading.is_empty()
            && self.verifying.is_empty()
    }

    fn next_task_id(&mut self) -> u64 {
        let task = self.next_task;
        self.next_task += 1;
        task
    }

    fn total_connections(&self) -> usize {
        self.connections.values().sum()
    }

    fn release_connection(&mut self, host: &Hostname) {
        if let Some(count) = self.connections.get_mut(host) {
            *count -= 1;
            if *count == 0 {
                self.connections.remove(host);
            }
        }
    }

    /// Mark `node` complete and make every successor whose
    /// predecessors are all done schedulable. No-op jobs complete on
    /// the spot and propagate further.
    fn propagate(&mut self, graph: &BuildJobGraph, node: NodeIndex) {
        let mut queue = VecDeque::from([node]);
        while let Some(done) = queue.pop_front() {
            for successor in graph.successors(done) {
                self.completion[successor.index()] += 1;
                if self.completion[successor.index()] < graph.num_incident(successor) {
                    continue;
                }
                let priority = graph.node(successor).priority;
                match &graph.node(successor).job {
                    Job::Build { .. } => {
                        let seq = self.next_seq();
                        self.runnable_builds.push(Runnable { priority, seq, node: successor });
                    }
                    Job::Download { source, .. } => {
                        self.push_admission(successor, priority, source.url().to_string());
                        if let Some(gpgsig) = source.gpgsig() {
                            self.push_admission(successor, priority, gpgsig.to_string());
                        }
                    }
                    Job::Nop { .. } => queue.push_back(successor),
                }
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push_admission(&mut self, node: NodeIndex, priority: u32, url: String) {
        let seq = self.next_seq();
        let position = self
            .waiting_downloads
            .iter()
            .position(|admission| admission.priority < priority)
            .unwrap_or(self.waiting_downloads.len());
        self.waiting_downloads
            .insert(position, Admission { priority, seq, node, url });
    }
}

fn build_request(catalog: &Catalog, graph: &BuildJobGraph, node: NodeIndex) -> Option<BuildRequest> {
    let Job::Build {
        build,
        resolved_build_deps,
    } = &graph.node(node).job
    else {
        return None;
    };
    let build = catalog.build(*build);
    Some(BuildRequest {
        build: build.name.clone(),
        version: build.version.clone(),
        bootstrap: build.bootstrap,
        build_steps: build.build_steps.clone(),
        resolved_build_deps: resolved_build_deps
            .iter()
            .map(|dep| {
                (
                    dep.name(catalog).to_string(),
                    dep.version(catalog).to_string(),
                )
            })
            .collect(),
    })
}

fn median(window: &VecDeque<u32>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<u32> = window.iter().copied().collect();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    }
}

/// The first sample seeds the whole window so the median is defined
/// from the first tick on.
fn push_sample(window: &mut VecDeque<u32>, sample: u32, size: usize) {
    if window.is_empty() {
        window.extend(std::iter::repeat(sample).take(size));
        return;
    }
    if window.len() >= size {
        window.pop_front();
    }
    window.push_back(sample);
}
