// src/build/mod.rs

//! Build orchestration over concrete DAGs
//!
//! The orchestrator walks a set of concretized roots, schedules every node
//! once all of its dependencies are installed, and drives builds through a
//! pluggable [`BuildSystem`] adapter on a bounded pool of OS threads —
//! builds are long-running external processes, so the parallelism is real.
//!
//! Per-node lifecycle: `Pending -> Staged -> Building -> {Installed |
//! Failed}`. A failure marks every not-yet-started transitive dependent
//! `Blocked` with the root cause and leaves completed siblings untouched;
//! outcomes are collected and reported together rather than abandoned at the
//! first error, unless fail-fast is requested. Nodes whose hash is known to
//! a binary cache install from the prebuilt artifact instead of building,
//! still honoring topological gating and registry updates.

pub mod adapter;
pub mod stage;

pub use adapter::{BuildContext, BuildLog, BuildSystem, CommandBuildSystem};
pub use stage::{NoSources, SourceOrigin, SourceProvider, Stage, StageArea};

use crate::cache::BinaryCacheIndex;
use crate::config::Config;
use crate::db::InstallDb;
use crate::error::{Error, Result};
use crate::hash::SpecHash;
use crate::registry::SpecRegistry;
use crate::repo::PackageRepository;
use crate::spec::ConcreteSpec;
use crate::store::InstallStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cooperative cancellation handle shared with workers and adapters.
/// Cancelling stops scheduling immediately and interrupts in-flight
/// subprocess builds; already-installed nodes stay installed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final state of one node after a build run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Never started (cancellation or fail-fast drained the queue)
    Pending,
    Installed,
    Failed,
    /// Never attempted because a dependency failed
    Blocked,
}

/// Everything the report records about one node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub spec: Arc<ConcreteSpec>,
    pub state: NodeState,
    /// Failure cause, for `Failed` nodes
    pub cause: Option<String>,
    /// Captured build log, when a build ran
    pub log: Option<String>,
    /// Root-cause node for `Blocked` nodes
    pub blocked_on: Option<SpecHash>,
    /// Final install prefix, for `Installed` nodes
    pub prefix: Option<PathBuf>,
    /// Whether the install came from the binary cache
    pub from_cache: bool,
}

impl NodeOutcome {
    /// The error this outcome stands for, if it is a failure state
    pub fn as_error(&self) -> Option<Error> {
        match self.state {
            NodeState::Failed => Some(Error::BuildFailed {
                package: self.spec.name.clone(),
                cause: self
                    .cause
                    .clone()
                    .unwrap_or_else(|| "unknown cause".to_string()),
            }),
            NodeState::Blocked => Some(Error::Blocked {
                package: self.spec.name.clone(),
                root_cause: self
                    .blocked_on
                    .as_ref()
                    .map(|h| h.short().to_string())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Collected results of one top-level build request
#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: BTreeMap<SpecHash, NodeOutcome>,
}

impl BuildReport {
    pub fn all_installed(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| o.state == NodeState::Installed)
    }

    pub fn installed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .values()
            .filter(|o| o.state == NodeState::Installed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .values()
            .filter(|o| o.state == NodeState::Failed)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes
            .values()
            .filter(|o| o.state == NodeState::Blocked)
    }

    pub fn outcome_of(&self, spec: &ConcreteSpec) -> Option<&NodeOutcome> {
        self.outcomes.get(spec.dag_hash())
    }
}

/// External collaborators and policies for one orchestrator
pub struct BuildOptions<'a> {
    pub config: &'a Config,
    pub repo: &'a dyn PackageRepository,
    pub adapter: &'a dyn BuildSystem,
    pub sources: &'a dyn SourceProvider,
    pub cache: Option<&'a dyn BinaryCacheIndex>,
    pub db: Option<&'a Mutex<InstallDb>>,
    /// Concurrent node builds; defaults to the CPU count when zero
    pub workers: usize,
    /// Per-node build timeout
    pub timeout: Option<Duration>,
    /// Remove stages of failed builds too (kept by default for diagnosis)
    pub destroy_failed_stages: bool,
}

/// Orchestrates builds of concrete DAGs
pub struct BuildOrchestrator<'a> {
    store: &'a InstallStore,
    stages: &'a StageArea,
    registry: &'a SpecRegistry,
    opts: BuildOptions<'a>,
}

/// Scheduler bookkeeping for one node
struct NodeEntry {
    spec: Arc<ConcreteSpec>,
    /// Direct dependencies not yet installed
    waiting_on: usize,
    /// Hashes of nodes that depend on this one
    dependents: BTreeSet<SpecHash>,
}

/// State shared between workers, guarded by one mutex
struct SchedState {
    entries: BTreeMap<SpecHash, NodeEntry>,
    ready: BTreeSet<SpecHash>,
    running: usize,
    outcomes: BTreeMap<SpecHash, NodeOutcome>,
    /// Set once any node fails, for fail-fast draining
    any_failed: bool,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(
        store: &'a InstallStore,
        stages: &'a StageArea,
        registry: &'a SpecRegistry,
        opts: BuildOptions<'a>,
    ) -> Self {
        Self {
            store,
            stages,
            registry,
            opts,
        }
    }

    /// Build every node of the given roots in dependency order.
    ///
    /// Always returns a report covering every node (installed, failed,
    /// blocked, or never started); scheduling errors inside a node become
    /// that node's failure, not the orchestrator's.
    pub fn build(
        &self,
        roots: &[Arc<ConcreteSpec>],
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let state = Mutex::new(self.seed_state(roots));
        let wakeup = Condvar::new();

        let fail_fast = self.opts.config.effective_fail_fast();
        let workers = match self.opts.workers {
            0 => std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
            n => n,
        };

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(&state, &wakeup, cancel, fail_fast));
            }
        });

        let mut state = state.into_inner().expect("scheduler lock poisoned");

        // Anything still queued was drained by cancellation or fail-fast
        for (hash, entry) in state.entries {
            state.outcomes.entry(hash).or_insert(NodeOutcome {
                spec: entry.spec,
                state: NodeState::Pending,
                cause: None,
                log: None,
                blocked_on: None,
                prefix: None,
                from_cache: false,
            });
        }

        let report = BuildReport {
            outcomes: state.outcomes,
        };
        info!(
            installed = report.installed().count(),
            failed = report.failed().count(),
            blocked = report.blocked().count(),
            "build request finished"
        );
        Ok(report)
    }

    /// Index the DAG forest: dependency counts, reverse edges, and the
    /// initially ready set. Nodes already present in the store are recorded
    /// as installed up front.
    fn seed_state(&self, roots: &[Arc<ConcreteSpec>]) -> SchedState {
        let mut entries: BTreeMap<SpecHash, NodeEntry> = BTreeMap::new();
        let mut outcomes = BTreeMap::new();

        for root in roots {
            for node in root.traverse() {
                let hash = node.dag_hash().clone();
                if entries.contains_key(&hash) || outcomes.contains_key(&hash) {
                    continue;
                }
                if self.store.contains(&node) {
                    debug!(spec = %node, "already installed; skipping");
                    self.registry.register(&node);
                    outcomes.insert(
                        hash,
                        NodeOutcome {
                            prefix: Some(self.store.prefix_for(&node)),
                            spec: node,
                            state: NodeState::Installed,
                            cause: None,
                            log: None,
                            blocked_on: None,
                            from_cache: false,
                        },
                    );
                    continue;
                }
                entries.insert(
                    hash,
                    NodeEntry {
                        spec: node,
                        waiting_on: 0,
                        dependents: BTreeSet::new(),
                    },
                );
            }
        }

        // Wire counts and reverse edges among the nodes that need building
        let hashes: Vec<SpecHash> = entries.keys().cloned().collect();
        for hash in &hashes {
            let deps: Vec<SpecHash> = entries[hash]
                .spec
                .deps
                .values()
                .map(|d| d.spec.dag_hash().clone())
                .collect();
            for dep in deps {
                if entries.contains_key(&dep) {
                    entries.get_mut(hash).expect("known node").waiting_on += 1;
                    entries
                        .get_mut(&dep)
                        .expect("known node")
                        .dependents
                        .insert(hash.clone());
                }
            }
        }

        let ready = entries
            .iter()
            .filter(|(_, entry)| entry.waiting_on == 0)
            .map(|(hash, _)| hash.clone())
            .collect();

        SchedState {
            entries,
            ready,
            running: 0,
            outcomes,
            any_failed: false,
        }
    }

    fn worker(
        &self,
        state: &Mutex<SchedState>,
        wakeup: &Condvar,
        cancel: &CancellationToken,
        fail_fast: bool,
    ) {
        loop {
            let job = {
                let mut guard = state.lock().expect("scheduler lock poisoned");
                loop {
                    if cancel.is_cancelled() || (fail_fast && guard.any_failed) {
                        wakeup.notify_all();
                        return;
                    }
                    if let Some(hash) = guard.ready.iter().next().cloned() {
                        guard.ready.remove(&hash);
                        guard.running += 1;
                        break guard
                            .entries
                            .get(&hash)
                            .map(|entry| (hash, Arc::clone(&entry.spec)))
                            .expect("ready node is known");
                    }
                    if guard.running == 0 {
                        // Nothing ready and nothing running: we are done
                        wakeup.notify_all();
                        return;
                    }
                    guard = wakeup
                        .wait(guard)
                        .expect("scheduler lock poisoned");
                }
            };

            let (hash, spec) = job;
            let outcome = self.build_one(&spec, cancel);

            let mut guard = state.lock().expect("scheduler lock poisoned");
            guard.running -= 1;
            let installed = outcome.state == NodeState::Installed;
            let entry = guard.entries.remove(&hash).expect("ready node is known");
            guard.outcomes.insert(hash.clone(), outcome);

            if installed {
                for dependent in &entry.dependents {
                    if let Some(parent) = guard.entries.get_mut(dependent) {
                        parent.waiting_on -= 1;
                        if parent.waiting_on == 0 {
                            guard.ready.insert(dependent.clone());
                        }
                    }
                }
            } else {
                guard.any_failed = true;
                block_dependents(&mut guard, &entry.dependents, &hash);
            }
            wakeup.notify_all();
        }
    }

    /// Build or cache-install one node; never panics the worker
    fn build_one(&self, spec: &Arc<ConcreteSpec>, cancel: &CancellationToken) -> NodeOutcome {
        let failed = |cause: String, log: Option<String>| NodeOutcome {
            spec: Arc::clone(spec),
            state: NodeState::Failed,
            cause: Some(cause),
            log,
            blocked_on: None,
            prefix: None,
            from_cache: false,
        };

        // Binary-cache substitution: skip staging and building entirely
        match self.try_cache_install(spec) {
            Ok(Some(prefix)) => {
                self.record_success(spec, &prefix);
                return NodeOutcome {
                    spec: Arc::clone(spec),
                    state: NodeState::Installed,
                    cause: None,
                    log: None,
                    blocked_on: None,
                    prefix: Some(prefix),
                    from_cache: true,
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(spec = %spec, error = %err, "cache install failed; building from source");
            }
        }

        info!(spec = %spec, hash = spec.dag_hash().short(), "building");

        let stage = match self.stages.stage_for(spec) {
            Ok(stage) => stage,
            Err(err) => return failed(format!("staging failed: {}", err), None),
        };
        if let Err(err) = stage.fetch_source(&self.opts.sources.source_for(spec)) {
            // The stage is intentionally left behind for diagnosis
            return failed(format!("source fetch failed: {}", err), None);
        }

        let dep_prefixes: BTreeMap<String, PathBuf> = spec
            .deps
            .values()
            .map(|d| (d.spec.name.clone(), self.store.prefix_for(&d.spec)))
            .collect();
        let jobs = self
            .opts
            .config
            .effective_jobs(self.opts.repo.serial_only(&spec.name));

        let ctx = BuildContext {
            spec,
            source_dir: stage.source_dir(),
            install_dir: stage.install_dir(),
            dep_prefixes: &dep_prefixes,
            jobs,
            timeout: self.opts.timeout,
            cancel,
        };

        match self.opts.adapter.build(&ctx) {
            Ok(log) => {
                let prefix = match self.store.commit(stage.install_dir(), spec) {
                    Ok(prefix) => prefix,
                    Err(err) => return failed(format!("install commit failed: {}", err), Some(log.0)),
                };
                let _ = stage.destroy();
                self.record_success(spec, &prefix);
                NodeOutcome {
                    spec: Arc::clone(spec),
                    state: NodeState::Installed,
                    cause: None,
                    log: Some(log.0),
                    blocked_on: None,
                    prefix: Some(prefix),
                    from_cache: false,
                }
            }
            Err(err) => {
                let (cause, log) = match err {
                    Error::BuildFailed { cause, .. } => (cause, None),
                    other => (other.to_string(), None),
                };
                if self.opts.destroy_failed_stages {
                    let _ = stage.destroy();
                }
                failed(cause, log)
            }
        }
    }

    /// Install from the binary cache when the spec's hash is known there
    fn try_cache_install(&self, spec: &Arc<ConcreteSpec>) -> Result<Option<PathBuf>> {
        let Some(cache) = self.opts.cache else {
            return Ok(None);
        };
        let Some(artifact) = cache.fetch(spec.dag_hash())? else {
            return Ok(None);
        };

        info!(spec = %spec, hash = spec.dag_hash().short(), "installing from binary cache");
        let stage = self.stages.stage_for(spec)?;
        crate::store::copy_tree(&artifact.payload, stage.install_dir())?;
        let prefix = self.store.commit(stage.install_dir(), spec)?;
        let _ = stage.destroy();
        Ok(Some(prefix))
    }

    /// Registry and install-database updates after a successful install;
    /// visible to lookups immediately
    fn record_success(&self, spec: &Arc<ConcreteSpec>, prefix: &std::path::Path) {
        self.registry.register(spec);
        if let Some(db) = self.opts.db {
            let mut db = db.lock().expect("install db lock poisoned");
            if let Err(err) = db.record_install(spec, prefix) {
                warn!(spec = %spec, error = %err, "failed to record install");
            }
        }
    }
}

/// Mark every not-yet-started transitive dependent of a failed node as
/// blocked on it
fn block_dependents(state: &mut SchedState, dependents: &BTreeSet<SpecHash>, root_cause: &SpecHash) {
    let mut queue: Vec<SpecHash> = dependents.iter().cloned().collect();
    while let Some(hash) = queue.pop() {
        let Some(entry) = state.entries.remove(&hash) else {
            continue;
        };
        state.ready.remove(&hash);
        debug!(spec = %entry.spec, blocked_on = root_cause.short(), "blocked by dependency failure");
        state.outcomes.insert(
            hash,
            NodeOutcome {
                spec: entry.spec,
                state: NodeState::Blocked,
                cause: None,
                log: None,
                blocked_on: Some(root_cause.clone()),
                prefix: None,
                from_cache: false,
            },
        );
        queue.extend(entry.dependents.iter().cloned());
    }
}
