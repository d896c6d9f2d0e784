// src/registry/mod.rs

//! Concrete spec registry
//!
//! A process-wide index from DAG hash to concrete spec, populated lazily
//! from whichever scopes are available: the install database, an environment
//! lockfile, a binary-cache index. The registry is an explicit struct with a
//! caller-managed lifetime — one per process or per test — passed by
//! reference, never an ambient singleton. Reads dominate after population;
//! writes (registering a freshly installed spec) go through the single
//! writer lock and are visible to subsequent lookups immediately.

use crate::cache::BinaryCacheIndex;
use crate::db::InstallDb;
use crate::error::{Error, Result};
use crate::hash::SpecHash;
use crate::spec::canonical::{self, NodeDocument};
use crate::spec::ConcreteSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A population source for the registry
pub enum RegistryScope<'a> {
    InstallDb(&'a InstallDb),
    /// An environment lockfile (see [`Lockfile`])
    Environment(&'a Path),
    BinaryCache(&'a dyn BinaryCacheIndex),
}

impl RegistryScope<'_> {
    fn describe(&self) -> &'static str {
        match self {
            RegistryScope::InstallDb(_) => "install database",
            RegistryScope::Environment(_) => "environment lockfile",
            RegistryScope::BinaryCache(_) => "binary cache",
        }
    }
}

/// Process-wide hash → concrete spec index
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: RwLock<HashMap<SpecHash, Arc<ConcreteSpec>>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull known concrete specs from every given scope.
    ///
    /// An unavailable scope is logged and skipped, never fatal: a missing
    /// lockfile or unreachable cache must not take concretization down.
    /// Returns the number of specs the registry now holds.
    pub fn populate(&self, scopes: &[RegistryScope<'_>]) -> usize {
        for scope in scopes {
            let loaded = match scope {
                RegistryScope::InstallDb(db) => db
                    .all_documents()
                    .and_then(|docs| self.merge_documents(docs)),
                RegistryScope::Environment(path) => {
                    Lockfile::read(path).and_then(|lockfile| self.merge_documents(lockfile.nodes))
                }
                RegistryScope::BinaryCache(index) => self.merge_cache(*index),
            };
            if let Err(err) = loaded {
                warn!(error = %err, scope = scope.describe(), "skipping unavailable scope");
            }
        }
        self.len()
    }

    fn merge_documents(&self, documents: BTreeMap<SpecHash, NodeDocument>) -> Result<()> {
        let rebuilt = canonical::reassemble(&documents)?;
        let mut specs = self.specs.write().expect("registry lock poisoned");
        for (hash, spec) in rebuilt {
            specs.entry(hash).or_insert(spec);
        }
        Ok(())
    }

    fn merge_cache(&self, index: &dyn BinaryCacheIndex) -> Result<()> {
        for hash in index.all_known_hashes()? {
            // Entries already known from a closer scope win
            if self.get(&hash).is_some() {
                continue;
            }
            if let Some(artifact) = index.fetch(&hash)? {
                self.merge_documents(artifact.documents)?;
            }
        }
        Ok(())
    }

    /// Register a spec (and its whole DAG) after an install completes
    pub fn register(&self, spec: &Arc<ConcreteSpec>) {
        let mut specs = self.specs.write().expect("registry lock poisoned");
        for node in spec.traverse() {
            specs.entry(node.dag_hash().clone()).or_insert(node);
        }
        debug!(hash = spec.dag_hash().short(), "registered spec");
    }

    /// Exact-hash lookup
    pub fn get(&self, hash: &SpecHash) -> Option<Arc<ConcreteSpec>> {
        self.specs
            .read()
            .expect("registry lock poisoned")
            .get(hash)
            .cloned()
    }

    /// All specs whose hash starts with `prefix`, deterministically ordered;
    /// the caller decides how to handle ambiguity
    pub fn get_by_hash_prefix(&self, prefix: &str) -> Vec<Arc<ConcreteSpec>> {
        let specs = self.specs.read().expect("registry lock poisoned");
        let mut matches: Vec<(SpecHash, Arc<ConcreteSpec>)> = specs
            .iter()
            .filter(|(hash, _)| hash.matches_prefix(prefix))
            .map(|(hash, spec)| (hash.clone(), Arc::clone(spec)))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches.into_iter().map(|(_, spec)| spec).collect()
    }

    /// Prefix lookup that must name exactly one spec
    pub fn get_unique(&self, prefix: &str) -> Result<Arc<ConcreteSpec>> {
        let matches = self.get_by_hash_prefix(prefix);
        match matches.len() {
            0 => Err(Error::NoSuchHash(prefix.to_string())),
            1 => Ok(matches.into_iter().next().expect("one match")),
            _ => Err(Error::AmbiguousHashPrefix {
                prefix: prefix.to_string(),
                matches: matches
                    .iter()
                    .map(|spec| spec.dag_hash().short().to_string())
                    .collect(),
            }),
        }
    }

    /// Drop everything; the next populate starts fresh. Used between test
    /// cases and after store mutations.
    pub fn clear(&self) {
        self.specs.write().expect("registry lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.specs.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An environment lockfile: the persisted result of concretizing an
/// environment, reproducing hashes exactly on read
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Lockfile {
    /// Canonical node documents of every DAG node in the environment
    pub nodes: BTreeMap<SpecHash, NodeDocument>,
    /// Hashes of the requested roots, in request order
    pub roots: Vec<SpecHash>,
}

impl Lockfile {
    /// Capture a set of concretized roots
    pub fn capture(roots: &[Arc<ConcreteSpec>]) -> Self {
        let mut nodes = BTreeMap::new();
        let mut root_hashes = Vec::with_capacity(roots.len());
        for root in roots {
            nodes.extend(canonical::collect_documents(root));
            root_hashes.push(root.dag_hash().clone());
        }
        Self {
            nodes,
            roots: root_hashes,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}
