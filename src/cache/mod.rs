// src/cache/mod.rs

//! Binary cache index contract
//!
//! A binary cache holds prebuilt artifacts keyed by concrete-spec DAG hash.
//! The orchestrator substitutes "install from cache" for "build from source"
//! when a node's hash is known, still honoring topological gating and
//! registry updates. The index contract is two lookups; transport specifics
//! beyond that are out of scope.

use crate::error::Result;
use crate::hash::SpecHash;
use crate::spec::canonical::{self, NodeDocument};
use crate::spec::ConcreteSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A fetched prebuilt artifact: the DAG's node documents plus the payload
/// tree to install
#[derive(Debug)]
pub struct PrebuiltArtifact {
    pub hash: SpecHash,
    pub documents: BTreeMap<SpecHash, NodeDocument>,
    /// Directory holding the built tree, ready to copy into a stage
    pub payload: PathBuf,
}

/// Lookup contract for a binary cache
pub trait BinaryCacheIndex: Send + Sync {
    /// Every spec hash the cache holds an artifact for
    fn all_known_hashes(&self) -> Result<Vec<SpecHash>>;

    /// Fetch one artifact, or `None` when the hash is unknown
    fn fetch(&self, hash: &SpecHash) -> Result<Option<PrebuiltArtifact>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    nodes: BTreeMap<SpecHash, NodeDocument>,
}

/// Directory-backed cache: one subdirectory per hash, holding
/// `manifest.json` and a `payload/` tree
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_dir(&self, hash: &SpecHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Publish a built tree for a spec into the cache
    pub fn publish(&self, spec: &Arc<ConcreteSpec>, built_tree: &Path) -> Result<()> {
        let dir = self.entry_dir(spec.dag_hash());
        fs::create_dir_all(&dir)?;

        let manifest = Manifest {
            nodes: canonical::collect_documents(spec),
        };
        fs::write(
            dir.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        crate::store::copy_tree(built_tree, &dir.join("payload"))?;
        debug!(hash = spec.dag_hash().short(), "published to binary cache");
        Ok(())
    }
}

impl BinaryCacheIndex for DirectoryCache {
    fn all_known_hashes(&self) -> Result<Vec<SpecHash>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Non-hash directory names are someone else's files; skip them
            if let Ok(hash) = SpecHash::new(entry.file_name().to_string_lossy().into_owned()) {
                hashes.push(hash);
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    fn fetch(&self, hash: &SpecHash) -> Result<Option<PrebuiltArtifact>> {
        let dir = self.entry_dir(hash);
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Ok(None);
        }
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(manifest_path)?)?;
        Ok(Some(PrebuiltArtifact {
            hash: hash.clone(),
            documents: manifest.nodes,
            payload: dir.join("payload"),
        }))
    }
}
