// src/build/stage.rs

//! Per-node stage directories
//!
//! Every build owns an isolated stage: a `source/` tree the adapter builds
//! from and an `install/` destdir it assembles into. Sources are verified
//! against their declared checksum before anything runs. A failed stage is
//! preserved for diagnosis; only an explicit [`Stage::destroy`] (or a
//! successful commit path) removes it.

use crate::error::{Error, Result};
use crate::hash;
use crate::spec::ConcreteSpec;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a node's source comes from
#[derive(Debug, Clone)]
pub enum SourceOrigin {
    /// A single archive file, verified against its SHA-256 before staging
    Archive { path: PathBuf, sha256: String },
    /// An already-unpacked tree, copied as-is
    Tree { path: PathBuf },
    /// No source; the adapter generates everything
    None,
}

/// Supplies the source origin for each concrete node
pub trait SourceProvider: Send + Sync {
    fn source_for(&self, spec: &ConcreteSpec) -> SourceOrigin;
}

/// Provider for packages that need no staged sources
pub struct NoSources;

impl SourceProvider for NoSources {
    fn source_for(&self, _spec: &ConcreteSpec) -> SourceOrigin {
        SourceOrigin::None
    }
}

/// The build root holding one stage directory per node
#[derive(Debug, Clone)]
pub struct StageArea {
    root: PathBuf,
}

impl StageArea {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Create a fresh, exclusively-owned stage for one node. A leftover
    /// stage from an earlier attempt is cleared first.
    pub fn stage_for(&self, spec: &Arc<ConcreteSpec>) -> Result<Stage> {
        let dir = self
            .root
            .join(format!("{}-{}", spec.name, spec.dag_hash().short()));
        if dir.exists() {
            warn!(stage = %dir.display(), "clearing leftover stage");
            fs::remove_dir_all(&dir)?;
        }

        let source_dir = dir.join("source");
        let install_dir = dir.join("install");
        fs::create_dir_all(&source_dir)?;
        fs::create_dir_all(&install_dir)?;
        debug!(spec = %spec, stage = %dir.display(), "staged");

        Ok(Stage {
            dir,
            source_dir,
            install_dir,
        })
    }
}

/// One node's staged working directory
#[derive(Debug)]
pub struct Stage {
    dir: PathBuf,
    source_dir: PathBuf,
    install_dir: PathBuf,
}

impl Stage {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Place and verify the node's source in the stage
    pub fn fetch_source(&self, origin: &SourceOrigin) -> Result<()> {
        match origin {
            SourceOrigin::None => Ok(()),
            SourceOrigin::Tree { path } => {
                crate::store::copy_tree(path, &self.source_dir).map_err(Error::from)
            }
            SourceOrigin::Archive { path, sha256 } => {
                hash::verify_file(path, sha256)?;
                let file_name = path
                    .file_name()
                    .ok_or_else(|| Error::IoError(std::io::Error::other("archive has no file name")))?;
                fs::copy(path, self.source_dir.join(file_name))?;
                Ok(())
            }
        }
    }

    /// Remove the stage. Failed stages are kept by default; this is the
    /// explicit cleanup path.
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}
