// src/store/mod.rs

//! Content-addressed install locations
//!
//! Installed specs live under `<root>/<name>-<version>-<hash7>`. Builds
//! assemble their output in a stage directory and [`InstallStore::commit`]
//! moves the finished tree into place in one rename, so readers never
//! observe a half-written prefix and a crash mid-build leaves the final
//! path untouched.

use crate::error::{Error, Result};
use crate::spec::ConcreteSpec;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// The on-disk store of installed prefixes
#[derive(Debug, Clone)]
pub struct InstallStore {
    root: PathBuf,
}

impl InstallStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The final install prefix for a concrete spec
    pub fn prefix_for(&self, spec: &ConcreteSpec) -> PathBuf {
        self.root.join(format!(
            "{}-{}-{}",
            spec.name,
            spec.version,
            spec.dag_hash().short()
        ))
    }

    /// Has this spec already been committed?
    pub fn contains(&self, spec: &ConcreteSpec) -> bool {
        self.prefix_for(spec).exists()
    }

    /// Atomically move a fully-assembled tree into the spec's final prefix.
    ///
    /// The tree appears at the final path in a single rename; on
    /// cross-filesystem moves the tree is first copied next to the final
    /// path and the rename happens last, so the invariant holds either way.
    pub fn commit(&self, staged: &Path, spec: &ConcreteSpec) -> Result<PathBuf> {
        let prefix = self.prefix_for(spec);
        if prefix.exists() {
            return Err(Error::IoError(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("install prefix already exists: {}", prefix.display()),
            )));
        }
        move_tree_atomic(staged, &prefix)?;
        debug!(prefix = %prefix.display(), "committed install");
        Ok(prefix)
    }
}

/// Move a directory tree, falling back to copy+sync+rename for
/// cross-filesystem moves (EXDEV).
pub(crate) fn move_tree_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            // Cross-filesystem: assemble a sibling of the destination, then
            // rename last so the final path still appears atomically
            let parent = dst.parent().unwrap_or(Path::new("."));
            let pending = parent.join(format!(
                ".pending-{}",
                dst.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "install".to_string())
            ));
            if pending.exists() {
                fs::remove_dir_all(&pending)?;
            }
            copy_tree(src, &pending)?;

            // Persist the directory entry before exposing the final name
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
            fs::rename(&pending, dst)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Recursively copy a directory tree
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
