// tests/common/mod.rs

//! Shared fixtures for integration tests

// Each test binary uses its own subset of these helpers
#![allow(dead_code)]

use quarry::build::{BuildContext, BuildLog, BuildSystem};
use quarry::repo::{MemoryRepository, PackageDef};
use quarry::{Compiler, Config, Error, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Install a tracing subscriber honoring RUST_LOG; safe to call repeatedly
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A config with one compiler, ready for concretization
pub fn test_config() -> Config {
    init_tracing();
    Config::new().with_compiler(Compiler::new("gcc", "12.2"))
}

/// The diamond fixture: a -> {b, c}, b -> d, c -> d
pub fn diamond_repo() -> MemoryRepository {
    MemoryRepository::with([
        PackageDef::new("a")
            .version("1.0")
            .depends_on("b")
            .depends_on("c"),
        PackageDef::new("b").version("1.0").depends_on("d@:1"),
        PackageDef::new("c").version("1.0").depends_on("d@:1"),
        PackageDef::new("d").version("1.0").version("0.9"),
    ])
}

/// Adapter that "builds" by writing a marker file, failing on request.
///
/// Packages listed in `fail` report a build failure; every build is recorded
/// so tests can assert what actually ran.
pub struct MarkerBuildSystem {
    pub fail: BTreeSet<String>,
    /// Packages whose build sleeps briefly, to pin down scheduling races
    pub slow: BTreeSet<String>,
    pub built: Mutex<Vec<String>>,
}

impl MarkerBuildSystem {
    pub fn new() -> Self {
        Self {
            fail: BTreeSet::new(),
            slow: BTreeSet::new(),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|s| s.to_string()).collect(),
            ..Self::new()
        }
    }

    pub fn built_names(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

impl BuildSystem for MarkerBuildSystem {
    fn name(&self) -> &str {
        "marker"
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<BuildLog> {
        self.built.lock().unwrap().push(ctx.spec.name.clone());
        if self.slow.contains(&ctx.spec.name) {
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
        if self.fail.contains(&ctx.spec.name) {
            return Err(Error::BuildFailed {
                package: ctx.spec.name.clone(),
                cause: "induced failure".to_string(),
            });
        }
        std::fs::write(
            ctx.install_dir.join("receipt"),
            format!("{}\n", ctx.spec),
        )?;
        Ok(BuildLog(format!("built {}", ctx.spec.name)))
    }
}
