// src/config.rs

//! Concretizer and build configuration
//!
//! Carries the ordered compiler list, per-package preferences, the unify
//! policy, test-dependency inclusion, and the build-job policy. Values can be
//! loaded from TOML; the `command_line` scope holds overrides that always win
//! over file-level defaults.

use crate::error::{Error, Result};
use crate::spec::CompilerSpec;
use crate::version::Version;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Whether distinct root requests must share one concrete node per package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifyPolicy {
    /// Each root resolves independently
    Separately,
    /// One node per package name across all roots, or the request fails
    #[default]
    Together,
    /// Try a shared solve; fall back to per-root nodes if it cannot merge
    WhenPossible,
}

/// Which nodes get their declared `test` dependencies expanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Never expand test edges
    #[default]
    None,
    /// Expand test edges on requested roots only, never transitively
    Root,
    /// Expand test edges everywhere
    All,
}

/// One available compiler; list order is preference order
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Compiler {
    pub name: String,
    pub version: Version,
    /// Install location of the toolchain, when known
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Compiler {
    pub fn new(name: impl Into<String>, version: &str) -> Self {
        Self {
            name: name.into(),
            version: Version::parse(version).expect("valid compiler version literal"),
            path: None,
        }
    }

    pub fn spec(&self) -> CompilerSpec {
        CompilerSpec::new(self.name.clone(), self.version.clone())
    }
}

/// Per-package user preferences consulted during tie-break
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackagePrefs {
    /// Preferred versions, most preferred first
    #[serde(default)]
    pub versions: Vec<Version>,
    /// Preferred variant values, overriding declared defaults
    #[serde(default)]
    pub variants: BTreeMap<String, crate::spec::VariantValue>,
    /// For a virtual name: providers in preference order
    #[serde(default)]
    pub providers: Vec<String>,
}

/// Overrides from the command line; these always win over config defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandLineScope {
    #[serde(default)]
    pub build_jobs: Option<usize>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Available compilers, most preferred first
    #[serde(default)]
    pub compilers: Vec<Compiler>,
    /// Concretization target; nodes constrained to another arch fail
    #[serde(default = "default_arch")]
    pub target_arch: String,
    /// Per-package preferences keyed by package name
    #[serde(default)]
    pub packages: BTreeMap<String, PackagePrefs>,
    #[serde(default)]
    pub unify: UnifyPolicy,
    #[serde(default)]
    pub tests: TestMode,
    /// Default build-job count; capped at the machine's CPU count
    #[serde(default)]
    pub build_jobs: Option<usize>,
    /// Stop scheduling new builds after the first failure
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub command_line: CommandLineScope,
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

impl Config {
    pub fn new() -> Self {
        Self {
            target_arch: default_arch(),
            ..Default::default()
        }
    }

    /// Parse from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compilers.push(compiler);
        self
    }

    pub fn with_unify(mut self, unify: UnifyPolicy) -> Self {
        self.unify = unify;
        self
    }

    pub fn with_tests(mut self, tests: TestMode) -> Self {
        self.tests = tests;
        self
    }

    /// Preferences for a package, if any were configured
    pub fn prefs(&self, name: &str) -> Option<&PackagePrefs> {
        self.packages.get(name)
    }

    /// Effective parallel-job count for one build.
    ///
    /// Command-line override wins over the config default; both are capped at
    /// the machine's CPU count; a package that cannot build in parallel is
    /// forced to one job.
    pub fn effective_jobs(&self, serial_only: bool) -> usize {
        if serial_only {
            return 1;
        }
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        let requested = self
            .command_line
            .build_jobs
            .or(self.build_jobs)
            .unwrap_or(cpus);
        requested.clamp(1, cpus)
    }

    /// Effective fail-fast policy, command line winning
    pub fn effective_fail_fast(&self) -> bool {
        self.command_line.fail_fast.unwrap_or(self.fail_fast)
    }
}
