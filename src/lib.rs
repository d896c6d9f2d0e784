// src/lib.rs

//! Quarry package manager core
//!
//! Source-based package management: abstract package requests are
//! concretized into fully-resolved build DAGs, identified by canonical
//! content hashes, and built in dependency order with atomic installs.
//!
//! # Architecture
//!
//! - Specs: abstract requests vs. immutable concrete DAG nodes with shared
//!   dependency edges
//! - Concretizer: constraint satisfaction over versions, variants,
//!   compilers, virtual providers, and conflicts, with deterministic
//!   optimization tie-breaks
//! - Hashing: child-first canonical hashing; the hash is the identity used
//!   by the registry, install database, store, and binary caches
//! - Orchestrator: topological scheduling on real OS threads, per-node
//!   failure containment, commit-then-rename installs

pub mod build;
pub mod cache;
pub mod concretize;
pub mod config;
pub mod db;
mod error;
pub mod hash;
pub mod registry;
pub mod repo;
pub mod spec;
pub mod store;
pub mod version;

pub use build::{
    BuildOptions, BuildOrchestrator, BuildReport, BuildSystem, CancellationToken, NodeOutcome,
    NodeState, StageArea,
};
pub use cache::{BinaryCacheIndex, DirectoryCache, PrebuiltArtifact};
pub use concretize::Concretizer;
pub use config::{Compiler, Config, TestMode, UnifyPolicy};
pub use db::InstallDb;
pub use error::{Error, Result};
pub use hash::SpecHash;
pub use registry::{Lockfile, RegistryScope, SpecRegistry};
pub use repo::{MemoryRepository, PackageDef, PackageRepository};
pub use spec::{AbstractSpec, CompilerSpec, ConcreteSpec, DepKind, DepKindSet, VariantValue};
pub use store::InstallStore;
pub use version::{Version, VersionConstraint};
