// src/concretize/mod.rs

//! Concretization: turning abstract requests into concrete build DAGs
//!
//! The entry points are [`Concretizer::concretize`] for a single request and
//! [`Concretizer::concretize_all`] for a forest under the configured unify
//! policy. Concretization is a single-threaded, deterministic computation:
//! the same roots, repository data, and configuration always produce DAGs
//! with byte-identical hashes. It is also all-or-nothing — any unsatisfiable
//! node aborts the whole request; no partially concrete DAG is ever
//! returned.

mod engine;
mod graph;
mod materialize;

use crate::config::{Config, UnifyPolicy};
use crate::error::{Error, Result};
use crate::repo::PackageRepository;
use crate::spec::{AbstractSpec, ConcreteSpec};
use engine::Solver;
use std::sync::Arc;
use tracing::{debug, info};

/// The constraint-satisfaction engine over one repository and configuration
pub struct Concretizer<'a> {
    repo: &'a dyn PackageRepository,
    config: &'a Config,
}

impl<'a> Concretizer<'a> {
    pub fn new(repo: &'a dyn PackageRepository, config: &'a Config) -> Self {
        Self { repo, config }
    }

    /// Concretize a single abstract spec into a concrete DAG
    pub fn concretize(&self, root: &AbstractSpec) -> Result<Arc<ConcreteSpec>> {
        let mut dags = self.solve_scope(std::slice::from_ref(root))?;
        Ok(dags.remove(0))
    }

    /// Concretize a forest of roots under the configured unify policy.
    ///
    /// Returned DAGs are in request order. Under `Together` every package
    /// name resolves to one shared node across all roots; under
    /// `WhenPossible` an unmergeable forest falls back to per-root solves
    /// instead of failing; under `Separately` each root is independent.
    pub fn concretize_all(&self, roots: &[AbstractSpec]) -> Result<Vec<Arc<ConcreteSpec>>> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        match self.config.unify {
            UnifyPolicy::Together => self.solve_scope(roots),
            UnifyPolicy::Separately => self.solve_each(roots),
            UnifyPolicy::WhenPossible => match self.solve_scope(roots) {
                Ok(dags) => Ok(dags),
                Err(Error::UnsatisfiableSpec { package, .. }) => {
                    debug!(package = %package, "roots cannot unify; falling back to per-root solves");
                    self.solve_each(roots)
                }
                Err(other) => Err(other),
            },
        }
    }

    /// One unification scope: all roots share one solver graph
    fn solve_scope(&self, roots: &[AbstractSpec]) -> Result<Vec<Arc<ConcreteSpec>>> {
        let solver = Solver::new(self.repo, self.config);
        let solution = solver.solve(roots)?;
        let built = materialize::materialize(&solution)?;

        let dags: Vec<Arc<ConcreteSpec>> = solution
            .root_names
            .iter()
            .map(|name| Arc::clone(&built[name]))
            .collect();
        for dag in &dags {
            info!(spec = %dag, hash = dag.dag_hash().short(), "concretized");
        }
        Ok(dags)
    }

    fn solve_each(&self, roots: &[AbstractSpec]) -> Result<Vec<Arc<ConcreteSpec>>> {
        roots
            .iter()
            .map(|root| {
                let mut dags = self.solve_scope(std::slice::from_ref(root))?;
                Ok(dags.remove(0))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compiler;
    use crate::repo::{MemoryRepository, PackageDef};
    use crate::spec::{Condition, DepKind, DepKindSet, DependencyEdge, VariantValue};
    use crate::version::{Version, VersionConstraint};

    fn config() -> Config {
        Config::new().with_compiler(Compiler::new("gcc", "12.2"))
    }

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_single_package_newest_version() {
        let repo = MemoryRepository::with([PackageDef::new("zlib")
            .version("1.2.13")
            .version("1.3")]);
        let cfg = config();
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("zlib").unwrap())
            .unwrap();

        assert_eq!(dag.name, "zlib");
        assert_eq!(dag.version, version("1.3"));
        assert_eq!(dag.compiler.name, "gcc");
        assert!(dag.deps.is_empty());
    }

    #[test]
    fn test_transitive_expansion_and_edge_satisfaction() {
        let repo = MemoryRepository::with([
            PackageDef::new("app").version("1.0").depends_on("libpng@1.6:"),
            PackageDef::new("libpng").version("1.6.40").depends_on("zlib@1.2:"),
            PackageDef::new("zlib").version("1.2.13").version("1.3"),
        ]);
        let cfg = config();
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap();

        let libpng = dag.dep("libpng").unwrap();
        let zlib = libpng.dep("zlib").unwrap();
        assert_eq!(zlib.version, version("1.3"));
        assert!(libpng.satisfies(&AbstractSpec::parse("libpng@1.6:").unwrap()));
        assert!(zlib.satisfies(&AbstractSpec::parse("zlib@1.2:").unwrap()));
    }

    #[test]
    fn test_conditional_dependency_appears_after_refinement() {
        // The dep guard references the parent's own selected version, so it
        // only opens once an assignment exists: the fixpoint loop must pick
        // it up on a later pass.
        let repo = MemoryRepository::with([
            PackageDef::new("app").version("2.0").version("1.0").depends_edge(
                DependencyEdge::new(AbstractSpec::named("extra")).when(Condition::VersionIn(
                    VersionConstraint::parse("2:").unwrap(),
                )),
            ),
            PackageDef::new("extra").version("1.0"),
        ]);
        let cfg = config();
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap();

        assert_eq!(dag.version, version("2.0"));
        assert!(dag.dep("extra").is_some());
    }

    #[test]
    fn test_conditional_dependency_stays_closed() {
        let repo = MemoryRepository::with([
            PackageDef::new("app").version("2.0").version("1.0").depends_edge(
                DependencyEdge::new(AbstractSpec::named("extra")).when(Condition::VersionIn(
                    VersionConstraint::parse("2:").unwrap(),
                )),
            ),
            PackageDef::new("extra").version("1.0"),
        ]);
        let cfg = config();
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app@:1").unwrap())
            .unwrap();

        assert_eq!(dag.version, version("1.0"));
        assert!(dag.dep("extra").is_none());
    }

    #[test]
    fn test_virtual_provider_resolution_prefers_config() {
        let repo = MemoryRepository::with([
            PackageDef::new("app").version("1.0").depends_on("mpi"),
            PackageDef::new("mpich").version("4.1").provides("mpi"),
            PackageDef::new("openmpi").version("4.1.5").provides("mpi"),
        ]);

        // Lexical fallback picks mpich
        let cfg = config();
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap();
        assert!(dag.dep("mpich").is_some());

        // Configured provider order wins
        let mut cfg = config();
        cfg.packages.entry("mpi".to_string()).or_default().providers =
            vec!["openmpi".to_string()];
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap();
        assert!(dag.dep("openmpi").is_some());
        assert!(dag.dep("mpich").is_none());
    }

    #[test]
    fn test_cyclic_virtual_provision_detected() {
        // The only provider of "vio" itself depends on "vio"
        let repo = MemoryRepository::with([
            PackageDef::new("app").version("1.0").depends_on("vio"),
            PackageDef::new("pio")
                .version("1.0")
                .provides("vio")
                .depends_edge(
                    DependencyEdge::new(AbstractSpec::named("vio"))
                        .with_kinds(DepKindSet::new(&[DepKind::Link])),
                ),
        ]);
        let cfg = config();
        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::CyclicVirtualDependency { .. }));
    }

    #[test]
    fn test_unknown_package_fails() {
        let repo = MemoryRepository::with([PackageDef::new("app")
            .version("1.0")
            .depends_on("nosuchthing")]);
        let cfg = config();
        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPackage(name) if name == "nosuchthing"));
    }

    #[test]
    fn test_no_compiler_configured() {
        let repo = MemoryRepository::with([PackageDef::new("zlib").version("1.3")]);
        let cfg = Config::new();
        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("zlib").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchCompiler { .. }));
    }

    #[test]
    fn test_compiler_constraint_picks_matching_entry() {
        let repo = MemoryRepository::with([PackageDef::new("zlib").version("1.3")]);
        let cfg = Config::new()
            .with_compiler(Compiler::new("gcc", "12.2"))
            .with_compiler(Compiler::new("clang", "15.0"));

        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("zlib %clang").unwrap())
            .unwrap();
        assert_eq!(dag.compiler.name, "clang");

        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("zlib %icc").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchCompiler { .. }));
    }

    #[test]
    fn test_variant_defaults_requirements_and_domains() {
        let repo = MemoryRepository::with([PackageDef::new("hdf5")
            .version("1.12")
            .variant_bool("mpi", false)
            .variant_values("api", &["v110", "v112"], "v112")
            .variant_multi("io", &["posix", "mmap", "directio"], &["posix"])]);
        let cfg = config();

        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("hdf5 +mpi io=mmap,posix").unwrap())
            .unwrap();
        assert_eq!(dag.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(dag.variants["api"], VariantValue::Single("v112".to_string()));
        assert_eq!(dag.variants["io"], VariantValue::multi(["mmap", "posix"]));

        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("hdf5 api=v999").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVariant { .. }));

        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("hdf5 +nosuchvariant").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVariant { .. }));
    }

    #[test]
    fn test_conflict_rule_falls_back_to_older_version() {
        // 2.0 conflicts with +cuda; the solver must fall back to 1.9
        let repo = MemoryRepository::with([PackageDef::new("solverlib")
            .version("2.0")
            .version("1.9")
            .variant_bool("cuda", false)
            .conflicts_when(
                Condition::VersionIn(VersionConstraint::parse("2:").unwrap()),
                Condition::Variant("cuda".to_string(), VariantValue::Bool(true)),
                "cuda support was removed in 2.0",
            )]);
        let cfg = config();

        let plain = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("solverlib").unwrap())
            .unwrap();
        assert_eq!(plain.version, version("2.0"));

        let cuda = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("solverlib +cuda").unwrap())
            .unwrap();
        assert_eq!(cuda.version, version("1.9"));
        assert_eq!(cuda.variants["cuda"], VariantValue::Bool(true));
    }

    #[test]
    fn test_conflict_exhaustion_is_unsatisfiable() {
        let repo = MemoryRepository::with([PackageDef::new("solverlib")
            .version("2.0")
            .variant_bool("cuda", false)
            .conflicts_when(
                Condition::Always,
                Condition::Variant("cuda".to_string(), VariantValue::Bool(true)),
                "cuda is not supported on this platform",
            )]);
        let cfg = config();
        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("solverlib +cuda").unwrap())
            .unwrap_err();
        match err {
            Error::UnsatisfiableSpec { package, conflicts } => {
                assert_eq!(package, "solverlib");
                assert!(conflicts.iter().any(|c| c.contains("cuda is not supported")));
            }
            other => panic!("expected UnsatisfiableSpec, got {other:?}"),
        }
    }

    #[test]
    fn test_arch_mismatch_fails() {
        let repo = MemoryRepository::with([PackageDef::new("zlib").version("1.3")]);
        let mut cfg = config();
        cfg.target_arch = "x86_64".to_string();
        let err = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("zlib arch=aarch64").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::UnsatisfiableSpec { .. }));
    }
}
