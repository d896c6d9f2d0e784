// src/repo/mod.rs

//! Package metadata repository contract
//!
//! The recipe repository is an external collaborator: per package it supplies
//! declared versions (with deprecation/preference flags), declared variants
//! (legal values, defaults, multiplicity), and dependency/conflict/provides
//! rules, each optionally guarded by a condition over the declaring node.
//! This module defines the lookup contract plus [`MemoryRepository`], the
//! data-backed implementation used by fixtures and embedding callers.
//!
//! All lookups are pure data access; guards are declarative [`Condition`]
//! values evaluated against the querying node's partial assignment, never
//! callbacks.

use crate::error::{Error, Result};
use crate::spec::{CompilerSpec, Condition, DependencyEdge, VariantValue};
use crate::version::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One declared version of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: Version,
    pub deprecated: bool,
    pub preferred: bool,
}

/// Legal values for a variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDomain {
    /// On/off flag
    Bool,
    /// Drawn from an enumerated value set
    Values(BTreeSet<String>),
}

/// One declared variant of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDecl {
    pub name: String,
    pub domain: VariantDomain,
    pub default: VariantValue,
    /// Multi-valued variants take any subset of the domain
    pub multi: bool,
    /// Guard scoping the declaration, typically to a version range
    pub when: Condition,
}

impl VariantDecl {
    /// Is the value inside this variant's declared legal set?
    pub fn allows(&self, value: &VariantValue) -> bool {
        match (&self.domain, value) {
            (VariantDomain::Bool, VariantValue::Bool(_)) => true,
            (VariantDomain::Values(legal), VariantValue::Single(v)) => {
                !self.multi && legal.contains(v)
            }
            (VariantDomain::Values(legal), VariantValue::Multi(vs)) => {
                self.multi && !vs.is_empty() && vs.iter().all(|v| legal.contains(v))
            }
            _ => false,
        }
    }
}

/// A declared conflict: when `when` holds, the node must not also match
/// `forbidden`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRule {
    pub when: Condition,
    pub forbidden: Condition,
    pub message: String,
}

/// The attributes of a node a rule guard can see
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub version: Option<&'a Version>,
    pub variants: &'a BTreeMap<String, VariantValue>,
    pub compiler: Option<&'a CompilerSpec>,
}

impl<'a> NodeContext<'a> {
    pub fn eval(&self, condition: &Condition) -> bool {
        condition.eval(self.version, self.variants, self.compiler)
    }
}

/// Read-only lookup contract for package metadata
pub trait PackageRepository: Sync {
    /// Declared versions, or `UnknownPackage`
    fn versions(&self, name: &str) -> Result<Vec<VersionEntry>>;

    /// Variants declared at a concrete version
    fn variants(&self, name: &str, version: &Version) -> Result<Vec<VariantDecl>>;

    /// Dependency rules whose guard holds under the given context
    fn dependencies(&self, name: &str, ctx: &NodeContext) -> Result<Vec<DependencyEdge>>;

    /// Conflict rules whose `when` guard holds; the caller still checks
    /// `forbidden` against the full candidate assignment
    fn conflicts(&self, name: &str, ctx: &NodeContext) -> Result<Vec<ConflictRule>>;

    /// Virtual names this package provides under the given context
    fn provides(&self, name: &str, ctx: &NodeContext) -> Result<Vec<String>>;

    /// All packages that may provide a virtual name, lexically ordered
    fn providers(&self, virtual_name: &str) -> Result<Vec<String>>;

    /// Is this a known concrete package name?
    fn exists(&self, name: &str) -> bool;

    /// Is this name only satisfiable through a provider?
    fn is_virtual(&self, name: &str) -> bool;

    /// Does the package declare that it cannot build with parallel jobs?
    fn serial_only(&self, _name: &str) -> bool {
        false
    }
}

/// One package's declared metadata
#[derive(Debug, Clone, Default)]
pub struct PackageDef {
    name: String,
    versions: Vec<VersionEntry>,
    variants: Vec<VariantDecl>,
    dependencies: Vec<DependencyEdge>,
    conflicts: Vec<ConflictRule>,
    provides: Vec<(String, Condition)>,
    serial_only: bool,
}

impl PackageDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a version; later declarations do not shadow earlier ones
    pub fn version(mut self, v: &str) -> Self {
        self.versions.push(VersionEntry {
            version: Version::parse(v).expect("valid version literal"),
            deprecated: false,
            preferred: false,
        });
        self
    }

    pub fn version_deprecated(mut self, v: &str) -> Self {
        self.versions.push(VersionEntry {
            version: Version::parse(v).expect("valid version literal"),
            deprecated: true,
            preferred: false,
        });
        self
    }

    pub fn version_preferred(mut self, v: &str) -> Self {
        self.versions.push(VersionEntry {
            version: Version::parse(v).expect("valid version literal"),
            deprecated: false,
            preferred: true,
        });
        self
    }

    /// Declare a boolean variant with its default
    pub fn variant_bool(mut self, name: &str, default: bool) -> Self {
        self.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Bool,
            default: VariantValue::Bool(default),
            multi: false,
            when: Condition::Always,
        });
        self
    }

    /// Declare a single-valued variant with an enumerated domain
    pub fn variant_values(mut self, name: &str, legal: &[&str], default: &str) -> Self {
        self.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Values(legal.iter().map(|s| s.to_string()).collect()),
            default: VariantValue::Single(default.to_string()),
            multi: false,
            when: Condition::Always,
        });
        self
    }

    /// Declare a multi-valued variant with an enumerated domain
    pub fn variant_multi(mut self, name: &str, legal: &[&str], default: &[&str]) -> Self {
        self.variants.push(VariantDecl {
            name: name.to_string(),
            domain: VariantDomain::Values(legal.iter().map(|s| s.to_string()).collect()),
            default: VariantValue::multi(default.iter().copied()),
            multi: true,
            when: Condition::Always,
        });
        self
    }

    /// Scope the most recently declared variant with a guard
    pub fn variant_when(mut self, when: Condition) -> Self {
        if let Some(last) = self.variants.last_mut() {
            last.when = when;
        }
        self
    }

    /// Declare an unconditional build+link dependency from spec text
    pub fn depends_on(self, target: &str) -> Self {
        let target = crate::spec::AbstractSpec::parse(target).expect("valid dependency spec");
        self.depends_edge(DependencyEdge::new(target))
    }

    /// Declare a dependency with explicit kinds and guard
    pub fn depends_edge(mut self, edge: DependencyEdge) -> Self {
        self.dependencies.push(edge);
        self
    }

    pub fn conflicts_when(mut self, when: Condition, forbidden: Condition, message: &str) -> Self {
        self.conflicts.push(ConflictRule {
            when,
            forbidden,
            message: message.to_string(),
        });
        self
    }

    pub fn provides(mut self, virtual_name: &str) -> Self {
        self.provides
            .push((virtual_name.to_string(), Condition::Always));
        self
    }

    pub fn provides_when(mut self, virtual_name: &str, when: Condition) -> Self {
        self.provides.push((virtual_name.to_string(), when));
        self
    }

    /// Mark the package as unable to build with parallel jobs
    pub fn serial_only(mut self) -> Self {
        self.serial_only = true;
        self
    }
}

/// Data-backed repository; all metadata supplied up front
#[derive(Debug, Default)]
pub struct MemoryRepository {
    packages: HashMap<String, PackageDef>,
    /// virtual name -> lexically ordered provider package names
    provider_index: BTreeMap<String, BTreeSet<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(packages: impl IntoIterator<Item = PackageDef>) -> Self {
        let mut repo = Self::new();
        for def in packages {
            repo.add(def);
        }
        repo
    }

    pub fn add(&mut self, def: PackageDef) {
        for (virtual_name, _) in &def.provides {
            self.provider_index
                .entry(virtual_name.clone())
                .or_default()
                .insert(def.name.clone());
        }
        self.packages.insert(def.name.clone(), def);
    }

    fn get(&self, name: &str) -> Result<&PackageDef> {
        self.packages
            .get(name)
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))
    }
}

impl PackageRepository for MemoryRepository {
    fn versions(&self, name: &str) -> Result<Vec<VersionEntry>> {
        Ok(self.get(name)?.versions.clone())
    }

    fn variants(&self, name: &str, version: &Version) -> Result<Vec<VariantDecl>> {
        let empty = BTreeMap::new();
        let ctx = NodeContext {
            version: Some(version),
            variants: &empty,
            compiler: None,
        };
        Ok(self
            .get(name)?
            .variants
            .iter()
            .filter(|decl| ctx.eval(&decl.when))
            .cloned()
            .collect())
    }

    fn dependencies(&self, name: &str, ctx: &NodeContext) -> Result<Vec<DependencyEdge>> {
        Ok(self
            .get(name)?
            .dependencies
            .iter()
            .filter(|edge| ctx.eval(&edge.when))
            .cloned()
            .collect())
    }

    fn conflicts(&self, name: &str, ctx: &NodeContext) -> Result<Vec<ConflictRule>> {
        Ok(self
            .get(name)?
            .conflicts
            .iter()
            .filter(|rule| ctx.eval(&rule.when))
            .cloned()
            .collect())
    }

    fn provides(&self, name: &str, ctx: &NodeContext) -> Result<Vec<String>> {
        Ok(self
            .get(name)?
            .provides
            .iter()
            .filter(|(_, when)| ctx.eval(when))
            .map(|(virtual_name, _)| virtual_name.clone())
            .collect())
    }

    fn providers(&self, virtual_name: &str) -> Result<Vec<String>> {
        Ok(self
            .provider_index
            .get(virtual_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn exists(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    fn is_virtual(&self, name: &str) -> bool {
        !self.packages.contains_key(name) && self.provider_index.contains_key(name)
    }

    fn serial_only(&self, name: &str) -> bool {
        self.packages.get(name).is_some_and(|def| def.serial_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionConstraint;

    fn ctx_at<'a>(
        version: &'a Version,
        variants: &'a BTreeMap<String, VariantValue>,
    ) -> NodeContext<'a> {
        NodeContext {
            version: Some(version),
            variants,
            compiler: None,
        }
    }

    #[test]
    fn test_versions_and_flags() {
        let repo = MemoryRepository::with([PackageDef::new("a")
            .version_deprecated("1.0")
            .version("1.1")
            .version("1.2")]);

        let versions = repo.versions("a").unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[0].deprecated);
        assert!(!versions[1].deprecated);

        assert!(matches!(
            repo.versions("missing"),
            Err(Error::UnknownPackage(_))
        ));
    }

    #[test]
    fn test_variant_domain_checks() {
        let decl = VariantDecl {
            name: "io".to_string(),
            domain: VariantDomain::Values(["posix", "mmap"].iter().map(|s| s.to_string()).collect()),
            default: VariantValue::multi(["posix"]),
            multi: true,
            when: Condition::Always,
        };
        assert!(decl.allows(&VariantValue::multi(["posix"])));
        assert!(decl.allows(&VariantValue::multi(["posix", "mmap"])));
        assert!(!decl.allows(&VariantValue::multi(["directio"])));
        assert!(!decl.allows(&VariantValue::Multi(Default::default())));
        assert!(!decl.allows(&VariantValue::Single("posix".to_string())));
    }

    #[test]
    fn test_conditional_dependency_filtering() {
        let repo = MemoryRepository::with([PackageDef::new("app")
            .version("1.0")
            .version("2.0")
            .depends_edge(
                DependencyEdge::new(crate::spec::AbstractSpec::named("newdep")).when(
                    Condition::VersionIn(VersionConstraint::parse("2:").unwrap()),
                ),
            )]);

        let variants = BTreeMap::new();
        let v1 = Version::parse("1.0").unwrap();
        let v2 = Version::parse("2.0").unwrap();

        assert!(repo.dependencies("app", &ctx_at(&v1, &variants)).unwrap().is_empty());
        assert_eq!(
            repo.dependencies("app", &ctx_at(&v2, &variants)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_provider_index() {
        let repo = MemoryRepository::with([
            PackageDef::new("openmpi").version("4.1").provides("mpi"),
            PackageDef::new("mpich").version("4.0").provides("mpi"),
            PackageDef::new("zlib").version("1.3"),
        ]);

        assert!(repo.is_virtual("mpi"));
        assert!(!repo.is_virtual("zlib"));
        assert!(!repo.is_virtual("nothing"));
        // Lexical provider order is part of the deterministic contract
        assert_eq!(repo.providers("mpi").unwrap(), vec!["mpich", "openmpi"]);
    }

    #[test]
    fn test_serial_only_flag() {
        let repo = MemoryRepository::with([
            PackageDef::new("make-hostile").version("1.0").serial_only(),
            PackageDef::new("normal").version("1.0"),
        ]);
        assert!(repo.serial_only("make-hostile"));
        assert!(!repo.serial_only("normal"));
    }
}
