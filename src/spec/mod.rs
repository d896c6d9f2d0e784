// src/spec/mod.rs

//! Package spec model: abstract requests and concrete build-graph nodes
//!
//! An abstract spec is a possibly-underspecified request (`hdf5@1.10: +mpi`),
//! authored as a tree. Concretization turns a forest of abstract specs into
//! DAGs of [`ConcreteSpec`] nodes where every field is single-valued and
//! dependency edges are shared by reference: two parents that must agree on a
//! child point at the *same* node, never at copies.

pub mod canonical;
pub mod parser;

use crate::error::Result;
use crate::hash::SpecHash;
use crate::version::{Version, VersionConstraint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Dependency edge classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepKind {
    Build,
    Link,
    Run,
    Test,
}

impl DepKind {
    pub const ALL: [DepKind; 4] = [DepKind::Build, DepKind::Link, DepKind::Run, DepKind::Test];

    pub fn name(&self) -> &'static str {
        match self {
            DepKind::Build => "build",
            DepKind::Link => "link",
            DepKind::Run => "run",
            DepKind::Test => "test",
        }
    }

    fn bit(self) -> u8 {
        match self {
            DepKind::Build => 1,
            DepKind::Link => 2,
            DepKind::Run => 4,
            DepKind::Test => 8,
        }
    }
}

/// A set of edge kinds, e.g. `{build, link}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DepKindSet(u8);

impl DepKindSet {
    pub fn new(kinds: &[DepKind]) -> Self {
        let mut set = Self::default();
        for k in kinds {
            set.insert(*k);
        }
        set
    }

    /// The default edge classification for an unannotated dependency
    pub fn build_link() -> Self {
        Self::new(&[DepKind::Build, DepKind::Link])
    }

    pub fn insert(&mut self, kind: DepKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: DepKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Union of two kind sets; used when edges to the same child merge
    pub fn union(&self, other: DepKindSet) -> DepKindSet {
        DepKindSet(self.0 | other.0)
    }

    /// This set minus one kind; used when test edges are scoped out
    pub fn without(&self, kind: DepKind) -> DepKindSet {
        DepKindSet(self.0 & !kind.bit())
    }

    pub fn iter(&self) -> impl Iterator<Item = DepKind> + '_ {
        DepKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl fmt::Display for DepKindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|k| k.name()).collect();
        write!(f, "{}", names.join(","))
    }
}

impl Serialize for DepKindSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DepKindSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut set = DepKindSet::default();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            let kind = match part {
                "build" => DepKind::Build,
                "link" => DepKind::Link,
                "run" => DepKind::Run,
                "test" => DepKind::Test,
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "unknown dependency kind '{}'",
                        other
                    )));
                }
            };
            set.insert(kind);
        }
        Ok(set)
    }
}

/// A variant value: boolean flag, single choice, or multi-valued set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    Bool(bool),
    Single(String),
    Multi(BTreeSet<String>),
}

impl VariantValue {
    pub fn multi<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Self {
        Self::Multi(values.into_iter().map(Into::into).collect())
    }

    /// Does a concrete value satisfy this value used as a requirement?
    ///
    /// Multi-valued requirements have subset semantics: requiring
    /// `io=posix` is satisfied by a node built with `io=posix,mmap`.
    pub fn satisfied_by(&self, concrete: &VariantValue) -> bool {
        match (self, concrete) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Single(a), VariantValue::Single(b)) => a == b,
            (VariantValue::Multi(req), VariantValue::Multi(have)) => req.is_subset(have),
            (VariantValue::Single(a), VariantValue::Multi(have)) => have.contains(a),
            _ => false,
        }
    }

    /// Merge two requirements on the same variant, or report the clash
    pub fn merge(&self, other: &VariantValue) -> Option<VariantValue> {
        match (self, other) {
            (VariantValue::Multi(a), VariantValue::Multi(b)) => {
                Some(VariantValue::Multi(a.union(b).cloned().collect()))
            }
            (a, b) if a == b => Some(a.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantValue::Bool(b) => write!(f, "{}", b),
            VariantValue::Single(s) => write!(f, "{}", s),
            VariantValue::Multi(set) => {
                let parts: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// A requirement on one named variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantConstraint {
    pub name: String,
    pub value: VariantValue,
}

impl VariantConstraint {
    pub fn new(name: impl Into<String>, value: VariantValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn on(name: impl Into<String>) -> Self {
        Self::new(name, VariantValue::Bool(true))
    }

    pub fn off(name: impl Into<String>) -> Self {
        Self::new(name, VariantValue::Bool(false))
    }
}

impl fmt::Display for VariantConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            VariantValue::Bool(true) => write!(f, "+{}", self.name),
            VariantValue::Bool(false) => write!(f, "~{}", self.name),
            other => write!(f, "{}={}", self.name, other),
        }
    }
}

/// A requirement on the compiler used to build a node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilerConstraint {
    pub name: String,
    pub versions: VersionConstraint,
}

impl CompilerConstraint {
    pub fn new(name: impl Into<String>, versions: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            versions,
        }
    }

    pub fn any_version(name: impl Into<String>) -> Self {
        Self::new(name, VersionConstraint::Any)
    }

    /// Merge with another compiler requirement on the same node
    pub fn intersect(&self, other: &CompilerConstraint) -> Option<CompilerConstraint> {
        if self.name != other.name {
            return None;
        }
        let versions = self.versions.intersect(&other.versions)?;
        Some(CompilerConstraint {
            name: self.name.clone(),
            versions,
        })
    }
}

impl fmt::Display for CompilerConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.versions.is_any() {
            write!(f, "%{}", self.name)
        } else {
            write!(f, "%{}@{}", self.name, self.versions)
        }
    }
}

/// A fully resolved compiler choice
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerSpec {
    pub name: String,
    pub version: Version,
}

impl CompilerSpec {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for CompilerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A declarative guard over the parent node's (partial) assignment.
///
/// Repository rules are conditional on the node they attach to; the guard
/// language is data, not code, so the solver can evaluate and re-evaluate it
/// as the assignment is refined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Always,
    /// The node's selected version falls in the given constraint
    VersionIn(VersionConstraint),
    /// The node carries this variant value (subset semantics for multi)
    Variant(String, VariantValue),
    /// The node is built with the named compiler
    Compiler(String),
    All(Vec<Condition>),
    AnyOf(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluate against a partial assignment. Attributes not yet assigned
    /// make their atoms false; the fixpoint loop re-evaluates after every
    /// refinement, so a guard that becomes true is picked up then.
    pub fn eval(
        &self,
        version: Option<&Version>,
        variants: &BTreeMap<String, VariantValue>,
        compiler: Option<&CompilerSpec>,
    ) -> bool {
        match self {
            Condition::Always => true,
            Condition::VersionIn(vc) => version.is_some_and(|v| vc.satisfies(v)),
            Condition::Variant(name, want) => variants
                .get(name)
                .is_some_and(|have| want.satisfied_by(have)),
            Condition::Compiler(name) => compiler.is_some_and(|c| c.name == *name),
            Condition::All(conds) => conds.iter().all(|c| c.eval(version, variants, compiler)),
            Condition::AnyOf(conds) => conds.iter().any(|c| c.eval(version, variants, compiler)),
            Condition::Not(inner) => !inner.eval(version, variants, compiler),
        }
    }
}

/// An outgoing dependency requirement of an abstract spec or repository rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub kinds: DepKindSet,
    pub when: Condition,
    pub target: AbstractSpec,
}

impl DependencyEdge {
    pub fn new(target: AbstractSpec) -> Self {
        Self {
            kinds: DepKindSet::build_link(),
            when: Condition::Always,
            target,
        }
    }

    pub fn with_kinds(mut self, kinds: DepKindSet) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = condition;
        self
    }
}

/// A possibly-underspecified package request
///
/// Immutable once parsed; any field may be unconstrained. Authored as a tree,
/// but several parents may name the same target package — those requirements
/// are joined during concretization, not here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbstractSpec {
    pub name: String,
    pub versions: VersionConstraint,
    pub variants: Vec<VariantConstraint>,
    pub compiler: Option<CompilerConstraint>,
    pub arch: Option<String>,
    pub deps: Vec<DependencyEdge>,
}

impl AbstractSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse from text form; see [`parser`]
    pub fn parse(text: &str) -> Result<Self> {
        parser::parse_spec(text)
    }

    pub fn with_versions(mut self, versions: VersionConstraint) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_variant(mut self, constraint: VariantConstraint) -> Self {
        self.variants.push(constraint);
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerConstraint) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_dep(mut self, edge: DependencyEdge) -> Self {
        self.deps.push(edge);
        self
    }
}

impl fmt::Display for AbstractSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.versions.is_any() {
            write!(f, "@{}", self.versions)?;
        }
        for variant in &self.variants {
            write!(f, " {}", variant)?;
        }
        if let Some(compiler) = &self.compiler {
            write!(f, " {}", compiler)?;
        }
        if let Some(arch) = &self.arch {
            write!(f, " arch={}", arch)?;
        }
        for dep in &self.deps {
            write!(f, " ^{}", dep.target)?;
        }
        Ok(())
    }
}

/// A resolved dependency edge in a concrete DAG
#[derive(Debug, Clone)]
pub struct ConcreteDep {
    pub kinds: DepKindSet,
    pub spec: Arc<ConcreteSpec>,
}

/// A fully resolved node in a build DAG
///
/// Every field is single-valued. Nodes are immutable after materialization;
/// editing requires re-concretizing. Dependencies hold `Arc` references so
/// unified children are shared, not copied, and the DAG hash is memoized per
/// node identity.
#[derive(Debug)]
pub struct ConcreteSpec {
    pub name: String,
    pub version: Version,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerSpec,
    pub arch: String,
    pub deps: BTreeMap<String, ConcreteDep>,
    hash: OnceLock<SpecHash>,
}

impl ConcreteSpec {
    pub fn new(
        name: String,
        version: Version,
        variants: BTreeMap<String, VariantValue>,
        compiler: CompilerSpec,
        arch: String,
        deps: BTreeMap<String, ConcreteDep>,
    ) -> Self {
        Self {
            name,
            version,
            variants,
            compiler,
            arch,
            deps,
            hash: OnceLock::new(),
        }
    }

    /// The canonical DAG hash of this node (computed once, then cached)
    pub fn dag_hash(&self) -> &SpecHash {
        self.hash
            .get_or_init(|| canonical::hash_node(self))
    }

    /// Walk this node and all descendants, children before parents, each
    /// distinct node exactly once
    pub fn traverse(self: &Arc<Self>) -> Vec<Arc<ConcreteSpec>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        fn visit(
            node: &Arc<ConcreteSpec>,
            seen: &mut BTreeSet<SpecHash>,
            order: &mut Vec<Arc<ConcreteSpec>>,
        ) {
            if !seen.insert(node.dag_hash().clone()) {
                return;
            }
            for dep in node.deps.values() {
                visit(&dep.spec, seen, order);
            }
            order.push(Arc::clone(node));
        }
        visit(self, &mut seen, &mut order);
        order
    }

    /// Does this concrete node satisfy an abstract requirement?
    ///
    /// This is the check behind invariant 2: every edge's target satisfies
    /// the constraint that produced the edge.
    pub fn satisfies(&self, abstract_spec: &AbstractSpec) -> bool {
        if !abstract_spec.name.is_empty() && self.name != abstract_spec.name {
            return false;
        }
        if !abstract_spec.versions.satisfies(&self.version) {
            return false;
        }
        for vc in &abstract_spec.variants {
            match self.variants.get(&vc.name) {
                Some(have) if vc.value.satisfied_by(have) => {}
                _ => return false,
            }
        }
        if let Some(cc) = &abstract_spec.compiler {
            if self.compiler.name != cc.name || !cc.versions.satisfies(&self.compiler.version) {
                return false;
            }
        }
        if let Some(arch) = &abstract_spec.arch
            && *arch != self.arch
        {
            return false;
        }
        true
    }

    /// Lookup a direct dependency by package name
    pub fn dep(&self, name: &str) -> Option<&Arc<ConcreteSpec>> {
        self.deps.get(name).map(|d| &d.spec)
    }
}

impl fmt::Display for ConcreteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        for (name, value) in &self.variants {
            match value {
                VariantValue::Bool(true) => write!(f, " +{}", name)?,
                VariantValue::Bool(false) => write!(f, " ~{}", name)?,
                other => write!(f, " {}={}", name, other)?,
            }
        }
        write!(f, " %{} arch={}", self.compiler, self.arch)
    }
}
