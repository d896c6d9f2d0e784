// src/concretize/engine.rs

//! The concretization engine
//!
//! One [`Solver`] run handles one unification scope: all roots that must
//! share nodes. The algorithm alternates two phases until they agree:
//!
//! 1. **Expansion** rebuilds the requirement graph from the roots, walking
//!    dependency rules whose guards hold under the previous iteration's
//!    assignments and merging every constraint that reaches a package.
//! 2. **Assignment** picks the best admissible (version, variants, compiler,
//!    arch) tuple per node under the merged constraints, skipping candidates
//!    that trigger declared conflicts.
//!
//! Expansion is a pure function of the assignments, so when a pass leaves the
//! assignments unchanged the pair is a fixpoint and the graph is final. All
//! iteration is over `BTreeMap`s and all ranking ties break lexically, so
//! identical inputs concretize bit-for-bit identically.

use crate::concretize::graph::{Candidate, SolveGraph, REQUEST};
use crate::config::{Config, TestMode};
use crate::error::{Error, Result};
use crate::repo::{NodeContext, PackageRepository, VersionEntry};
use crate::spec::{
    AbstractSpec, CompilerSpec, DepKind, DepKindSet, DependencyEdge, VariantValue,
};
use crate::version::{none_high, Version};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Expansion/assignment rounds before declaring divergence. Fixpoints are
/// reached in a handful of rounds on real metadata; hitting the cap means
/// guard rules oscillate.
const MAX_ITERATIONS: usize = 64;

pub(crate) struct Solver<'a> {
    repo: &'a dyn PackageRepository,
    config: &'a Config,
}

/// A settled solve: the final graph plus the chosen assignment per node
pub(crate) struct Solution {
    pub graph: SolveGraph,
    pub assignments: BTreeMap<String, Candidate>,
    /// Solver-node name of each requested root, in request order
    pub root_names: Vec<String>,
}

enum Work {
    /// Expand the repository's dependency rules of a node (once per pass)
    Rules(String),
    /// Apply one discovered edge from `parent`
    Edge {
        parent: String,
        edge: DependencyEdge,
    },
}

impl<'a> Solver<'a> {
    pub fn new(repo: &'a dyn PackageRepository, config: &'a Config) -> Self {
        Self { repo, config }
    }

    /// Solve one unification scope to fixpoint
    pub fn solve(&self, roots: &[AbstractSpec]) -> Result<Solution> {
        let mut assignments: BTreeMap<String, Candidate> = BTreeMap::new();

        for iteration in 0..MAX_ITERATIONS {
            let (graph, root_names) = self.expand(roots, &assignments)?;
            let next = self.assign(&graph)?;

            if next == assignments {
                debug!(iterations = iteration + 1, nodes = graph.nodes.len(), "solve settled");
                graph.check_acyclic()?;
                return Ok(Solution {
                    graph,
                    assignments,
                    root_names,
                });
            }
            assignments = next;
        }

        Err(Error::SolverError(format!(
            "expansion did not settle after {} rounds; conditional rules likely oscillate",
            MAX_ITERATIONS
        )))
    }

    /// Rebuild the requirement graph from the roots under the given
    /// assignments. Returns the graph and the resolved root node names.
    fn expand(
        &self,
        roots: &[AbstractSpec],
        assignments: &BTreeMap<String, Candidate>,
    ) -> Result<(SolveGraph, Vec<String>)> {
        let mut graph = SolveGraph::new();
        let mut queue: VecDeque<Work> = VecDeque::new();
        let mut root_names = Vec::with_capacity(roots.len());

        for root in roots {
            let (name, _) = self.resolve_target(&root.name)?;
            graph.node_mut(&name, true).apply(REQUEST, root)?;
            root_names.push(name.clone());
            queue.push_back(Work::Rules(name.clone()));
            for edge in &root.deps {
                queue.push_back(Work::Edge {
                    parent: name.clone(),
                    edge: edge.clone(),
                });
            }
        }

        let mut rules_done: BTreeSet<String> = BTreeSet::new();
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Rules(name) => {
                    if !rules_done.insert(name.clone()) {
                        continue;
                    }
                    let empty = BTreeMap::new();
                    let ctx = context_of(assignments.get(&name), &empty);
                    for edge in self.repo.dependencies(&name, &ctx)? {
                        queue.push_back(Work::Edge {
                            parent: name.clone(),
                            edge,
                        });
                    }
                }
                Work::Edge { parent, edge } => {
                    let empty = BTreeMap::new();
                    let ctx = context_of(assignments.get(&parent), &empty);
                    if !ctx.eval(&edge.when) {
                        continue;
                    }

                    let parent_is_root = graph
                        .nodes
                        .get(&parent)
                        .is_some_and(|node| node.is_root);
                    let kinds = self.scoped_kinds(edge.kinds, parent_is_root);
                    if kinds.is_empty() {
                        continue;
                    }

                    let (child_name, via_virtual) = self.resolve_target(&edge.target.name)?;
                    graph
                        .node_mut(&child_name, false)
                        .apply(&parent, &edge.target)?;
                    graph
                        .node_mut(&parent, false)
                        .add_edge(&child_name, kinds, via_virtual);

                    // The target's own dependency clauses attach to the child
                    for nested in &edge.target.deps {
                        queue.push_back(Work::Edge {
                            parent: child_name.clone(),
                            edge: nested.clone(),
                        });
                    }
                    queue.push_back(Work::Rules(child_name));
                }
            }
        }

        Ok((graph, root_names))
    }

    /// Drop `test` from an edge's kinds unless the inclusion mode keeps it.
    /// Mode `Root` keeps test edges only on requested roots, never
    /// transitively through non-root nodes.
    fn scoped_kinds(&self, kinds: DepKindSet, parent_is_root: bool) -> DepKindSet {
        let keep_test = match self.config.tests {
            TestMode::All => true,
            TestMode::Root => parent_is_root,
            TestMode::None => false,
        };
        if keep_test {
            kinds
        } else {
            kinds.without(DepKind::Test)
        }
    }

    /// Map a dependency target to a solver-node name, resolving virtual
    /// names to a deterministic provider.
    fn resolve_target(&self, name: &str) -> Result<(String, Option<String>)> {
        if self.repo.exists(name) {
            return Ok((name.to_string(), None));
        }
        if self.repo.is_virtual(name) {
            let providers = self.repo.providers(name)?;
            // Configured provider order wins; lexical order otherwise
            let chosen = self
                .config
                .prefs(name)
                .and_then(|prefs| {
                    prefs
                        .providers
                        .iter()
                        .find(|p| providers.iter().any(|q| q == *p))
                })
                .cloned()
                .or_else(|| providers.first().cloned())
                .ok_or_else(|| Error::UnknownPackage(name.to_string()))?;
            return Ok((chosen, Some(name.to_string())));
        }
        Err(Error::UnknownPackage(name.to_string()))
    }

    /// Choose the best candidate for every node in the graph
    fn assign(&self, graph: &SolveGraph) -> Result<BTreeMap<String, Candidate>> {
        let mut assignments = BTreeMap::new();
        for (name, node) in &graph.nodes {
            assignments.insert(name.clone(), self.choose_candidate(node)?);
        }
        Ok(assignments)
    }

    fn choose_candidate(&self, node: &crate::concretize::graph::SolveNode) -> Result<Candidate> {
        let arch = match &node.arch {
            None => self.config.target_arch.clone(),
            Some(a) if *a == self.config.target_arch => a.clone(),
            Some(a) => {
                return Err(Error::UnsatisfiableSpec {
                    package: node.name.clone(),
                    conflicts: vec![
                        format!("requested arch={}", a),
                        format!("concretization target is arch={}", self.config.target_arch),
                    ],
                });
            }
        };

        let compiler = self.pick_compiler(node)?;

        let declared = self.repo.versions(&node.name)?;
        // Admissibility is an independent per-version check; filter in
        // parallel, then rank sequentially so ordering stays deterministic.
        let mut admissible: Vec<&VersionEntry> = declared
            .par_iter()
            .filter(|entry| node.versions.satisfies(&entry.version))
            .collect();
        if admissible.is_empty() {
            return Err(Error::NoValidVersion {
                package: node.name.clone(),
                constraint: node.versions.to_string(),
            });
        }

        let prefs = self.config.prefs(&node.name);
        let pref_rank = |v: &Version| -> Option<usize> {
            prefs.and_then(|p| p.versions.iter().position(|want| want == v))
        };
        admissible.sort_by(|a, b| {
            // Deprecated last, then configured preference order (absent
            // sorts worst), then the declared preferred flag, then newest,
            // then the literal token as the stable final tie-break.
            a.deprecated
                .cmp(&b.deprecated)
                .then_with(|| {
                    let ra = pref_rank(&a.version);
                    let rb = pref_rank(&b.version);
                    none_high::cmp(ra.as_ref(), rb.as_ref())
                })
                .then_with(|| b.preferred.cmp(&a.preferred))
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| a.version.as_str().cmp(b.version.as_str()))
        });

        let mut rejections: Vec<String> = Vec::new();
        let mut variant_error: Option<Error> = None;

        for entry in admissible {
            let variants = match self.assign_variants(node, &entry.version) {
                Ok(map) => map,
                Err(err) => {
                    // The variant may be declared at another admissible
                    // version; remember the first failure and keep looking.
                    if variant_error.is_none() {
                        variant_error = Some(err);
                    }
                    continue;
                }
            };

            let candidate = Candidate {
                version: entry.version.clone(),
                deprecated: entry.deprecated,
                variants,
                compiler: compiler.clone(),
                arch: arch.clone(),
            };

            let ctx = NodeContext {
                version: Some(&candidate.version),
                variants: &candidate.variants,
                compiler: Some(&candidate.compiler),
            };
            let triggered = self
                .repo
                .conflicts(&node.name, &ctx)?
                .into_iter()
                .find(|rule| ctx.eval(&rule.forbidden));
            match triggered {
                Some(rule) => {
                    rejections.push(format!(
                        "version {} conflicts: {}",
                        candidate.version, rule.message
                    ));
                }
                None => return Ok(candidate),
            }
        }

        if let Some(err) = variant_error
            && rejections.is_empty()
        {
            return Err(err);
        }

        rejections.push(format!("under constraint @{}", node.versions));
        Err(Error::UnsatisfiableSpec {
            package: node.name.clone(),
            conflicts: rejections,
        })
    }

    /// Variant assignment at one candidate version: declared defaults,
    /// overridden by configured preferences, overridden by requirements;
    /// everything checked against the declared legal set.
    fn assign_variants(
        &self,
        node: &crate::concretize::graph::SolveNode,
        version: &Version,
    ) -> Result<BTreeMap<String, VariantValue>> {
        let decls = self.repo.variants(&node.name, version)?;
        let by_name: BTreeMap<&str, &crate::repo::VariantDecl> =
            decls.iter().map(|d| (d.name.as_str(), d)).collect();

        let prefs = self.config.prefs(&node.name);
        let mut assigned = BTreeMap::new();
        for decl in &decls {
            let preferred = prefs
                .and_then(|p| p.variants.get(&decl.name))
                .filter(|value| decl.allows(value));
            assigned.insert(
                decl.name.clone(),
                preferred.cloned().unwrap_or_else(|| decl.default.clone()),
            );
        }

        for (name, req) in &node.variant_reqs {
            let decl = by_name.get(name.as_str()).ok_or_else(|| Error::InvalidVariant {
                package: node.name.clone(),
                variant: name.clone(),
                reason: format!("not declared at version {}", version),
            })?;

            // A single required value on a multi-valued variant means the
            // set containing it
            let value = match (decl.multi, req) {
                (true, VariantValue::Single(v)) => VariantValue::multi([v.clone()]),
                _ => req.clone(),
            };

            if !decl.allows(&value) {
                return Err(Error::InvalidVariant {
                    package: node.name.clone(),
                    variant: name.clone(),
                    reason: format!("value '{}' is outside the declared legal set", value),
                });
            }
            assigned.insert(name.clone(), value);
        }

        Ok(assigned)
    }

    /// First configured compiler satisfying the node's constraint; the
    /// config list order is the preference order.
    fn pick_compiler(&self, node: &crate::concretize::graph::SolveNode) -> Result<CompilerSpec> {
        match &node.compiler {
            None => self
                .config
                .compilers
                .first()
                .map(crate::config::Compiler::spec)
                .ok_or_else(|| Error::NoSuchCompiler {
                    constraint: "%<any>".to_string(),
                }),
            Some(cc) => self
                .config
                .compilers
                .iter()
                .find(|c| c.name == cc.name && cc.versions.satisfies(&c.version))
                .map(crate::config::Compiler::spec)
                .ok_or_else(|| Error::NoSuchCompiler {
                    constraint: cc.to_string(),
                }),
        }
    }
}

/// Guard-evaluation context from a previous-iteration assignment.
/// Unassigned nodes see no attributes, so their conditional rules stay
/// closed until a later pass.
fn context_of<'a>(
    candidate: Option<&'a Candidate>,
    empty_variants: &'a BTreeMap<String, VariantValue>,
) -> NodeContext<'a> {
    match candidate {
        Some(c) => NodeContext {
            version: Some(&c.version),
            variants: &c.variants,
            compiler: Some(&c.compiler),
        },
        None => NodeContext {
            version: None,
            variants: empty_variants,
            compiler: None,
        },
    }
}
