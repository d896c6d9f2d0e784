// src/concretize/graph.rs

//! Expansion graph for one solve
//!
//! Each solve owns one [`SolveGraph`]: a map from package name to the node
//! accumulating every requirement that reaches it, plus the dependency edges
//! discovered so far. The graph is rebuilt from the roots on every solver
//! iteration, so nodes whose guards stopped holding simply vanish; the only
//! state carried between iterations is the assignment map.

use crate::error::{Error, Result};
use crate::spec::{AbstractSpec, CompilerConstraint, CompilerSpec, DepKindSet, VariantValue};
use crate::version::{Version, VersionConstraint};
use std::collections::{BTreeMap, BTreeSet};

/// Requirement source label used in unsatisfiability reports
pub(crate) const REQUEST: &str = "the request";

/// A tentative, fully-enumerated assignment for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub version: Version,
    pub deprecated: bool,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerSpec,
    pub arch: String,
}

/// An edge discovered during expansion
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EdgeBuild {
    pub kinds: DepKindSet,
    /// Set when the edge reached its child through a virtual name
    pub via_virtual: Option<String>,
}

/// One package node with its accumulated requirements
#[derive(Debug)]
pub(crate) struct SolveNode {
    pub name: String,
    pub is_root: bool,
    pub versions: VersionConstraint,
    /// (source, constraint) pairs behind `versions`, for error reports
    pub version_sources: Vec<(String, VersionConstraint)>,
    /// Merged variant requirements from every reaching edge
    pub variant_reqs: BTreeMap<String, VariantValue>,
    pub compiler: Option<CompilerConstraint>,
    pub arch: Option<String>,
    /// Outgoing edges keyed by child package name
    pub edges: BTreeMap<String, EdgeBuild>,
}

impl SolveNode {
    fn new(name: &str, is_root: bool) -> Self {
        Self {
            name: name.to_string(),
            is_root,
            versions: VersionConstraint::Any,
            version_sources: Vec::new(),
            variant_reqs: BTreeMap::new(),
            compiler: None,
            arch: None,
            edges: BTreeMap::new(),
        }
    }

    /// Fold an abstract requirement into this node, or report why it cannot
    /// be combined with what is already here.
    pub fn apply(&mut self, source: &str, req: &AbstractSpec) -> Result<()> {
        if !req.versions.is_any() {
            self.version_sources
                .push((source.to_string(), req.versions.clone()));
            self.versions = match self.versions.intersect(&req.versions) {
                Some(merged) => merged,
                None => {
                    return Err(Error::UnsatisfiableSpec {
                        package: self.name.clone(),
                        conflicts: minimal_conflict_set(&self.version_sources),
                    });
                }
            };
        }

        for vc in &req.variants {
            match self.variant_reqs.get(&vc.name) {
                None => {
                    self.variant_reqs.insert(vc.name.clone(), vc.value.clone());
                }
                Some(existing) => match existing.merge(&vc.value) {
                    Some(merged) => {
                        self.variant_reqs.insert(vc.name.clone(), merged);
                    }
                    None => {
                        return Err(Error::UnsatisfiableSpec {
                            package: self.name.clone(),
                            conflicts: vec![
                                format!("{}={}", vc.name, existing),
                                format!("{} requires {}={}", source, vc.name, vc.value),
                            ],
                        });
                    }
                },
            }
        }

        if let Some(cc) = &req.compiler {
            self.compiler = Some(match &self.compiler {
                None => cc.clone(),
                Some(existing) => existing.intersect(cc).ok_or_else(|| {
                    Error::UnsatisfiableSpec {
                        package: self.name.clone(),
                        conflicts: vec![
                            existing.to_string(),
                            format!("{} requires {}", source, cc),
                        ],
                    }
                })?,
            });
        }

        if let Some(arch) = &req.arch {
            match &self.arch {
                None => self.arch = Some(arch.clone()),
                Some(existing) if existing == arch => {}
                Some(existing) => {
                    return Err(Error::UnsatisfiableSpec {
                        package: self.name.clone(),
                        conflicts: vec![
                            format!("arch={}", existing),
                            format!("{} requires arch={}", source, arch),
                        ],
                    });
                }
            }
        }

        Ok(())
    }

    pub fn add_edge(&mut self, child: &str, kinds: DepKindSet, via_virtual: Option<String>) {
        let edge = self.edges.entry(child.to_string()).or_insert(EdgeBuild {
            kinds: DepKindSet::default(),
            via_virtual: via_virtual.clone(),
        });
        edge.kinds = edge.kinds.union(kinds);
        if edge.via_virtual.is_none() {
            edge.via_virtual = via_virtual;
        }
    }
}

/// The whole expansion graph for one solve
#[derive(Debug, Default)]
pub(crate) struct SolveGraph {
    pub nodes: BTreeMap<String, SolveNode>,
}

impl SolveGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_mut(&mut self, name: &str, is_root: bool) -> &mut SolveNode {
        let node = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| SolveNode::new(name, is_root));
        node.is_root |= is_root;
        node
    }

    /// Find a dependency cycle, if any, returning it as a name path.
    ///
    /// Concrete DAGs must be acyclic; a cycle through a virtual-resolved edge
    /// is reported as cyclic virtual provision.
    pub fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn visit(
            graph: &SolveGraph,
            name: &str,
            marks: &mut BTreeMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.push(name.to_string());

                    // Name the virtual if the cycle crosses a provider edge
                    for pair in cycle.windows(2) {
                        if let Some(node) = graph.nodes.get(&pair[0])
                            && let Some(edge) = node.edges.get(&pair[1])
                            && let Some(virtual_name) = &edge.via_virtual
                        {
                            return Err(Error::CyclicVirtualDependency {
                                virtual_name: virtual_name.clone(),
                                chain: cycle,
                            });
                        }
                    }
                    return Err(Error::CyclicDependency { cycle });
                }
                None => {}
            }

            marks.insert(name.to_string(), Mark::InProgress);
            stack.push(name.to_string());
            if let Some(node) = graph.nodes.get(name) {
                for child in node.edges.keys() {
                    visit(graph, child, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(name.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for name in self.nodes.keys() {
            visit(self, name, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }

    /// Children-before-parents order over all nodes; assumes acyclic
    pub fn topological_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        let mut done = BTreeSet::new();

        fn visit(
            graph: &SolveGraph,
            name: &str,
            done: &mut BTreeSet<String>,
            order: &mut Vec<String>,
        ) {
            if done.contains(name) {
                return;
            }
            done.insert(name.to_string());
            if let Some(node) = graph.nodes.get(name) {
                for child in node.edges.keys() {
                    visit(graph, child, done, order);
                }
            }
            order.push(name.to_string());
        }

        for name in self.nodes.keys() {
            visit(self, name, &mut done, &mut order);
        }
        order
    }
}

/// Reduce a set of version requirements to a small subset that is already
/// contradictory, preferring a single conflicting pair.
pub(crate) fn minimal_conflict_set(sources: &[(String, VersionConstraint)]) -> Vec<String> {
    let render = |(source, constraint): &(String, VersionConstraint)| {
        format!("{} requires @{}", source, constraint)
    };

    for i in 0..sources.len() {
        for j in (i + 1)..sources.len() {
            if sources[i].1.intersect(&sources[j].1).is_none() {
                return vec![render(&sources[i]), render(&sources[j])];
            }
        }
    }

    // No single pair conflicts; accumulate greedily until empty
    let mut kept = Vec::new();
    let mut acc = VersionConstraint::Any;
    for entry in sources {
        kept.push(render(entry));
        match acc.intersect(&entry.1) {
            Some(merged) => acc = merged,
            None => return kept,
        }
    }
    kept
}
