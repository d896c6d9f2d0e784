// src/concretize/materialize.rs

//! Freezing a settled solve into immutable concrete DAG nodes
//!
//! Children are built before parents and every edge is wired by `Arc`
//! reference to the already-built child, so a package unified across several
//! parents is one shared node. No subtree is ever copied.

use crate::concretize::engine::Solution;
use crate::error::Result;
use crate::spec::{ConcreteDep, ConcreteSpec};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Materialize every node of a solution; returns the node map keyed by
/// solver-node name.
pub(crate) fn materialize(solution: &Solution) -> Result<BTreeMap<String, Arc<ConcreteSpec>>> {
    let mut built: BTreeMap<String, Arc<ConcreteSpec>> = BTreeMap::new();

    for name in solution.graph.topological_order() {
        let node = &solution.graph.nodes[&name];
        let candidate = &solution.assignments[&name];

        let deps: BTreeMap<String, ConcreteDep> = node
            .edges
            .iter()
            .map(|(child, edge)| {
                let spec = Arc::clone(&built[child]);
                (
                    child.clone(),
                    ConcreteDep {
                        kinds: edge.kinds,
                        spec,
                    },
                )
            })
            .collect();

        let spec = Arc::new(ConcreteSpec::new(
            name.clone(),
            candidate.version.clone(),
            candidate.variants.clone(),
            candidate.compiler.clone(),
            candidate.arch.clone(),
            deps,
        ));
        built.insert(name, spec);
    }

    Ok(built)
}
