// src/spec/canonical.rs

//! Canonical serialization and DAG hashing of concrete specs
//!
//! A node's canonical form is a deterministic document: variant map sorted by
//! key, dependency edges sorted by (kinds, child hash) rather than insertion
//! order, and children referenced by their own hashes. Hashing recurses
//! child-first, so structurally identical subtrees hash identically wherever
//! they appear, and a node's hash never depends on who points at it.
//!
//! The same documents are what the install database and environment lockfiles
//! persist; [`reassemble`] turns a pile of them back into a shared-`Arc` DAG
//! without re-concretizing.

use crate::error::{Error, Result};
use crate::hash::SpecHash;
use crate::spec::{CompilerSpec, ConcreteDep, ConcreteSpec, DepKindSet, VariantValue};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One dependency edge in a canonical node document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepRecord {
    pub name: String,
    pub kinds: DepKindSet,
    pub hash: SpecHash,
}

/// The canonical, storable form of one concrete node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub name: String,
    pub version: Version,
    pub variants: BTreeMap<String, VariantValue>,
    pub compiler: CompilerSpec,
    pub arch: String,
    pub deps: Vec<DepRecord>,
}

impl NodeDocument {
    /// Extract the canonical document of a single node. Children are
    /// referenced by hash; computing those hashes may recurse.
    pub fn of(spec: &ConcreteSpec) -> Self {
        let mut deps: Vec<DepRecord> = spec
            .deps
            .values()
            .map(|dep| DepRecord {
                name: dep.spec.name.clone(),
                kinds: dep.kinds,
                hash: dep.spec.dag_hash().clone(),
            })
            .collect();
        deps.sort_by(|a, b| a.kinds.cmp(&b.kinds).then_with(|| a.hash.cmp(&b.hash)));

        Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            variants: spec.variants.clone(),
            compiler: spec.compiler.clone(),
            arch: spec.arch.clone(),
            deps,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Canonical bytes of one node; input to the node's identity hash
pub fn canonical_bytes(spec: &ConcreteSpec) -> Vec<u8> {
    let doc = NodeDocument::of(spec);
    serde_json::to_vec(&doc).expect("canonical document serialization cannot fail")
}

/// Compute a node's DAG hash from its canonical bytes.
///
/// Callers should go through [`ConcreteSpec::dag_hash`], which memoizes.
pub fn hash_node(spec: &ConcreteSpec) -> SpecHash {
    SpecHash::of_bytes(&canonical_bytes(spec))
}

/// Rebuild a shared-`Arc` DAG from stored node documents.
///
/// Children are materialized before parents and shared by reference, exactly
/// as the concretizer would have wired them. Every rebuilt node's recomputed
/// hash must equal its stored key; a mismatch means the store is corrupt.
pub fn reassemble(
    docs: &BTreeMap<SpecHash, NodeDocument>,
) -> Result<BTreeMap<SpecHash, Arc<ConcreteSpec>>> {
    let mut built: BTreeMap<SpecHash, Arc<ConcreteSpec>> = BTreeMap::new();
    for hash in docs.keys() {
        build_one(hash, docs, &mut built, &mut Vec::new())?;
    }
    Ok(built)
}

fn build_one(
    hash: &SpecHash,
    docs: &BTreeMap<SpecHash, NodeDocument>,
    built: &mut BTreeMap<SpecHash, Arc<ConcreteSpec>>,
    stack: &mut Vec<SpecHash>,
) -> Result<Arc<ConcreteSpec>> {
    if let Some(done) = built.get(hash) {
        return Ok(Arc::clone(done));
    }
    if stack.contains(hash) {
        // A hash cycle cannot arise from hashing acyclic content; the
        // documents themselves are malformed.
        return Err(Error::CyclicDependency {
            cycle: stack.iter().map(|h| h.short().to_string()).collect(),
        });
    }
    let doc = docs
        .get(hash)
        .ok_or_else(|| Error::NoSuchHash(hash.short().to_string()))?;

    stack.push(hash.clone());
    let mut deps = BTreeMap::new();
    for record in &doc.deps {
        let child = build_one(&record.hash, docs, built, stack)?;
        deps.insert(
            record.name.clone(),
            ConcreteDep {
                kinds: record.kinds,
                spec: child,
            },
        );
    }
    stack.pop();

    let node = Arc::new(ConcreteSpec::new(
        doc.name.clone(),
        doc.version.clone(),
        doc.variants.clone(),
        doc.compiler.clone(),
        doc.arch.clone(),
        deps,
    ));

    let recomputed = node.dag_hash();
    if recomputed != hash {
        return Err(Error::ChecksumMismatch {
            expected: hash.to_string(),
            actual: recomputed.to_string(),
        });
    }

    built.insert(hash.clone(), Arc::clone(&node));
    Ok(node)
}

/// Collect the canonical documents of a node and all its descendants,
/// keyed by hash; the persisted representation of a concrete DAG
pub fn collect_documents(root: &Arc<ConcreteSpec>) -> BTreeMap<SpecHash, NodeDocument> {
    root.traverse()
        .into_iter()
        .map(|node| (node.dag_hash().clone(), NodeDocument::of(&node)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DepKind;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn node(name: &str, ver: &str, deps: BTreeMap<String, ConcreteDep>) -> Arc<ConcreteSpec> {
        Arc::new(ConcreteSpec::new(
            name.to_string(),
            version(ver),
            BTreeMap::new(),
            CompilerSpec::new("gcc", version("12.1")),
            "x86_64".to_string(),
            deps,
        ))
    }

    fn dep_on(spec: &Arc<ConcreteSpec>) -> (String, ConcreteDep) {
        (
            spec.name.clone(),
            ConcreteDep {
                kinds: DepKindSet::build_link(),
                spec: Arc::clone(spec),
            },
        )
    }

    #[test]
    fn test_identical_structure_identical_hash() {
        let a1 = node("zlib", "1.3", BTreeMap::new());
        let a2 = node("zlib", "1.3", BTreeMap::new());
        assert_eq!(a1.dag_hash(), a2.dag_hash());

        let b = node("zlib", "1.2.13", BTreeMap::new());
        assert_ne!(a1.dag_hash(), b.dag_hash());
    }

    #[test]
    fn test_hash_covers_descendants() {
        let old = node("zlib", "1.2.13", BTreeMap::new());
        let new = node("zlib", "1.3", BTreeMap::new());

        let on_old = node("libpng", "1.6", BTreeMap::from([dep_on(&old)]));
        let on_new = node("libpng", "1.6", BTreeMap::from([dep_on(&new)]));
        assert_ne!(on_old.dag_hash(), on_new.dag_hash());
    }

    #[test]
    fn test_dep_order_does_not_matter() {
        let x = node("x", "1.0", BTreeMap::new());
        let y = node("y", "1.0", BTreeMap::new());

        let mut forward = BTreeMap::new();
        forward.extend([dep_on(&x), dep_on(&y)]);
        let mut backward = BTreeMap::new();
        backward.extend([dep_on(&y), dep_on(&x)]);

        let a = node("app", "1.0", forward);
        let b = node("app", "1.0", backward);
        assert_eq!(a.dag_hash(), b.dag_hash());
    }

    #[test]
    fn test_document_json_round_trip() {
        let leaf = node("zlib", "1.3", BTreeMap::new());
        let root = node("libpng", "1.6", BTreeMap::from([dep_on(&leaf)]));

        let doc = NodeDocument::of(&root);
        let restored = NodeDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(doc, restored);
    }

    #[test]
    fn test_reassemble_rebuilds_sharing_and_hashes() {
        let d = node("d", "1.0", BTreeMap::new());
        let b = node("b", "1.0", BTreeMap::from([dep_on(&d)]));
        let c = node("c", "1.0", BTreeMap::from([dep_on(&d)]));
        let mut deps = BTreeMap::new();
        deps.extend([dep_on(&b), dep_on(&c)]);
        let a = node("a", "1.0", deps);

        let docs = collect_documents(&a);
        assert_eq!(docs.len(), 4);

        let rebuilt = reassemble(&docs).unwrap();
        let a2 = rebuilt.get(a.dag_hash()).unwrap();
        assert_eq!(a2.dag_hash(), a.dag_hash());

        // Sharing is restored: both parents hold the same d node
        let d_via_b = a2.dep("b").unwrap().dep("d").unwrap();
        let d_via_c = a2.dep("c").unwrap().dep("d").unwrap();
        assert!(Arc::ptr_eq(d_via_b, d_via_c));
    }

    #[test]
    fn test_reassemble_missing_child_fails() {
        let leaf = node("zlib", "1.3", BTreeMap::new());
        let root = node("libpng", "1.6", BTreeMap::from([dep_on(&leaf)]));

        let mut docs = collect_documents(&root);
        docs.remove(leaf.dag_hash());
        assert!(reassemble(&docs).is_err());
    }

    #[test]
    fn test_reassemble_detects_tampering() {
        let leaf = node("zlib", "1.3", BTreeMap::new());
        let mut docs = collect_documents(&leaf);
        let (hash, mut doc) = docs.pop_first().unwrap();
        doc.version = version("9.9");
        docs.insert(hash, doc);

        let err = reassemble(&docs).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }
}
