// tests/concretize.rs

//! End-to-end concretization properties: determinism, unification,
//! conflict exclusion, and the scoping rules for test dependencies.

mod common;

use common::test_config;
use quarry::repo::{MemoryRepository, PackageDef};
use quarry::spec::{Condition, DepKind, DepKindSet, DependencyEdge};
use quarry::version::VersionConstraint;
use quarry::{AbstractSpec, Concretizer, Error, TestMode, UnifyPolicy, Version};
use std::sync::Arc;

fn version(s: &str) -> Version {
    Version::parse(s).unwrap()
}

#[test]
fn unify_true_version_clash_cites_package() {
    // Scenario A: a depends on b@2:, c depends on b@:1.5; together they
    // cannot agree on one b
    let repo = MemoryRepository::with([
        PackageDef::new("a").version("1.0").depends_on("b@2:"),
        PackageDef::new("c").version("1.0").depends_on("b@:1.5"),
        PackageDef::new("b").version("1.0").version("2.1"),
    ]);
    let cfg = test_config().with_unify(UnifyPolicy::Together);

    let roots = [
        AbstractSpec::parse("a").unwrap(),
        AbstractSpec::parse("c").unwrap(),
    ];
    let err = Concretizer::new(&repo, &cfg)
        .concretize_all(&roots)
        .unwrap_err();
    match err {
        Error::UnsatisfiableSpec { package, conflicts } => {
            assert_eq!(package, "b");
            assert!(conflicts.iter().any(|c| c.contains("@2:")));
            assert!(conflicts.iter().any(|c| c.contains("@:1.5")));
        }
        other => panic!("expected UnsatisfiableSpec citing b, got {other:?}"),
    }
}

#[test]
fn when_possible_falls_back_to_separate_roots() {
    // Same clash as above, but when_possible splits the roots instead of
    // failing; the two solves legitimately pick different b versions
    let repo = MemoryRepository::with([
        PackageDef::new("a").version("1.0").depends_on("b@2:"),
        PackageDef::new("c").version("1.0").depends_on("b@:1.5"),
        PackageDef::new("b").version("1.0").version("2.1"),
    ]);
    let cfg = test_config().with_unify(UnifyPolicy::WhenPossible);

    let roots = [
        AbstractSpec::parse("a").unwrap(),
        AbstractSpec::parse("c").unwrap(),
    ];
    let dags = Concretizer::new(&repo, &cfg).concretize_all(&roots).unwrap();
    assert_eq!(dags.len(), 2);

    let b_under_a = dags[0].dep("b").unwrap();
    let b_under_c = dags[1].dep("b").unwrap();
    assert_eq!(b_under_a.version, version("2.1"));
    assert_eq!(b_under_c.version, version("1.0"));
    assert_ne!(b_under_a.dag_hash(), b_under_c.dag_hash());
}

#[test]
fn newest_non_deprecated_version_wins() {
    // Scenario B: {1.0 (deprecated), 1.1, 1.2} resolves to 1.2
    let repo = MemoryRepository::with([PackageDef::new("a")
        .version_deprecated("1.0")
        .version("1.1")
        .version("1.2")]);
    let cfg = test_config();

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("a").unwrap())
        .unwrap();
    assert_eq!(dag.version, version("1.2"));
}

#[test]
fn deprecated_version_still_selectable_when_pinned() {
    let repo = MemoryRepository::with([PackageDef::new("a")
        .version_deprecated("1.0")
        .version("1.2")]);
    let cfg = test_config();

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("a@1.0").unwrap())
        .unwrap();
    assert_eq!(dag.version, version("1.0"));
}

#[test]
fn diamond_shares_one_node() {
    // Scenario C: b and c both depend on d@:1; exactly one concrete d,
    // referenced by both
    let repo = common::diamond_repo();
    let cfg = test_config().with_unify(UnifyPolicy::Together);

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("a").unwrap())
        .unwrap();

    let d_via_b = dag.dep("b").unwrap().dep("d").unwrap();
    let d_via_c = dag.dep("c").unwrap().dep("d").unwrap();
    assert!(Arc::ptr_eq(d_via_b, d_via_c));
    assert_eq!(d_via_b.dag_hash(), d_via_c.dag_hash());

    // The whole DAG holds exactly four nodes
    assert_eq!(dag.traverse().len(), 4);
}

#[test]
fn unify_separately_may_duplicate_packages() {
    // With unify disabled, two roots that disagree on d produce two
    // distinct d nodes
    let repo = MemoryRepository::with([
        PackageDef::new("x").version("1.0").depends_on("d@1.0"),
        PackageDef::new("y").version("1.0").depends_on("d@0.9"),
        PackageDef::new("d").version("1.0").version("0.9"),
    ]);
    let cfg = test_config().with_unify(UnifyPolicy::Separately);

    let roots = [
        AbstractSpec::parse("x").unwrap(),
        AbstractSpec::parse("y").unwrap(),
    ];
    let dags = Concretizer::new(&repo, &cfg).concretize_all(&roots).unwrap();
    let d_under_x = dags[0].dep("d").unwrap();
    let d_under_y = dags[1].dep("d").unwrap();
    assert_ne!(d_under_x.dag_hash(), d_under_y.dag_hash());
}

#[test]
fn unify_together_all_same_names_share_hashes() {
    // The unification invariant, checked pairwise over the whole forest
    let repo = common::diamond_repo();
    let cfg = test_config().with_unify(UnifyPolicy::Together);

    let roots = [
        AbstractSpec::parse("a").unwrap(),
        AbstractSpec::parse("b").unwrap(),
    ];
    let dags = Concretizer::new(&repo, &cfg).concretize_all(&roots).unwrap();

    let mut nodes = Vec::new();
    for dag in &dags {
        nodes.extend(dag.traverse());
    }
    for x in &nodes {
        for y in &nodes {
            if x.name == y.name {
                assert_eq!(
                    x.dag_hash(),
                    y.dag_hash(),
                    "two distinct concrete nodes for {} under unify=together",
                    x.name
                );
            }
        }
    }
}

#[test]
fn determinism_repeated_runs_hash_identically() {
    let cfg = test_config().with_unify(UnifyPolicy::Together);

    let run = || {
        let repo = MemoryRepository::with([
            PackageDef::new("app")
                .version("3.1")
                .version("3.0")
                .variant_bool("ssl", true)
                .depends_on("libweb@2:")
                .depends_on("libcrypto"),
            PackageDef::new("libweb")
                .version("2.4")
                .version("2.0")
                .depends_on("libcrypto@1.1:"),
            PackageDef::new("libcrypto").version("1.1.1").version("3.0.8"),
        ]);
        let dag = Concretizer::new(&repo, &cfg)
            .concretize(&AbstractSpec::parse("app +ssl").unwrap())
            .unwrap();
        dag.dag_hash().clone()
    };

    let first = run();
    for _ in 0..5 {
        assert_eq!(run(), first);
    }
}

#[test]
fn hash_survives_serialization_round_trip() {
    let repo = common::diamond_repo();
    let cfg = test_config();
    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("a").unwrap())
        .unwrap();

    let documents = quarry::spec::canonical::collect_documents(&dag);
    let rebuilt = quarry::spec::canonical::reassemble(&documents).unwrap();
    let restored = rebuilt.get(dag.dag_hash()).unwrap();
    assert_eq!(restored.dag_hash(), dag.dag_hash());
}

#[test]
fn every_edge_satisfies_its_constraint() {
    // Constraint-satisfaction property over a fixture with real constraints
    let repo = MemoryRepository::with([
        PackageDef::new("top")
            .version("1.0")
            .depends_on("mid@2: +feature")
            .depends_on("leaf@:3"),
        PackageDef::new("mid")
            .version("2.5")
            .version("1.9")
            .variant_bool("feature", false)
            .depends_on("leaf@1:"),
        PackageDef::new("leaf").version("2.0").version("4.0"),
    ]);
    let cfg = test_config();
    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("top").unwrap())
        .unwrap();

    assert!(dag.dep("mid").unwrap().satisfies(&AbstractSpec::parse("mid@2: +feature").unwrap()));
    assert!(dag.dep("leaf").unwrap().satisfies(&AbstractSpec::parse("leaf@:3").unwrap()));
    assert!(dag
        .dep("mid")
        .unwrap()
        .dep("leaf")
        .unwrap()
        .satisfies(&AbstractSpec::parse("leaf@1:").unwrap()));

    // Both requirements on leaf landed on one node satisfying both
    assert_eq!(dag.dep("leaf").unwrap().version, version("2.0"));
}

#[test]
fn conflict_rules_exclude_assignments() {
    let repo = MemoryRepository::with([
        PackageDef::new("solverlib")
            .version("2.0")
            .version("1.9")
            .variant_bool("cuda", false)
            .conflicts_when(
                Condition::VersionIn(VersionConstraint::parse("2:").unwrap()),
                Condition::Variant("cuda".to_string(), quarry::VariantValue::Bool(true)),
                "cuda support removed in 2.0",
            ),
    ]);
    let cfg = test_config();

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("solverlib +cuda").unwrap())
        .unwrap();
    // No produced node matches the conflict rule
    for node in dag.traverse() {
        let ctx_triggers = node.version >= version("2.0")
            && node.variants.get("cuda") == Some(&quarry::VariantValue::Bool(true));
        assert!(!ctx_triggers, "conflict rule matched node {}", node);
    }
    assert_eq!(dag.version, version("1.9"));
}

fn test_edge_repo() -> MemoryRepository {
    // app depends on lib (build+link) and on checker (test only);
    // lib itself also declares a test dependency on checker
    MemoryRepository::with([
        PackageDef::new("app")
            .version("1.0")
            .depends_on("lib")
            .depends_edge(
                DependencyEdge::new(AbstractSpec::named("checker"))
                    .with_kinds(DepKindSet::new(&[DepKind::Test])),
            ),
        PackageDef::new("lib").version("1.0").depends_edge(
            DependencyEdge::new(AbstractSpec::named("checker"))
                .with_kinds(DepKindSet::new(&[DepKind::Test])),
        ),
        PackageDef::new("checker").version("1.0"),
    ])
}

#[test]
fn test_edges_excluded_by_default() {
    let repo = test_edge_repo();
    let cfg = test_config().with_tests(TestMode::None);
    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("app").unwrap())
        .unwrap();

    assert!(dag.dep("checker").is_none());
    assert!(dag.dep("lib").unwrap().dep("checker").is_none());
}

#[test]
fn test_edges_root_mode_is_not_transitive() {
    // Mode `root` expands test edges on the requested root only: app gets
    // checker, but lib (a non-root) does not, even though it declares the
    // same edge. This scoping is deliberate.
    let repo = test_edge_repo();
    let cfg = test_config().with_tests(TestMode::Root);
    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("app").unwrap())
        .unwrap();

    assert!(dag.dep("checker").is_some());
    assert!(dag.dep("lib").unwrap().dep("checker").is_none());
}

#[test]
fn test_edges_all_mode_is_transitive() {
    let repo = test_edge_repo();
    let cfg = test_config().with_tests(TestMode::All);
    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("app").unwrap())
        .unwrap();

    assert!(dag.dep("checker").is_some());
    assert!(dag.dep("lib").unwrap().dep("checker").is_some());
}

#[test]
fn root_that_is_also_dependency_keeps_root_test_edges() {
    // lib is requested as a root AND appears as app's dependency; root mode
    // must still give the lib root its test edge while the same package
    // reached as a dependency node participates in the shared solve
    let repo = test_edge_repo();
    let cfg = test_config()
        .with_tests(TestMode::Root)
        .with_unify(UnifyPolicy::Together);

    let roots = [
        AbstractSpec::parse("app").unwrap(),
        AbstractSpec::parse("lib").unwrap(),
    ];
    let dags = Concretizer::new(&repo, &cfg).concretize_all(&roots).unwrap();
    // lib is a root here, so its test edge expands
    assert!(dags[1].dep("checker").is_some());
}

#[test]
fn preferred_version_outranks_newest() {
    let repo = MemoryRepository::with([PackageDef::new("tool")
        .version("3.0")
        .version_preferred("2.8")
        .version("2.5")]);
    let cfg = test_config();

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("tool").unwrap())
        .unwrap();
    assert_eq!(dag.version, version("2.8"));
}

#[test]
fn configured_preference_outranks_declared_preferred() {
    let repo = MemoryRepository::with([PackageDef::new("tool")
        .version("3.0")
        .version_preferred("2.8")
        .version("2.5")]);
    let mut cfg = test_config();
    cfg.packages.entry("tool".to_string()).or_default().versions = vec![version("2.5")];

    let dag = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("tool").unwrap())
        .unwrap();
    assert_eq!(dag.version, version("2.5"));
}

#[test]
fn no_valid_version_is_reported() {
    let repo = MemoryRepository::with([PackageDef::new("tool").version("1.0")]);
    let cfg = test_config();
    let err = Concretizer::new(&repo, &cfg)
        .concretize(&AbstractSpec::parse("tool@2:").unwrap())
        .unwrap_err();
    match err {
        Error::NoValidVersion { package, constraint } => {
            assert_eq!(package, "tool");
            assert_eq!(constraint, "2:");
        }
        other => panic!("expected NoValidVersion, got {other:?}"),
    }
}
