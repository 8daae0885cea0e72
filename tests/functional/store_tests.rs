//! Store behavior: put/update identity, deletion, candidate resolution.

use modrule_operator::engine::ModRuleStore;

use crate::fixtures::{rule, CLUSTER_NAMESPACE};

fn simple_rule(namespace: &str, name: &str) -> modrule_operator::crd::ModRule {
    rule(
        namespace,
        name,
        r#"
type: Patch
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/env
    value: '"prod"'
"#,
    )
}

#[test]
fn duplicate_puts_store_the_last_rule_per_identity() {
    let store = ModRuleStore::new(CLUSTER_NAMESPACE);

    // Loop over more combinations than exist so every identity is Put
    // repeatedly; only the final instance of each must remain.
    let namespaces = ["ns-0", "ns-1", "ns-2"];
    let names = ["rule-0", "rule-1", "rule-2", "rule-3", "rule-4"];
    for i in 0..(namespaces.len() * names.len() * 10) {
        let namespace = namespaces[i % namespaces.len()];
        let name = names[i % names.len()];
        store.put(simple_rule(namespace, name)).unwrap();
    }

    let total: usize = store.stats().values().sum();
    assert_eq!(total, namespaces.len() * names.len());
}

#[test]
fn deleting_everything_leaves_no_namespaces() {
    let store = ModRuleStore::new(CLUSTER_NAMESPACE);
    let namespaces = ["ns-0", "ns-1", "ns-2"];
    let names = ["rule-0", "rule-1", "rule-2", "rule-3", "rule-4"];
    for namespace in namespaces {
        for name in names {
            store.put(simple_rule(namespace, name)).unwrap();
        }
    }

    // Delete more times than necessary; deleting a missing rule is a no-op.
    for _ in 0..3 {
        for namespace in namespaces {
            for name in names {
                store.delete(namespace, name);
            }
        }
    }

    assert!(store.stats().is_empty());
}

#[test]
fn cluster_candidates_precede_namespace_candidates() {
    let store = ModRuleStore::new(CLUSTER_NAMESPACE);
    store.put(simple_rule("web", "local")).unwrap();
    store
        .put(rule(
            CLUSTER_NAMESPACE,
            "global",
            r#"
type: Patch
targetNamespaceRegex: ".*"
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/global
    value: '"yes"'
"#,
        ))
        .unwrap();

    let names: Vec<String> = store
        .candidates_for("web")
        .iter()
        .map(|r| r.name())
        .collect();
    assert_eq!(names, vec!["global", "local"]);
}

#[test]
fn invalid_rules_report_a_structured_error() {
    let store = ModRuleStore::new(CLUSTER_NAMESPACE);

    let bad_select = rule(
        "web",
        "bad-select",
        r#"
type: Patch
match:
  - select: "$.spec.containers["
patch:
  - op: add
    path: /a
"#,
    );
    let err = store.put(bad_select).unwrap_err();
    assert!(err.to_string().contains("failed to add ModRule to store"));

    let bad_tier = rule(
        "web",
        "bad-tier",
        r#"
type: Patch
executionTier: 32767
match:
  - select: "$.kind"
patch:
  - op: add
    path: /a
"#,
    );
    assert!(store.put(bad_tier).is_err());

    let empty_match = rule(
        "web",
        "empty-match",
        r#"
type: Reject
match: []
"#,
    );
    assert!(store.put(empty_match).is_err());

    assert!(store.stats().is_empty());
}
