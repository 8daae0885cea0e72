//! End-to-end pipeline scenarios: patching, tiers, rejection, DELETE
//! semantics and last-applied-configuration mirroring.

use modrule_operator::crd::ModRuleOperation;
use modrule_operator::engine::{
    apply::{apply, PatchOptions},
    AdmissionDecision, LAST_APPLIED_ANNOTATION,
};
use serde_json::json;

use crate::fixtures::{engine_with, rule, CLUSTER_NAMESPACE};

fn diff_ops(decision: &AdmissionDecision) -> Vec<serde_json::Value> {
    match decision {
        AdmissionDecision::Patched(patch) => {
            let mut ops = patch
                .0
                .iter()
                .map(|op| serde_json::to_value(op).unwrap())
                .collect::<Vec<_>>();
            ops.sort_by_key(|op| {
                format!(
                    "{}{}",
                    op["op"].as_str().unwrap_or_default(),
                    op["path"].as_str().unwrap_or_default()
                )
            });
            ops
        }
        other => panic!("expected a patched decision, got {:?}", other),
    }
}

#[tokio::test]
async fn simple_label_add() {
    let engine = engine_with(vec![rule(
        "my-namespace",
        "add-env-label",
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
    )]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "my-namespace",
            json!({"kind": "Pod", "metadata": {"labels": {"app": "nginx"}}}),
        )
        .await;

    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/env", "value": "prod"})]
    );
}

#[tokio::test]
async fn container_port_select_with_placeholders() {
    let engine = engine_with(vec![rule(
        "my-namespace",
        "force-tcp",
        r#"
type: Patch
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    select: "$.spec.containers[*].ports[?@.containerPort == 80]"
    path: /spec/containers/#0/ports/#1/protocol
    value: '"TCP"'
"#,
    )]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "my-namespace",
            json!({
                "kind": "Pod",
                "spec": {"containers": [
                    {"name": "a", "ports": [{"containerPort": 80}, {"containerPort": 9090}]},
                    {"name": "b", "ports": [{"containerPort": 443}, {"containerPort": 80}]}
                ]}
            }),
        )
        .await;

    assert_eq!(
        diff_ops(&decision),
        vec![
            json!({"op": "add", "path": "/spec/containers/0/ports/0/protocol", "value": "TCP"}),
            json!({"op": "add", "path": "/spec/containers/1/ports/1/protocol", "value": "TCP"}),
        ]
    );
}

#[tokio::test]
async fn reject_with_rendered_message() {
    let engine = engine_with(vec![rule(
        "web",
        "no-external-ips",
        r#"
type: Reject
match:
  - select: "$.spec.externalIPs"
    matchFor: Any
rejectMessage: "externalIPs forbidden in {{Namespace}}"
"#,
    )]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({"kind": "Service", "spec": {"externalIPs": ["10.0.0.1"]}}),
        )
        .await;

    match decision {
        AdmissionDecision::Denied(message) => {
            assert_eq!(message, "web/no-external-ips: \"externalIPs forbidden in web\"");
        }
        other => panic!("expected denial, got {:?}", other),
    }
}

#[tokio::test]
async fn rejection_runs_against_the_post_patch_document() {
    // The Patch rule introduces the label the Reject rule fires on.
    let engine = engine_with(vec![
        rule(
            "web",
            "taint",
            r#"
type: Patch
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/quarantine
    value: '"true"'
"#,
        ),
        rule(
            "web",
            "no-quarantined",
            r#"
type: Reject
match:
  - select: "$.metadata.labels.quarantine"
    matchValue: "true"
"#,
        ),
    ]);

    let decision = engine
        .evaluate(ModRuleOperation::Create, "web", json!({"kind": "Pod"}))
        .await;
    assert!(matches!(decision, AdmissionDecision::Denied(_)));
}

#[tokio::test]
async fn tiered_override_yields_a_single_net_change() {
    let engine = engine_with(vec![
        rule(
            "web",
            "tier0-set-a",
            r#"
type: Patch
executionTier: 0
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/a
    value: '"1"'
"#,
        ),
        rule(
            "web",
            "tier1-override-a",
            r#"
type: Patch
executionTier: 1
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: replace
    path: /metadata/labels/a
    value: '"2"'
"#,
        ),
    ]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({"kind": "Pod", "metadata": {"labels": {}}}),
        )
        .await;

    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/a", "value": "2"})]
    );
}

#[tokio::test]
async fn lower_tiers_run_before_higher_tiers_regardless_of_insertion() {
    // Tier 5 is inserted before tier -2; execution must still be -2 first:
    // the tier 5 rule matches only the label the tier -2 rule adds.
    let engine = engine_with(vec![
        rule(
            "web",
            "late",
            r#"
type: Patch
executionTier: 5
match:
  - select: "$.metadata.labels.base"
    matchValue: "on"
patch:
  - op: add
    path: /metadata/labels/layered
    value: '"on"'
"#,
        ),
        rule(
            "web",
            "early",
            r#"
type: Patch
executionTier: -2
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/base
    value: '"on"'
"#,
        ),
    ]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({"kind": "Pod", "metadata": {"labels": {}}}),
        )
        .await;

    // Matching happens once, against the pre-patch document: the tier 5
    // rule is not a candidate on the first pass.
    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/base", "value": "on"})]
    );
}

#[tokio::test]
async fn cluster_scoped_rule_applies_through_namespace_regex() {
    let cluster_rule = rule(
        CLUSTER_NAMESPACE,
        "team-labeler",
        r#"
type: Patch
targetNamespaceRegex: "^team-.*$"
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/team-managed
    value: '"true"'
"#,
    );
    let engine = engine_with(vec![cluster_rule]);

    let pod = json!({"kind": "Pod", "metadata": {"labels": {}}});

    let decision = engine
        .evaluate(ModRuleOperation::Create, "team-red", pod.clone())
        .await;
    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/team-managed", "value": "true"})]
    );

    let decision = engine.evaluate(ModRuleOperation::Create, "ops", pod).await;
    assert!(matches!(decision, AdmissionDecision::Allowed { reason: None }));
}

#[tokio::test]
async fn match_for_all_with_missing_field_never_patches() {
    let engine = engine_with(vec![rule(
        "web",
        "internal-images-only",
        r#"
type: Patch
match:
  - select: "$.spec.containers[*].image"
    matchFor: All
    matchRegex: "^registry.internal/"
patch:
  - op: add
    path: /metadata/labels/vetted
    value: '"true"'
"#,
    )]);

    // First container carries no image at all; All + an undefined entry is
    // a negative match.
    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({"kind": "Pod", "spec": {"containers": [
                {"name": "no-image"},
                {"image": "registry.internal/app:1"}
            ]}}),
        )
        .await;
    assert!(matches!(decision, AdmissionDecision::Allowed { reason: None }));
}

#[tokio::test]
async fn operation_filter_limits_rule_application() {
    let engine = engine_with(vec![rule(
        "web",
        "create-only",
        r#"
type: Patch
operation: [CREATE]
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/created
    value: '"yes"'
"#,
    )]);

    let pod = json!({"kind": "Pod", "metadata": {"labels": {}}});
    assert!(matches!(
        engine.evaluate(ModRuleOperation::Create, "web", pod.clone()).await,
        AdmissionDecision::Patched(_)
    ));
    assert!(matches!(
        engine.evaluate(ModRuleOperation::Update, "web", pod).await,
        AdmissionDecision::Allowed { reason: None }
    ));
}

#[tokio::test]
async fn delete_is_allowed_even_when_patch_rules_match() {
    let engine = engine_with(vec![rule(
        "web",
        "labeler",
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
    )]);

    let decision = engine
        .evaluate(ModRuleOperation::Delete, "web", json!({"kind": "Pod"}))
        .await;
    assert!(matches!(decision, AdmissionDecision::Allowed { reason: None }));
}

#[tokio::test]
async fn delete_still_honors_reject_rules() {
    let engine = engine_with(vec![rule(
        "web",
        "no-deleting-protected",
        r#"
type: Reject
operation: [DELETE]
match:
  - select: "$.metadata.labels.protected"
    matchValue: "true"
rejectMessage: "protected resources cannot be deleted"
"#,
    )]);

    let decision = engine
        .evaluate(
            ModRuleOperation::Delete,
            "web",
            json!({"kind": "Pod", "metadata": {"labels": {"protected": "true"}}}),
        )
        .await;
    assert!(matches!(decision, AdmissionDecision::Denied(_)));
}

#[tokio::test]
async fn broken_rule_is_skipped_and_the_rest_still_apply() {
    let engine = engine_with(vec![
        // The replace below targets a path that never exists, so patch
        // application fails and the rule is skipped.
        rule(
            "web",
            "broken",
            r#"
type: Patch
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: replace
    path: /spec/nope/deeper
    value: '"x"'
"#,
        ),
        rule(
            "web",
            "working",
            r#"
type: Patch
match:
  - select: "$.kind"
    matchValue: "Pod"
patch:
  - op: add
    path: /metadata/labels/ok
    value: '"yes"'
"#,
        ),
    ]);

    let decision = engine
        .evaluate(ModRuleOperation::Create, "web", json!({"kind": "Pod"}))
        .await;
    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/ok", "value": "yes"})]
    );
}

#[tokio::test]
async fn patches_mirror_into_last_applied_configuration() {
    let engine = engine_with(vec![rule(
        "web",
        "add-env",
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
    )]);

    let last_applied = serde_json::to_string(&json!({
        "kind": "Pod",
        "metadata": {"labels": {"app": "nginx"}}
    }))
    .unwrap();
    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({
                "kind": "Pod",
                "metadata": {
                    "labels": {"app": "nginx"},
                    "annotations": {LAST_APPLIED_ANNOTATION: last_applied}
                }
            }),
        )
        .await;

    let ops = diff_ops(&decision);
    assert!(ops
        .iter()
        .any(|op| op["path"] == json!("/metadata/labels/env")));
    let annotation_op = ops
        .iter()
        .find(|op| {
            op["path"]
                .as_str()
                .is_some_and(|p| p.contains("last-applied-configuration"))
        })
        .expect("annotation must be rewritten");
    let rewritten: serde_json::Value =
        serde_json::from_str(annotation_op["value"].as_str().unwrap()).unwrap();
    assert_eq!(rewritten["metadata"]["labels"]["env"], "prod");
}

#[tokio::test]
async fn synthetic_refs_are_visible_to_matchers_and_templates() {
    let engine = engine_with(vec![rule(
        "web",
        "stamp-team",
        r#"
type: Patch
match:
  - select: "$.syntheticRefs.namespace.metadata.labels.team"
    matchValue: "red"
patch:
  - op: add
    path: /metadata/labels/team
    value: '"{{Target.syntheticRefs.namespace.metadata.labels.team}}"'
"#,
    )]);

    let decision = engine
        .evaluate(ModRuleOperation::Create, "web", json!({"kind": "Pod"}))
        .await;
    assert_eq!(
        diff_ops(&decision),
        vec![json!({"op": "add", "path": "/metadata/labels/team", "value": "red"})]
    );
}

#[tokio::test]
async fn applying_the_engine_twice_is_idempotent() {
    let engine = engine_with(vec![rule(
        "web",
        "add-env",
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
    )]);

    let original = json!({"kind": "Pod", "metadata": {"labels": {}}});
    let decision = engine
        .evaluate(ModRuleOperation::Create, "web", original.clone())
        .await;

    // Re-apply the returned diff, then run the engine again: the second
    // pass must produce no further changes.
    let mut patched = original;
    match &decision {
        AdmissionDecision::Patched(patch) => {
            apply(&mut patched, patch, &PatchOptions::default()).unwrap();
        }
        other => panic!("expected patch, got {:?}", other),
    }

    let second = engine.evaluate(ModRuleOperation::Create, "web", patched).await;
    assert!(matches!(second, AdmissionDecision::Allowed { reason: None }));
}
