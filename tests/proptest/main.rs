// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the rule engine.
//!
//! Uses proptest to generate random inputs and verify invariants:
//! negate inverts match outcomes, Put/Delete round-trips leave the store
//! empty, and same-tier rules commute.

use proptest::prelude::*;
use serde_json::json;

use modrule_operator::crd::{
    MatchForType, MatchItem, ModRule, ModRuleSpec, ModRuleOperation, ModRuleType,
    PatchOperationSpec, PatchOperationType,
};
use modrule_operator::engine::{AdmissionDecision, CompiledModRule, ModRuleStore};
use modrule_operator::expr::Value;

const CLUSTER_NAMESPACE: &str = "modrule-system";

fn match_item(select: &str, match_value: Option<&str>, negate: bool) -> MatchItem {
    MatchItem {
        select: select.to_string(),
        match_for: MatchForType::Any,
        match_value: match_value.map(String::from),
        match_values: Vec::new(),
        match_regex: None,
        negate,
    }
}

fn add_label_op(key: &str, value: &str) -> PatchOperationSpec {
    PatchOperationSpec {
        op: PatchOperationType::Add,
        select: None,
        path: format!("/metadata/labels/{}", key),
        value: Some(format!("\"{}\"", value)),
    }
}

fn patch_rule(namespace: &str, name: &str, tier: i16, ops: Vec<PatchOperationSpec>) -> ModRule {
    let spec = ModRuleSpec {
        rule_type: ModRuleType::Patch,
        execution_tier: tier,
        operation: Vec::new(),
        match_items: vec![match_item("$.kind", Some("Pod"), false)],
        patch: ops,
        reject_message: None,
        target_namespace_regex: None,
    };
    let mut rule = ModRule::new(name, spec);
    rule.metadata.namespace = Some(namespace.to_string());
    rule
}

fn compile_matcher(expected: &str, negate: bool) -> CompiledModRule {
    let spec = ModRuleSpec {
        rule_type: ModRuleType::Reject,
        execution_tier: 0,
        operation: Vec::new(),
        match_items: vec![match_item("$.metadata.labels.app", Some(expected), negate)],
        patch: Vec::new(),
        reject_message: None,
        target_namespace_regex: None,
    };
    CompiledModRule::compile(ModRule::new("matcher", spec)).unwrap()
}

/// Identifier-ish strings usable as label values and rule names.
fn label_value() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,8}"
}

proptest! {
    /// Property: with a defined selection, negate inverts the outcome.
    #[test]
    fn negate_inverts_match_outcome(app in label_value(), expected in label_value()) {
        let doc = Value::from(&json!({"metadata": {"labels": {"app": app}}}));
        let plain = compile_matcher(&expected, false).is_match(&doc);
        let negated = compile_matcher(&expected, true).is_match(&doc);
        prop_assert_eq!(plain, !negated);
    }

    /// Property: Put followed by Delete of the same identities leaves the
    /// store with empty stats, regardless of duplicates or interleaving.
    #[test]
    fn put_then_delete_round_trips_to_empty(
        identities in prop::collection::vec(
            (prop::sample::select(vec!["ns-a", "ns-b", CLUSTER_NAMESPACE]), label_value()),
            1..20,
        )
    ) {
        let store = ModRuleStore::new(CLUSTER_NAMESPACE);
        for (namespace, name) in &identities {
            store
                .put(patch_rule(namespace, name, 0, vec![add_label_op("k", "v")]))
                .unwrap();
        }
        for (namespace, name) in &identities {
            store.delete(namespace, name);
        }
        prop_assert!(store.stats().is_empty());
    }

    /// Property: non-conflicting rules in the same tier produce the same
    /// set of diff operations regardless of insertion order.
    #[test]
    fn same_tier_rules_commute(
        count in 2usize..6,
        order in Just((0..6usize).collect::<Vec<usize>>()).prop_shuffle(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let rules: Vec<ModRule> = (0..count)
            .map(|i| {
                patch_rule(
                    "web",
                    &format!("rule-{}", i),
                    0,
                    vec![add_label_op(&format!("k{}", i), &format!("v{}", i))],
                )
            })
            .collect();

        let natural = runtime.block_on(evaluate_with(rules.clone()));
        let mut shuffled_rules: Vec<ModRule> = Vec::new();
        for index in order.iter().filter(|i| **i < count) {
            shuffled_rules.push(rules[*index].clone());
        }
        let shuffled = runtime.block_on(evaluate_with(shuffled_rules));

        prop_assert_eq!(natural, shuffled);
    }
}

/// Run the engine over a fixed pod and return the sorted set of diff ops.
async fn evaluate_with(rules: Vec<ModRule>) -> Vec<String> {
    use std::sync::Arc;

    struct NoFetch;

    #[async_trait::async_trait]
    impl modrule_operator::engine::ResourceFetcher for NoFetch {
        async fn get_namespace(
            &self,
            name: &str,
        ) -> Result<serde_json::Value, modrule_operator::engine::FetchError> {
            Ok(json!({"kind": "Namespace", "metadata": {"name": name}}))
        }

        async fn get_node(
            &self,
            name: &str,
        ) -> Result<serde_json::Value, modrule_operator::engine::FetchError> {
            Ok(json!({"kind": "Node", "metadata": {"name": name}}))
        }
    }

    let store = Arc::new(ModRuleStore::new(CLUSTER_NAMESPACE));
    for rule in rules {
        store.put(rule).unwrap();
    }
    let engine = modrule_operator::engine::AdmissionEngine::new(store, Arc::new(NoFetch));

    let decision = engine
        .evaluate(
            ModRuleOperation::Create,
            "web",
            json!({"kind": "Pod", "metadata": {"labels": {}}}),
        )
        .await;

    let mut ops = match decision {
        AdmissionDecision::Patched(patch) => patch
            .0
            .iter()
            .map(|op| serde_json::to_string(op).unwrap())
            .collect::<Vec<_>>(),
        AdmissionDecision::Allowed { .. } => Vec::new(),
        AdmissionDecision::Denied(message) => panic!("unexpected denial: {}", message),
    };
    ops.sort();
    ops
}
