//! Test fixtures: rule construction and a canned resource fetcher.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use modrule_operator::crd::{ModRule, ModRuleSpec};
use modrule_operator::engine::{AdmissionEngine, FetchError, ModRuleStore, ResourceFetcher};

/// Namespace where cluster-scoped rules are deployed in these tests.
pub const CLUSTER_NAMESPACE: &str = "modrule-system";

/// Build a ModRule from a spec written in the rule document format.
pub fn rule(namespace: &str, name: &str, spec_yaml: &str) -> ModRule {
    let spec: ModRuleSpec =
        serde_yaml::from_str(spec_yaml).unwrap_or_else(|e| panic!("bad rule yaml for {}: {}", name, e));
    let mut rule = ModRule::new(name, spec);
    rule.metadata.namespace = Some(namespace.to_string());
    rule
}

/// Fetcher serving fixed namespace and node manifests, no cluster needed.
pub struct FakeFetcher;

#[async_trait]
impl ResourceFetcher for FakeFetcher {
    async fn get_namespace(&self, name: &str) -> Result<serde_json::Value, FetchError> {
        Ok(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "labels": {"team": "red"}}
        }))
    }

    async fn get_node(&self, name: &str) -> Result<serde_json::Value, FetchError> {
        Ok(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": name, "labels": {"zone": "a"}}
        }))
    }
}

/// An engine over a fresh store populated with the given rules.
pub fn engine_with(rules: Vec<ModRule>) -> AdmissionEngine {
    let store = Arc::new(ModRuleStore::new(CLUSTER_NAMESPACE));
    for rule in rules {
        store
            .put(rule)
            .unwrap_or_else(|e| panic!("failed to put rule: {}", e));
    }
    AdmissionEngine::new(store, Arc::new(FakeFetcher))
}
