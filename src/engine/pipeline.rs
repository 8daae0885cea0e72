//! Per-request admission pipeline.
//!
//! For every admission request the pipeline enriches the document with
//! synthetic references, applies matching Patch rules tier by tier, mirrors
//! the patches into the `kubectl.kubernetes.io/last-applied-configuration`
//! annotation, evaluates Reject rules against the post-patch document and
//! emits an [`AdmissionDecision`].
//!
//! Author mistakes never fail the admission path: a rule whose template or
//! patch fails is skipped with a logged diagnostic, and fetch failures
//! degrade to an allow-with-warning.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::crd::{ModRuleOperation, ModRuleType};
use crate::engine::apply::{apply, PatchOptions};
use crate::engine::compiled::CompiledModRule;
use crate::engine::store::ModRuleStore;
use crate::expr::Value;

/// Annotation mirrored alongside the document during patching.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Pod annotation naming the node a pod was bound to; when present, the
/// node manifest is injected as `syntheticRefs.node`.
pub const NODENAME_ANNOTATION: &str = "ref.kubemod.io/nodename";

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Capability interface for the only I/O the pipeline performs: fetching
/// manifests referenced by the incoming document.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<serde_json::Value, FetchError>;
    async fn get_node(&self, name: &str) -> Result<serde_json::Value, FetchError>;
}

/// Outcome of evaluating one admission request.
#[derive(Debug)]
pub enum AdmissionDecision {
    Allowed { reason: Option<String> },
    Patched(json_patch::Patch),
    Denied(String),
}

impl AdmissionDecision {
    fn allowed() -> Self {
        AdmissionDecision::Allowed { reason: None }
    }

    fn allowed_with(reason: &str) -> Self {
        AdmissionDecision::Allowed {
            reason: Some(reason.to_string()),
        }
    }
}

/// The rule-evaluation engine: a store of compiled rules plus the injected
/// resource fetcher.
pub struct AdmissionEngine {
    store: Arc<ModRuleStore>,
    fetcher: Arc<dyn ResourceFetcher>,
}

impl AdmissionEngine {
    pub fn new(store: Arc<ModRuleStore>, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &Arc<ModRuleStore> {
        &self.store
    }

    /// Evaluate one admission request.
    ///
    /// `namespace` is the *effective* namespace: empty for cluster-scoped
    /// targets. For DELETE the caller passes the old object; the decision
    /// for DELETE is `Allowed` unless a Reject rule fires, since a deletion
    /// response cannot carry a mutation.
    pub async fn evaluate(
        &self,
        operation: ModRuleOperation,
        namespace: &str,
        object: serde_json::Value,
    ) -> AdmissionDecision {
        let mut doc = object;
        if let Err(error) = self.inject_synthetic_refs(&mut doc, namespace).await {
            warn!(%error, "failed to inject syntheticRefs into object manifest");
            return AdmissionDecision::allowed_with("failed to inject syntheticRefs");
        }

        let original = doc.clone();
        self.apply_patch_rules(operation, namespace, &mut doc);

        let rejections = self.determine_rejections(operation, namespace, &doc);
        if !rejections.is_empty() {
            let message = rejections.join(", ");
            info!(rejections = %message, "rejected");
            return AdmissionDecision::Denied(message);
        }

        if operation == ModRuleOperation::Delete {
            return AdmissionDecision::allowed();
        }

        let diff = json_patch::diff(&original, &doc);
        if diff.0.is_empty() {
            AdmissionDecision::allowed()
        } else {
            AdmissionDecision::Patched(diff)
        }
    }

    /// Enrich the document with `syntheticRefs` (namespace manifest, and
    /// the bound node manifest for pods) and drop `managedFields`.
    async fn inject_synthetic_refs(
        &self,
        doc: &mut serde_json::Value,
        namespace: &str,
    ) -> Result<(), FetchError> {
        let mut refs = serde_json::Map::new();

        if !namespace.is_empty() {
            let mut manifest = self.fetcher.get_namespace(namespace).await?;
            strip_managed_fields(&mut manifest);
            strip_annotation(&mut manifest, LAST_APPLIED_ANNOTATION);
            refs.insert("namespace".to_string(), manifest);
        }

        if doc.get("kind").and_then(|k| k.as_str()) == Some("Pod") {
            if let Some(node_name) = annotation(doc, NODENAME_ANNOTATION).filter(|n| !n.is_empty())
            {
                let mut manifest = self.fetcher.get_node(&node_name).await?;
                strip_managed_fields(&mut manifest);
                refs.insert("node".to_string(), manifest);
            }
        }

        if let Some(obj) = doc.as_object_mut() {
            obj.insert("syntheticRefs".to_string(), serde_json::Value::Object(refs));
        }
        strip_managed_fields(doc);
        Ok(())
    }

    fn apply_patch_rules(
        &self,
        operation: ModRuleOperation,
        namespace: &str,
        doc: &mut serde_json::Value,
    ) {
        let mut last_applied = extract_last_applied(doc);

        let matching = self.matching_rules(operation, namespace, doc, ModRuleType::Patch);
        let options = PatchOptions::default();

        for rule in matching {
            let patch = match rule.synthesize_patch(namespace, doc) {
                Ok(patch) => patch,
                Err(error) => {
                    warn!(rule = %rule.namespaced_name(), %error, "failed calculating patch for ModRule");
                    continue;
                }
            };
            debug!(rule = %rule.namespaced_name(), ?patch, "applying ModRule patch");

            // Apply to a scratch copy so a failing rule leaves the document
            // untouched.
            let mut next = doc.clone();
            if let Err(error) = apply(&mut next, &patch, &options) {
                warn!(rule = %rule.namespaced_name(), %error, "failed applying patch for ModRule");
                continue;
            }
            *doc = next;

            if let Some(last) = last_applied.as_mut() {
                let mut attempt = last.clone();
                match apply(&mut attempt, &patch, &options) {
                    Ok(()) => *last = attempt,
                    Err(error) => {
                        warn!(
                            rule = %rule.namespaced_name(),
                            %error,
                            "failed applying patch to last-applied-configuration annotation"
                        );
                    }
                }
            }
        }

        if let Some(last) = last_applied.take() {
            write_last_applied(doc, &last);
        }
    }

    fn determine_rejections(
        &self,
        operation: ModRuleOperation,
        namespace: &str,
        doc: &serde_json::Value,
    ) -> Vec<String> {
        self.matching_rules(operation, namespace, doc, ModRuleType::Reject)
            .iter()
            .map(|rule| rule.rejection_message(namespace, doc))
            .collect()
    }

    /// Resolve candidates from the store, filter by type, operation and
    /// matcher, and order them: ascending execution tier, then
    /// lexicographic `namespace/name` within a tier.
    fn matching_rules(
        &self,
        operation: ModRuleOperation,
        namespace: &str,
        doc: &serde_json::Value,
        rule_type: ModRuleType,
    ) -> Vec<Arc<CompiledModRule>> {
        let expr_doc = Value::from(doc);
        let mut rules: Vec<Arc<CompiledModRule>> = self
            .store
            .candidates_for(namespace)
            .into_iter()
            .filter(|rule| {
                rule.rule_type() == rule_type
                    && rule.applies_to(operation)
                    && rule.is_match(&expr_doc)
            })
            .collect();
        rules.sort_by(|a, b| {
            a.execution_tier()
                .cmp(&b.execution_tier())
                .then_with(|| a.namespaced_name().cmp(&b.namespaced_name()))
        });
        rules
    }
}

fn strip_managed_fields(manifest: &mut serde_json::Value) {
    if let Some(metadata) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata.remove("managedFields");
    }
}

fn strip_annotation(manifest: &mut serde_json::Value, key: &str) {
    if let Some(annotations) = manifest
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(|a| a.as_object_mut())
    {
        annotations.remove(key);
    }
}

fn annotation(doc: &serde_json::Value, key: &str) -> Option<String> {
    doc.get("metadata")?
        .get("annotations")?
        .get(key)?
        .as_str()
        .map(str::to_string)
}

/// Parse the last-applied-configuration annotation. An unparseable payload
/// is left alone in the document and skipped for mirroring.
fn extract_last_applied(doc: &serde_json::Value) -> Option<serde_json::Value> {
    let raw = annotation(doc, LAST_APPLIED_ANNOTATION)?;
    match serde_json::from_str(&raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn!(%error, "last-applied-configuration annotation is not valid JSON");
            None
        }
    }
}

fn write_last_applied(doc: &mut serde_json::Value, last: &serde_json::Value) {
    let serialized = match serde_json::to_string(last) {
        Ok(serialized) => serialized,
        Err(error) => {
            warn!(%error, "failed to serialize last-applied-configuration");
            return;
        }
    };
    if let Some(annotations) = doc
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(|a| a.as_object_mut())
    {
        annotations.insert(
            LAST_APPLIED_ANNOTATION.to_string(),
            serde_json::Value::String(serialized),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Fetcher that serves canned namespace/node manifests.
    pub struct StubFetcher {
        pub fail: bool,
    }

    #[async_trait]
    impl ResourceFetcher for StubFetcher {
        async fn get_namespace(&self, name: &str) -> Result<serde_json::Value, FetchError> {
            if self.fail {
                return Err(FetchError(format!("namespace '{}' unavailable", name)));
            }
            Ok(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {
                    "name": name,
                    "labels": {"team": "red"},
                    "managedFields": [{"manager": "kubectl"}],
                    "annotations": {
                        LAST_APPLIED_ANNOTATION: "{}",
                        "keep": "me"
                    }
                }
            }))
        }

        async fn get_node(&self, name: &str) -> Result<serde_json::Value, FetchError> {
            if self.fail {
                return Err(FetchError(format!("node '{}' unavailable", name)));
            }
            Ok(json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": name, "managedFields": []}
            }))
        }
    }

    fn engine(fail_fetch: bool) -> AdmissionEngine {
        AdmissionEngine::new(
            Arc::new(ModRuleStore::new("modrule-system")),
            Arc::new(StubFetcher { fail: fail_fetch }),
        )
    }

    #[tokio::test]
    async fn synthetic_refs_carry_the_namespace_manifest() {
        let engine = engine(false);
        let mut doc = json!({"kind": "Pod", "metadata": {"name": "p"}});
        engine.inject_synthetic_refs(&mut doc, "web").await.unwrap();

        let ns = &doc["syntheticRefs"]["namespace"];
        assert_eq!(ns["metadata"]["name"], "web");
        assert!(ns["metadata"].get("managedFields").is_none());
        assert!(ns["metadata"]["annotations"].get(LAST_APPLIED_ANNOTATION).is_none());
        assert_eq!(ns["metadata"]["annotations"]["keep"], "me");
    }

    #[tokio::test]
    async fn pod_with_nodename_annotation_gets_the_node_manifest() {
        let engine = engine(false);
        let mut doc = json!({
            "kind": "Pod",
            "metadata": {"annotations": {NODENAME_ANNOTATION: "node-7"}}
        });
        engine.inject_synthetic_refs(&mut doc, "web").await.unwrap();
        assert_eq!(doc["syntheticRefs"]["node"]["metadata"]["name"], "node-7");
    }

    #[tokio::test]
    async fn non_pod_never_fetches_a_node() {
        let engine = engine(false);
        let mut doc = json!({
            "kind": "Deployment",
            "metadata": {"annotations": {NODENAME_ANNOTATION: "node-7"}}
        });
        engine.inject_synthetic_refs(&mut doc, "web").await.unwrap();
        assert!(doc["syntheticRefs"].get("node").is_none());
    }

    #[tokio::test]
    async fn fetch_failure_allows_with_warning() {
        let engine = engine(true);
        let decision = engine
            .evaluate(
                ModRuleOperation::Create,
                "web",
                json!({"kind": "Pod", "metadata": {"name": "p"}}),
            )
            .await;
        match decision {
            AdmissionDecision::Allowed { reason } => {
                assert!(reason.unwrap().contains("syntheticRefs"));
            }
            other => panic!("expected allow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cluster_scoped_target_skips_the_namespace_fetch() {
        // The failing fetcher proves the namespace lookup is never made.
        let engine = engine(true);
        let decision = engine
            .evaluate(
                ModRuleOperation::Create,
                "",
                json!({"kind": "Namespace", "metadata": {"name": "web"}}),
            )
            .await;
        assert!(matches!(decision, AdmissionDecision::Allowed { reason: None }));
    }
}
