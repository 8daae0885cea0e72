//! Thread-safe, namespace-partitioned store of compiled ModRules.
//!
//! Rules live in per-namespace buckets; the empty-string bucket holds
//! cluster-scoped rules. Authors deploy cluster-scoped rules to a
//! configured namespace (`cluster_namespace`), which the store flattens
//! onto the `""` bucket at Put time.
//!
//! Compilation happens outside the write lock, so a reader can never
//! observe a half-constructed rule: Put swaps a fully-built item in, Delete
//! swap-removes. Readers clone `Arc`s out under the read lock and evaluate
//! without holding it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::crd::ModRule;
use crate::engine::compiled::{CompiledModRule, RuleCompileError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to add ModRule to store: {0}")]
    Compile(#[from] RuleCompileError),
}

type Buckets = HashMap<String, Vec<Arc<CompiledModRule>>>;

#[derive(Debug)]
pub struct ModRuleStore {
    cluster_namespace: String,
    rules: RwLock<Buckets>,
}

impl ModRuleStore {
    /// `cluster_namespace` is where authors deploy cluster-scoped rules.
    pub fn new(cluster_namespace: impl Into<String>) -> Self {
        Self {
            cluster_namespace: cluster_namespace.into(),
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn cluster_namespace(&self) -> &str {
        &self.cluster_namespace
    }

    fn bucket_key(&self, namespace: &str) -> String {
        if namespace == self.cluster_namespace {
            String::new()
        } else {
            namespace.to_string()
        }
    }

    /// Add or replace a rule, identified by its `(namespace, name)` pair.
    /// Invalid rules are refused whole; the store is left unchanged.
    pub fn put(&self, rule: ModRule) -> Result<(), StoreError> {
        let namespace = kube::ResourceExt::namespace(&rule).unwrap_or_default();
        let key = self.bucket_key(&namespace);
        let name = kube::ResourceExt::name_any(&rule);

        // Compile before taking the lock; writers hold it only for the swap.
        let compiled = Arc::new(CompiledModRule::compile(rule)?);

        let mut buckets = self.write();
        let bucket = buckets.entry(key).or_default();
        match bucket.iter().position(|existing| existing.name() == name) {
            Some(index) => bucket[index] = compiled,
            None => bucket.push(compiled),
        }
        Ok(())
    }

    /// Remove a rule. Deleting a rule that is not present is a no-op.
    pub fn delete(&self, namespace: &str, name: &str) {
        let key = self.bucket_key(namespace);
        let mut buckets = self.write();
        if let Some(bucket) = buckets.get_mut(&key) {
            if let Some(index) = bucket.iter().position(|existing| existing.name() == name) {
                // Swap-delete: order inside a bucket is not observable.
                bucket.swap_remove(index);
                debug!(namespace = %key, %name, "removed ModRule");
            }
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
    }

    /// Candidate rules for a target namespace: cluster-bucket rules whose
    /// target-namespace regex accepts it (or, for a cluster-scoped target,
    /// rules without a regex), followed by the namespace's own bucket.
    pub fn candidates_for(&self, namespace: &str) -> Vec<Arc<CompiledModRule>> {
        let buckets = self.read();
        let mut candidates = Vec::new();

        if let Some(cluster) = buckets.get("") {
            candidates.extend(
                cluster
                    .iter()
                    .filter(|rule| rule.matches_target_namespace(namespace))
                    .cloned(),
            );
        }

        if !namespace.is_empty() {
            if let Some(bucket) = buckets.get(namespace) {
                candidates.extend(bucket.iter().cloned());
            }
        }

        candidates
    }

    /// Rule count per bucket, for observability and tests.
    pub fn stats(&self) -> HashMap<String, usize> {
        self.read()
            .iter()
            .map(|(namespace, bucket)| (namespace.clone(), bucket.len()))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Buckets> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Buckets> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}
