//! Reconciliation loop for ModRule resources.
//!
//! Reconciliation keeps the in-memory rule store in step with the cluster:
//! an applied ModRule is compiled and Put, a deleted one is removed. A rule
//! the store refuses (bad select, bad regex, bad template) is surfaced as a
//! warning event on the resource and otherwise left out of the store; it
//! must never take the controller down.

use std::sync::Arc;

use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::ModRule;

/// Finalizer name for store cleanup on deletion
pub const FINALIZER: &str = "api.modrule.io/finalizer";

/// Reconcile a ModRule
pub async fn reconcile(rule: Arc<ModRule>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = rule.name_any();
    let namespace = rule.namespace().unwrap_or_default();

    debug!(name = %name, namespace = %namespace, "Reconciling ModRule");

    let api: Api<ModRule> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion: drop the rule from the store, then release the
    // finalizer.
    if rule.metadata.deletion_timestamp.is_some() {
        ctx.store.delete(&namespace, &name);
        info!(name = %name, namespace = %namespace, "Removed ModRule from store");
        remove_finalizer(&api, &name).await?;
        return Ok(Action::await_change());
    }

    // Ensure finalizer is present so deletions reach the store.
    if !rule.finalizers().iter().any(|f| f == FINALIZER) {
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(std::time::Duration::from_secs(1)));
    }

    match ctx.store.put(ModRule::clone(&rule)) {
        Ok(()) => {
            debug!(name = %name, namespace = %namespace, "Stored ModRule");
        }
        Err(e) => {
            warn!(name = %name, namespace = %namespace, error = %e, "ModRule refused");
            ctx.publish_warning_event(
                &rule,
                "ModRuleInvalid",
                "Compiling",
                Some(e.to_string()),
            )
            .await;
        }
    }

    Ok(Action::await_change())
}

/// Decide how to proceed after a reconciliation error
pub fn error_policy(rule: Arc<ModRule>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = rule.name_any();

    if error.is_not_found() {
        debug!(name = %name, "ModRule not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(std::time::Duration::from_secs(300))
    }
}

/// Add finalizer to resource
async fn add_finalizer(api: &Api<ModRule>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove finalizer from resource
async fn remove_finalizer(api: &Api<ModRule>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": null
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
