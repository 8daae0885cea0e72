//! modrule-operator library crate
//!
//! A resource mutation and admission engine: ModRule custom resources
//! declare patch-or-reject rules, a controller keeps them compiled in an
//! in-memory store, and a mutating admission webhook evaluates every
//! intercepted resource against that store.

pub mod controller;
pub mod crd;
pub mod engine;
pub mod expr;
pub mod health;
pub mod template;
pub mod webhooks;

pub use engine::{AdmissionDecision, AdmissionEngine, ModRuleStore};
pub use health::HealthState;
pub use webhooks::{
    run_webhook_server, WebhookError, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT,
};

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client};
use tracing::{debug, error, info};

use controller::{context::Context, reconciler};
use crd::ModRule;

/// Default namespace for cluster-scoped ModRules; overridden with the
/// `CLUSTER_MODRULES_NAMESPACE` environment variable.
pub const DEFAULT_CLUSTER_MODRULES_NAMESPACE: &str = "modrule-system";

/// Resolve the namespace where cluster-scoped ModRules are deployed.
pub fn cluster_modrules_namespace() -> String {
    std::env::var("CLUSTER_MODRULES_NAMESPACE")
        .unwrap_or_else(|_| DEFAULT_CLUSTER_MODRULES_NAMESPACE.to_string())
}

/// Run the ModRule controller (cluster-wide).
///
/// Watches ModRule resources in every namespace and keeps the shared rule
/// store in step with them. Runs until the watch stream ends.
pub async fn run_controller(
    client: Client,
    store: Arc<ModRuleStore>,
    health_state: Option<Arc<HealthState>>,
) {
    info!("Starting controller for ModRule resources");

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), store));

    let modrules: Api<ModRule> = Api::all(client);

    // `any_semantic` keeps resource discovery reliable in test environments.
    let watcher_config = WatcherConfig::default().any_semantic();

    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(modrules, watcher_config))
        .default_backoff()
        .touched_objects();

    Controller::for_stream(stream, reader)
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound errors are expected after deletion when
                    // trailing watch events trigger reconciliation for a
                    // deleted rule.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("ModRule no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    error!("Controller stream ended unexpectedly");
}
