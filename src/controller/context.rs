//! Shared context for the controller.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::crd::ModRule;
use crate::engine::ModRuleStore;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "modrule-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// The live rule store fed by reconciliation
    pub store: Arc<ModRuleStore>,
    /// Event reporter identity
    reporter: Reporter,
}

impl Context {
    pub fn new(client: Client, store: Arc<ModRuleStore>) -> Self {
        Self {
            client,
            store,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Publish a warning event for a ModRule resource
    pub async fn publish_warning_event(
        &self,
        rule: &ModRule,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = rule.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
