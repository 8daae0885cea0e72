//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint
//! - `/rules` - Loaded rule counts per namespace, as JSON

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::engine::ModRuleStore;

/// Labels for per-namespace rule metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NamespaceLabels {
    pub namespace: String,
}

impl EncodeLabelSet for NamespaceLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Loaded ModRules per namespace; the empty namespace label is the
    /// cluster bucket
    pub modrules_loaded: Family<NamespaceLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let modrules_loaded = Family::<NamespaceLabels, Gauge>::default();
        registry.register(
            "modrule_operator_rules_loaded",
            "Number of compiled ModRules currently loaded, per namespace",
            modrules_loaded.clone(),
        );

        Self {
            modrules_loaded,
            registry,
        }
    }

    /// Refresh the per-namespace gauges from store stats
    pub fn set_rule_counts(&self, stats: &std::collections::HashMap<String, usize>) {
        for (namespace, count) in stats {
            let labels = NamespaceLabels {
                namespace: namespace.clone(),
            };
            self.modrules_loaded.get_or_create(&labels).set(*count as i64);
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership, controller running)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// The live rule store, for stats reporting
    store: Arc<ModRuleStore>,
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new(store: Arc<ModRuleStore>) -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            store,
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler; gauges are refreshed from the store on scrape
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    state.metrics.set_rule_counts(&state.store.stats());
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Rule stats handler: namespace -> loaded rule count
async fn rules_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.store.stats()))
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/rules", get(rules_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
