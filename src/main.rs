//! Binary entry point for modrule-operator.
//!
//! Boots structured logging, connects to the cluster, and runs three
//! long-lived pieces: the health server (always), and, once this replica
//! holds the leader lease, the ModRule controller and the admission
//! webhook server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tracing::{error, info, warn};

use modrule_operator::engine::{AdmissionEngine, KubeResourceFetcher};
use modrule_operator::health::{run_health_server, HealthState};
use modrule_operator::{
    cluster_modrules_namespace, run_controller, run_webhook_server, ModRuleStore,
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH,
};

const LEASE_NAME: &str = "modrule-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RETRY: Duration = Duration::from_secs(5);

/// How long in-flight admissions get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modrule_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting modrule-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cluster_namespace = cluster_modrules_namespace();
    info!(namespace = %cluster_namespace, "Cluster-wide ModRules namespace");
    let store = Arc::new(ModRuleStore::new(cluster_namespace));
    let engine = Arc::new(AdmissionEngine::new(
        store.clone(),
        Arc::new(KubeResourceFetcher::new(client.clone())),
    ));

    let health_state = Arc::new(HealthState::new(store.clone()));

    // Probes must answer before leadership is settled, so the health server
    // comes up first.
    let health_task = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    // Block until this replica owns the lease, then keep renewing it in
    // the background for the rest of the process lifetime.
    let lease = new_lease_lock(client.clone());
    wait_for_leadership(&lease).await;
    let lease_task = tokio::spawn(keep_lease(lease));

    let controller_task = {
        let client = client.clone();
        let store = store.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move {
            run_controller(client, store, Some(health_state)).await;
        })
    };

    let webhook_task = tokio::spawn(serve_webhook(engine));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            // Flip readiness first so the endpoints drain, then let
            // in-flight work finish.
            health_state.set_ready(false).await;
            info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Draining before exit");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        result = controller_task => report_task_exit("controller", result),
        result = health_task => report_task_exit("health server", result),
        result = webhook_task => report_task_exit("webhook server", result),
        result = lease_task => report_task_exit("lease keeper", result),
    }

    info!("Operator stopped");
    Ok(())
}

/// Build the leader lease for this replica. Identity comes from the
/// downward API when present, otherwise the hostname.
fn new_lease_lock(client: Client) -> LeaseLock {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    info!(
        holder_id = %holder_id,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    LeaseLock::new(
        client,
        &namespace,
        LeaseLockParams {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

/// Retry the lease until it is ours.
async fn wait_for_leadership(lease: &LeaseLock) {
    info!("Campaigning for the leader lease");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Leadership acquired");
                return;
            }
            Ok(_) => info!("Lease held by another replica, waiting..."),
            Err(e) => warn!(error = %e, "Lease acquisition attempt failed"),
        }
        tokio::time::sleep(LEASE_RETRY).await;
    }
}

/// Renew the lease forever. Losing it (or failing to renew) terminates the
/// process so Kubernetes restarts us into a fresh election.
#[allow(clippy::exit)]
async fn keep_lease(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RETRY).await;
        let lost = match lease.try_acquire_or_renew().await {
            Ok(result) => !result.acquired_lease,
            Err(e) => {
                error!(error = %e, "Lease renewal failed");
                true
            }
        };
        if lost {
            error!("Leadership lost, exiting for re-election");
            std::process::exit(1);
        }
    }
}

/// Serve the admission webhook when TLS material is mounted; otherwise
/// stay idle so the operator still runs rule reconciliation.
async fn serve_webhook(engine: Arc<AdmissionEngine>) {
    let certs_present =
        Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists();
    if !certs_present {
        info!("Webhook certificates not present, webhook server disabled");
        std::future::pending::<()>().await;
    }

    info!("Webhook TLS material present, serving admission requests");
    if let Err(e) = run_webhook_server(engine, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
        error!(error = %e, "Webhook server failed");
    }
}

fn report_task_exit(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => error!(%task, "Task exited unexpectedly"),
        Err(e) => error!(%task, error = %e, "Task panicked"),
    }
}

/// Resolves when the process is told to stop: SIGTERM (the normal pod
/// termination path) or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(error) => {
            // No SIGTERM handler leaves ctrl-c as the only stop signal.
            warn!(%error, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
