//! cassandra-operator: manages Cassandra and Scylla clusters on Kubernetes.
//!
//! Only the replica holding the Lease runs the controller. Every replica
//! serves the health endpoints, and the admission webhook when its
//! certificates are mounted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cassandra_operator::health::{HealthState, run_health_server};
use cassandra_operator::{OperatorConfig, run_controller};
use cassandra_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

const LEASE_NAME: &str = "cassandra-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight syncs after a shutdown signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing()?;
    info!("Starting cassandra-operator");

    let config = OperatorConfig::from_env()?;
    info!(
        workers = config.workers,
        sidecar_image = %config.sidecar_image,
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        "Loaded operator configuration"
    );

    let client = Client::try_default().await?;
    let (holder_id, namespace) = pod_identity();
    let health_state = Arc::new(HealthState::new());

    let health = spawn_health_server(health_state.clone());
    let webhook = spawn_webhook_server(client.clone());

    let lock = lease_lock(client.clone(), &namespace, &holder_id);
    info!(%holder_id, %namespace, lease = LEASE_NAME, "Waiting for leadership");
    acquire_leadership(&lock).await;
    let renewal = spawn_lease_renewal(lock);

    let controller = {
        let health_state = health_state.clone();
        tokio::spawn(run_controller(client, config, Some(health_state)))
    };

    tokio::select! {
        result = controller => log_task_exit("controller", result),
        result = health => log_task_exit("health server", result),
        result = async {
            match webhook {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => log_task_exit("webhook server", result),
        // Renewal only returns by panicking; losing the lease exits the process.
        result = renewal => log_task_exit("lease renewal", result),
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            health_state.set_ready(false);
            info!(grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(), "Draining in-flight syncs");
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), BoxError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("cassandra_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// Lease holder and namespace from the downward API.
fn pod_identity() -> (String, String) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, falling back to hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using default");
        "default".to_string()
    });
    (holder, namespace)
}

fn lease_lock(client: Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

async fn acquire_leadership(lock: &LeaseLock) {
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Lease held by another replica"),
            Err(e) => warn!(error = %e, "Lease acquisition failed"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renews the lease forever. The process exits as soon as renewal fails so
/// the pod restarts and rejoins the election.
#[allow(clippy::exit)]
fn spawn_lease_renewal(lock: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Leadership lost, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

fn spawn_health_server(state: Arc<HealthState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(state).await {
            error!(error = %e, "Health server failed");
        }
    })
}

fn spawn_webhook_server(client: Client) -> Option<JoinHandle<()>> {
    if !(Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()) {
        info!("Webhook certificates not mounted, admission webhook disabled");
        return None;
    }
    info!("Starting admission webhook");
    Some(tokio::spawn(async move {
        if let Err(e) = run_webhook_server(client, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
            error!(error = %e, "Webhook server failed");
        }
    }))
}

fn log_task_exit(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => warn!(task, "Task exited"),
        Err(e) => error!(task, error = %e, "Task panicked"),
    }
}

/// Resolves on SIGTERM or Ctrl+C. Without handlers there is no graceful
/// shutdown, so failing to install them is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
