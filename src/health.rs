//! Operator health and metrics server.
//!
//! - `/healthz` - 200 while the process serves requests
//! - `/readyz` - 200 once this replica leads and runs the controller
//! - `/metrics` - Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::{Router, extract::State, http::StatusCode, http::header, routing::get};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tracing::{error, info};

/// Port of the operator's health server.
pub const HEALTH_PORT: u16 = 8080;

const METRIC_PREFIX: &str = "cassandra_operator";
const OPENMETRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RackLabels {
    pub namespace: String,
    pub cluster: String,
    pub rack: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

type DurationFamily = Family<ClusterLabels, Histogram, fn() -> Histogram>;

fn duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
}

/// Operator metrics and the registry they are exposed through.
pub struct Metrics {
    pub reconciliations: Family<ClusterLabels, Counter>,
    pub reconciliation_errors: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: DurationFamily,
    /// Events published on Clusters, by reason.
    pub cluster_events: Family<ReasonLabels, Counter>,
    pub rack_members: Family<RackLabels, Gauge>,
    pub rack_ready_members: Family<RackLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn register<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: &M) {
    registry.register(format!("{}_{}", METRIC_PREFIX, name), help, metric.clone());
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Self {
            reconciliations: Family::default(),
            reconciliation_errors: Family::default(),
            reconcile_duration_seconds: Family::new_with_constructor(duration_histogram),
            cluster_events: Family::default(),
            rack_members: Family::default(),
            rack_ready_members: Family::default(),
            registry: Registry::default(),
        };

        register(
            &mut registry,
            "reconciliations",
            "Total number of Cluster reconciliations",
            &metrics.reconciliations,
        );
        register(
            &mut registry,
            "reconciliation_errors",
            "Total number of failed Cluster reconciliations",
            &metrics.reconciliation_errors,
        );
        register(
            &mut registry,
            "reconcile_duration_seconds",
            "Duration of Cluster reconciliations in seconds",
            &metrics.reconcile_duration_seconds,
        );
        register(
            &mut registry,
            "cluster_events",
            "Total number of events published on Clusters",
            &metrics.cluster_events,
        );
        register(
            &mut registry,
            "rack_members",
            "Members of each rack",
            &metrics.rack_members,
        );
        register(
            &mut registry,
            "rack_ready_members",
            "Ready members of each rack",
            &metrics.rack_ready_members,
        );

        Self { registry, ..metrics }
    }

    fn cluster_labels(namespace: &str, cluster: &str) -> ClusterLabels {
        ClusterLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
        }
    }

    pub fn record_reconcile(&self, namespace: &str, cluster: &str, duration_secs: f64) {
        let labels = Self::cluster_labels(namespace, cluster);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, cluster: &str) {
        self.reconciliation_errors
            .get_or_create(&Self::cluster_labels(namespace, cluster))
            .inc();
    }

    pub fn record_event(&self, reason: &str) {
        self.cluster_events
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn set_rack_members(
        &self,
        namespace: &str,
        cluster: &str,
        rack: &str,
        members: i64,
        ready: i64,
    ) {
        let labels = RackLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            rack: rack.to_string(),
        };
        self.rack_members.get_or_create(&labels).set(members);
        self.rack_ready_members.get_or_create(&labels).set(ready);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// State shared by the health handlers and the controller.
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
    /// Unix time of the last successful reconcile.
    pub last_reconcile: AtomicU64,
}

impl HealthState {
    /// Starts not ready.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(
    State(state): State<Arc<HealthState>>,
) -> Result<([(header::HeaderName, &'static str); 1], String), StatusCode> {
    match state.metrics.encode() {
        Ok(body) => Ok(([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the health endpoints on `0.0.0.0:8080`.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}
