//! Liveness and readiness endpoints of a member.
//!
//! - `/healthz` - 200 while the database answers Jolokia status calls and no
//!   decommission has failed
//! - `/readyz` - 200 once this member is `Up` and `Normal` in the ring

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, extract::State, http::StatusCode, routing::get};
use tracing::{info, warn};

use crate::resources::statefulset::{LIVENESS_PROBE_PATH, PROBE_PORT, READINESS_PROBE_PATH};
use crate::sidecar::jolokia::{JolokiaClient, JolokiaError, NodeMap};

/// Progress of this member's decommission, shared between the service
/// watch and the probes.
#[derive(Debug, Default)]
pub struct DecommissionStatus {
    started: AtomicBool,
    failed: AtomicBool,
}

impl DecommissionStatus {
    /// Claim the one decommission attempt this process makes. Returns false
    /// when it was already claimed.
    pub fn start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Fail liveness until the pod restarts, which is the only retry.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// State shared with the probe handlers.
pub struct ProbeState {
    pub jolokia: JolokiaClient,
    /// Address the member is known by in the ring.
    pub broadcast_ip: String,
    pub decommission: Arc<DecommissionStatus>,
}

/// Liveness outcome of a status call.
pub fn liveness(status: &Result<NodeMap, JolokiaError>, decommission_failed: bool) -> StatusCode {
    if decommission_failed {
        warn!("Decommission failed, reporting not alive");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match status {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Liveness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Readiness outcome of a status call for the member at `broadcast_ip`.
pub fn readiness(status: &Result<NodeMap, JolokiaError>, broadcast_ip: &str) -> StatusCode {
    let nodes = match status {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    };
    match nodes.get(broadcast_ip) {
        Some(node) if node.is_up_and_normal() => StatusCode::OK,
        Some(node) => {
            warn!(
                address = %broadcast_ip,
                status = ?node.status,
                state = ?node.state,
                "Member is not up and normal"
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
        None => {
            warn!(address = %broadcast_ip, "Member is not in the ring");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn healthz(State(state): State<Arc<ProbeState>>) -> StatusCode {
    liveness(&state.jolokia.status().await, state.decommission.failed())
}

async fn readyz(State(state): State<Arc<ProbeState>>) -> StatusCode {
    readiness(&state.jolokia.status().await, &state.broadcast_ip)
}

pub fn create_router(state: Arc<ProbeState>) -> Router {
    Router::new()
        .route(LIVENESS_PROBE_PATH, get(healthz))
        .route(READINESS_PROBE_PATH, get(readyz))
        .with_state(state)
}

/// Serve the probes on `0.0.0.0:8080`.
pub async fn run_probe_server(state: Arc<ProbeState>) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], PROBE_PORT));
    info!(port = PROBE_PORT, "Starting probe server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}
