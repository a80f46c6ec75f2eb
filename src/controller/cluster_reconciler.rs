//! Cluster controller entry points.
//!
//! Wires [`reconcile_cluster`] into the kube runtime: metrics, requeue
//! scheduling and error classification live here, the sync itself lives in
//! [`cluster_sync`](crate::controller::cluster_sync).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, warn};

use crate::controller::cluster_sync::reconcile_cluster;
use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::kube_backend::KubeBackend;
use crate::crd::Cluster;

/// Periodic resync of a converged cluster.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue key of a cluster.
pub fn cluster_key(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Reconcile one Cluster.
pub async fn reconcile(obj: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if obj.metadata.deletion_timestamp.is_some() {
        // Owned objects are garbage collected through owner references.
        debug!(name = %name, namespace = %namespace, "Cluster is being deleted");
        ctx.requeue.forget(&cluster_key(&obj));
        return Ok(Action::await_change());
    }

    debug!(name = %name, namespace = %namespace, "Reconciling Cluster");

    let backend = KubeBackend::new(ctx.clone());
    let status = reconcile_cluster(&obj, &backend, &ctx.config.sidecar_image).await?;

    ctx.requeue.forget(&cluster_key(&obj));

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        for (rack, rack_status) in status.iter().flat_map(|s| s.racks.iter()) {
            health_state.metrics.set_rack_members(
                &namespace,
                &name,
                rack,
                i64::from(rack_status.members),
                i64::from(rack_status.ready_members),
            );
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        health_state.last_reconcile.store(now, Ordering::Relaxed);
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    let delay = ctx.requeue.next_delay(&cluster_key(&obj));
    if error.is_retryable() {
        warn!(name = %name, error = %error, retry_in = ?delay, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, retry_in = ?delay, "Reconciliation failed");
    }
    Action::requeue(delay)
}
