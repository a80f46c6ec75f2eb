//! Orchestrator operations the cluster sync depends on.
//!
//! [`ClusterBackend`] is the seam between the sync logic and the Kubernetes
//! API: production code uses [`KubeBackend`](crate::controller::kube_backend::KubeBackend),
//! tests drive the same sync against an in-memory cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::controller::error::Result;
use crate::crd::{Cluster, ClusterStatus};

/// Step of a sync, reported in `ErrSyncFailed` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Observe,
    Cleanup,
    HeadlessService,
    MemberServices,
    ConfigMaps,
    Status,
    ClusterShape,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            SyncPhase::Observe => "observe",
            SyncPhase::Cleanup => "cleanup",
            SyncPhase::HeadlessService => "headless service",
            SyncPhase::MemberServices => "member services",
            SyncPhase::ConfigMaps => "config maps",
            SyncPhase::Status => "status",
            SyncPhase::ClusterShape => "cluster shape",
        };
        f.write_str(phase)
    }
}

/// Events published on a Cluster during a sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    RackCreated { rack: String },
    RackScaledUp { rack: String, replicas: i32 },
    RackScaleDownInProgress { rack: String, member: String },
    RackScaledDown { rack: String, replicas: i32 },
    SyncFailed { phase: SyncPhase, message: String },
}

impl SyncEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            SyncEvent::RackCreated { .. } => "RackCreated",
            SyncEvent::RackScaledUp { .. } => "RackScaledUp",
            SyncEvent::RackScaleDownInProgress { .. } => "RackScaleDownInProgress",
            SyncEvent::RackScaledDown { .. } => "RackScaledDown",
            SyncEvent::SyncFailed { .. } => "ErrSyncFailed",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncEvent::RackCreated { .. } => "CreateRack",
            SyncEvent::RackScaledUp { .. } => "ScaleUp",
            SyncEvent::RackScaleDownInProgress { .. } => "Decommission",
            SyncEvent::RackScaledDown { .. } => "ScaleDown",
            SyncEvent::SyncFailed { .. } => "Sync",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, SyncEvent::SyncFailed { .. })
    }

    pub fn note(&self) -> String {
        match self {
            SyncEvent::RackCreated { rack } => format!("Rack {} created", rack),
            SyncEvent::RackScaledUp { rack, replicas } => {
                format!("Rack {} scaled up to {} members", rack, replicas)
            }
            SyncEvent::RackScaleDownInProgress { rack, member } => {
                format!("Rack {} scaling down, decommissioning member {}", rack, member)
            }
            SyncEvent::RackScaledDown { rack, replicas } => {
                format!("Rack {} scaled down to {} members", rack, replicas)
            }
            SyncEvent::SyncFailed { phase, message } => format!("{}: {}", phase, message),
        }
    }
}

/// Reads and writes performed by a sync.
///
/// Getters return `Ok(None)` for absent objects. Deletes of absent objects
/// succeed.
pub trait ClusterBackend: Sync {
    fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<StatefulSet>>> + Send;

    fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Set `spec.replicas` of a StatefulSet.
    fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Service>>> + Send;

    fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<Service>>> + Send;

    fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_service(&self, namespace: &str, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Merge `labels` into the labels of a service.
    fn patch_service_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<Pod>>> + Send;

    fn delete_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ConfigMap>>> + Send;

    /// Replace the owner references of a ConfigMap.
    fn set_config_map_owners(
        &self,
        namespace: &str,
        name: &str,
        owners: &[OwnerReference],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write the status subresource with a single `add /status` operation.
    fn patch_cluster_status(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Publish an event on the Cluster. Never fails.
    fn record_event(&self, cluster: &Cluster, event: &SyncEvent) -> impl Future<Output = ()> + Send;
}
