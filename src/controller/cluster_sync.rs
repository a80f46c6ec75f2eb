//! Cluster sync.
//!
//! One pass brings the owned objects of a Cluster one step closer to its
//! spec:
//!
//! 1. Bail out while any rack StatefulSet has not observed its latest spec.
//! 2. Delete services and PVCs of members beyond each rack's replicas.
//! 3. Ensure the headless service and one service per live member pod.
//! 4. Attach the Cluster as owner of the rack ConfigMaps.
//! 5. Recompute the status from the StatefulSets.
//! 6. Take at most one shape action: create a rack, scale one member up,
//!    or drive one member through decommission and scale down.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::controller::backend::{ClusterBackend, SyncEvent, SyncPhase};
use crate::controller::error::{Error, Result};
use crate::controller::status::{is_observed, rack_status, replicas};
use crate::crd::{Cluster, ClusterStatus, RackSpec};
use crate::resources::common::{
    DECOMMISSIONED_LABEL, LABEL_VALUE_FALSE, LABEL_VALUE_TRUE, RACK_NAME_LABEL, cluster_labels,
    has_owner, headless_service_name, is_controlled_by, member_index, member_name,
    non_controlling_owner_reference, pvc_name, rack_selector, stateful_set_name,
};
use crate::resources::services::{generate_headless_service, generate_member_service};
use crate::resources::statefulset::{generate_statefulset, sidecar_image_for_cluster};

/// Reconcile a cached Cluster and write its status when it changed.
///
/// The cached object is never mutated; the sync works on a copy whose
/// status is returned.
pub async fn reconcile_cluster<B: ClusterBackend>(
    cached: &Cluster,
    backend: &B,
    default_sidecar_image: &str,
) -> Result<Option<ClusterStatus>> {
    let mut cluster = cached.clone();
    sync(&mut cluster, backend, default_sidecar_image).await?;

    if cluster.status != cached.status {
        if let Some(status) = &cluster.status {
            debug!(cluster = %cluster.name_any(), "Updating cluster status");
            backend.patch_cluster_status(&cluster, status).await?;
        }
    }
    Ok(cluster.status)
}

/// Run one sync pass, recording the computed status on `cluster`.
pub async fn sync<B: ClusterBackend>(
    cluster: &mut Cluster,
    backend: &B,
    default_sidecar_image: &str,
) -> Result<()> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;

    let observed = observe_stateful_sets(cluster, backend, &namespace).await;
    let Some(stateful_sets) = in_phase(backend, cluster, SyncPhase::Observe, observed).await? else {
        debug!(cluster = %cluster.name_any(), "StatefulSet update in flight, skipping sync");
        return Ok(());
    };

    cleanup(cluster, backend, &namespace, &stateful_sets).await;

    let result = sync_headless_service(cluster, backend, &namespace).await;
    in_phase(backend, cluster, SyncPhase::HeadlessService, result).await?;

    let result = sync_member_services(cluster, backend, &namespace, &stateful_sets).await;
    in_phase(backend, cluster, SyncPhase::MemberServices, result).await?;

    let result = sync_config_map_owners(cluster, backend, &namespace).await;
    in_phase(backend, cluster, SyncPhase::ConfigMaps, result).await?;

    let result = compute_status(cluster, backend, &namespace, &stateful_sets).await;
    let status = in_phase(backend, cluster, SyncPhase::Status, result).await?;
    cluster.status = Some(status);

    let result = sync_shape(cluster, backend, &namespace, default_sidecar_image).await;
    in_phase(backend, cluster, SyncPhase::ClusterShape, result).await
}

/// Emit an `ErrSyncFailed` warning when a step failed and pass the result on.
async fn in_phase<B: ClusterBackend, T>(
    backend: &B,
    cluster: &Cluster,
    phase: SyncPhase,
    result: Result<T>,
) -> Result<T> {
    if let Err(e) = &result {
        error!(cluster = %cluster.name_any(), phase = %phase, error = %e, "Sync step failed");
        let event = SyncEvent::SyncFailed {
            phase,
            message: e.to_string(),
        };
        backend.record_event(cluster, &event).await;
    }
    result
}

/// Existing rack StatefulSets by rack name, or `None` when one is stale.
async fn observe_stateful_sets<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
) -> Result<Option<BTreeMap<String, StatefulSet>>> {
    let mut stateful_sets = BTreeMap::new();
    for rack in &cluster.spec.datacenter.racks {
        let name = stateful_set_name(cluster, rack);
        let Some(sts) = backend.get_stateful_set(namespace, &name).await? else {
            continue;
        };
        if !is_observed(&sts) {
            return Ok(None);
        }
        stateful_sets.insert(rack.name.clone(), sts);
    }
    Ok(Some(stateful_sets))
}

/// Delete services and PVCs of members whose index is beyond the rack's
/// replicas. Failures are reported and the sync continues.
async fn cleanup<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    stateful_sets: &BTreeMap<String, StatefulSet>,
) {
    for rack in &cluster.spec.datacenter.racks {
        let Some(sts) = stateful_sets.get(&rack.name) else {
            continue;
        };
        let result = cleanup_rack(cluster, backend, namespace, rack, replicas(sts)).await;
        // Reported only; a partial cleanup is retried on the next sync.
        let _ = in_phase(backend, cluster, SyncPhase::Cleanup, result).await;
    }
}

async fn cleanup_rack<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    rack: &RackSpec,
    replicas: i32,
) -> Result<()> {
    let services = backend
        .list_services(namespace, &rack_selector(cluster, rack))
        .await?;

    for svc in services {
        let name = svc.name_any();
        let index = match member_index(&name) {
            Ok(index) => index,
            Err(e) => {
                error!(service = %name, error = %e, "Skipping service with invalid member name");
                continue;
            }
        };
        if index < replicas {
            continue;
        }

        for template in &rack.storage.volume_claim_templates {
            let template_name = template.metadata.name.as_deref().unwrap_or_default();
            let claim = pvc_name(template_name, &name);
            info!(claim = %claim, "Deleting volume claim of removed member");
            backend.delete_persistent_volume_claim(namespace, &claim).await?;
        }
        info!(service = %name, "Deleting service of removed member");
        backend.delete_service(namespace, &name).await?;
    }
    Ok(())
}

async fn sync_headless_service<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
) -> Result<()> {
    let name = headless_service_name(cluster);
    match backend.get_service(namespace, &name).await? {
        Some(existing) => ensure_controlled("Service", &existing.metadata, cluster),
        None => {
            info!(service = %name, "Creating headless service");
            backend
                .create_service(namespace, &generate_headless_service(cluster))
                .await
        }
    }
}

async fn sync_member_services<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    stateful_sets: &BTreeMap<String, StatefulSet>,
) -> Result<()> {
    let mut pods = backend.list_pods(namespace, &cluster_labels(cluster)).await?;
    pods.sort_by_key(|pod| pod.name_any());

    for pod in pods {
        let name = pod.name_any();
        if pod.metadata.deletion_timestamp.is_some() {
            debug!(pod = %name, "Skipping terminating pod");
            continue;
        }

        let rack_replicas = pod
            .labels()
            .get(RACK_NAME_LABEL)
            .and_then(|rack| stateful_sets.get(rack))
            .map(replicas);
        let Some(rack_replicas) = rack_replicas else {
            warn!(pod = %name, "Pod does not belong to a known rack");
            continue;
        };
        match member_index(&name) {
            Ok(index) if index >= rack_replicas => {
                debug!(pod = %name, "Skipping pod beyond rack replicas");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                error!(pod = %name, error = %e, "Skipping pod with invalid member name");
                continue;
            }
        }

        match backend.get_service(namespace, &name).await? {
            Some(existing) => ensure_controlled("Service", &existing.metadata, cluster)?,
            None => {
                let service = generate_member_service(&pod, cluster)?;
                info!(service = %name, "Creating member service");
                backend.create_service(namespace, &service).await?;
            }
        }
    }
    Ok(())
}

/// Add the Cluster as a non-controlling owner of every referenced ConfigMap.
async fn sync_config_map_owners<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
) -> Result<()> {
    for rack in &cluster.spec.datacenter.racks {
        let Some(name) = rack.config_map_name.as_deref() else {
            continue;
        };
        let Some(config_map) = backend.get_config_map(namespace, name).await? else {
            debug!(config_map = %name, rack = %rack.name, "Referenced ConfigMap does not exist");
            continue;
        };
        if has_owner(&config_map.metadata, cluster) {
            continue;
        }

        let mut owners = config_map.metadata.owner_references.unwrap_or_default();
        owners.push(non_controlling_owner_reference(cluster));
        backend.set_config_map_owners(namespace, name, &owners).await?;
    }
    Ok(())
}

async fn compute_status<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    stateful_sets: &BTreeMap<String, StatefulSet>,
) -> Result<ClusterStatus> {
    let mut status = ClusterStatus::default();
    for rack in &cluster.spec.datacenter.racks {
        let Some(sts) = stateful_sets.get(&rack.name) else {
            continue;
        };
        let services = backend
            .list_services(namespace, &rack_selector(cluster, rack))
            .await?;
        status
            .racks
            .insert(rack.name.clone(), rack_status(sts, &services)?);
    }
    Ok(status)
}

async fn sync_shape<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    default_sidecar_image: &str,
) -> Result<()> {
    let status = cluster.status.clone().unwrap_or_default();
    let racks = &cluster.spec.datacenter.racks;

    if let Some(rack) = racks.iter().find(|r| !status.racks.contains_key(&r.name)) {
        return create_rack(cluster, backend, namespace, rack, default_sidecar_image).await;
    }

    for rack in racks {
        if let Some(rack_status) = status.racks.get(&rack.name) {
            if rack_status.is_member_leaving() {
                return resume_scale_down(cluster, backend, namespace, rack, rack_status.members)
                    .await;
            }
        }
    }

    if status.racks.values().any(|r| r.members != r.ready_members) {
        debug!(cluster = %cluster.name_any(), "Waiting for members to become ready");
        return Ok(());
    }

    for rack in racks {
        let Some(rack_status) = status.racks.get(&rack.name) else {
            continue;
        };
        if rack.members < rack_status.members {
            return begin_scale_down(cluster, backend, namespace, rack, rack_status.members).await;
        }
    }

    for rack in racks {
        let Some(rack_status) = status.racks.get(&rack.name) else {
            continue;
        };
        if rack.members > rack_status.members {
            return scale_up(cluster, backend, namespace, rack).await;
        }
    }

    Ok(())
}

async fn create_rack<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    rack: &RackSpec,
    default_sidecar_image: &str,
) -> Result<()> {
    let sidecar_image = sidecar_image_for_cluster(cluster, default_sidecar_image);
    let sts = generate_statefulset(cluster, rack, &sidecar_image);
    info!(cluster = %cluster.name_any(), rack = %rack.name, "Creating rack");
    backend.create_stateful_set(namespace, &sts).await?;
    backend
        .record_event(
            cluster,
            &SyncEvent::RackCreated {
                rack: rack.name.clone(),
            },
        )
        .await;
    Ok(())
}

async fn scale_up<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    rack: &RackSpec,
) -> Result<()> {
    let name = stateful_set_name(cluster, rack);
    let sts = backend
        .get_stateful_set(namespace, &name)
        .await?
        .ok_or_else(|| Error::not_found("StatefulSet", &name))?;
    let target = replicas(&sts) + 1;

    info!(rack = %rack.name, replicas = target, "Scaling rack up");
    backend.scale_stateful_set(namespace, &name, target).await?;
    backend
        .record_event(
            cluster,
            &SyncEvent::RackScaledUp {
                rack: rack.name.clone(),
                replicas: target,
            },
        )
        .await;
    Ok(())
}

/// Ask the last member of a rack to decommission.
async fn begin_scale_down<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    rack: &RackSpec,
    members: i32,
) -> Result<()> {
    let member = member_name(cluster, rack, members - 1);
    if backend.get_service(namespace, &member).await?.is_none() {
        return Err(Error::not_found("Service", &member));
    }

    let labels = BTreeMap::from([(
        DECOMMISSIONED_LABEL.to_string(),
        LABEL_VALUE_FALSE.to_string(),
    )]);
    info!(rack = %rack.name, member = %member, "Starting decommission of last member");
    backend
        .patch_service_labels(namespace, &member, &labels)
        .await?;
    backend
        .record_event(
            cluster,
            &SyncEvent::RackScaleDownInProgress {
                rack: rack.name.clone(),
                member,
            },
        )
        .await;
    Ok(())
}

/// Scale a rack down once its last member reports it has decommissioned.
async fn resume_scale_down<B: ClusterBackend>(
    cluster: &Cluster,
    backend: &B,
    namespace: &str,
    rack: &RackSpec,
    members: i32,
) -> Result<()> {
    let member = member_name(cluster, rack, members - 1);
    let svc = backend
        .get_service(namespace, &member)
        .await?
        .ok_or_else(|| Error::not_found("Service", &member))?;

    let decommissioned = svc.labels().get(DECOMMISSIONED_LABEL).map(String::as_str);
    if decommissioned != Some(LABEL_VALUE_TRUE) {
        debug!(member = %member, "Waiting for member to finish decommission");
        return Ok(());
    }

    let name = stateful_set_name(cluster, rack);
    let target = members - 1;
    info!(rack = %rack.name, replicas = target, "Scaling rack down");
    backend.scale_stateful_set(namespace, &name, target).await?;
    backend
        .record_event(
            cluster,
            &SyncEvent::RackScaledDown {
                rack: rack.name.clone(),
                replicas: target,
            },
        )
        .await;
    Ok(())
}

fn ensure_controlled(kind: &'static str, meta: &ObjectMeta, cluster: &Cluster) -> Result<()> {
    if is_controlled_by(meta, cluster) {
        return Ok(());
    }
    Err(Error::OwnershipConflict {
        kind,
        name: meta.name.clone().unwrap_or_default(),
        cluster: cluster.name_any(),
    })
}
