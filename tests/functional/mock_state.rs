//! In-memory orchestrator for driving the cluster sync in functional tests.
//!
//! `MockCluster` implements [`ClusterBackend`] over plain maps and plays the
//! parts of the platform the sync depends on:
//!
//! - the StatefulSet controller (`settle`): observes generations, creates and
//!   removes pods and their claims, reports ready replicas
//! - the service IP allocator
//! - the member sidecar (`complete_decommissions`): answers
//!   `decommissioned=false` with `decommissioned=true`
//!
//! The sync itself is always the production code.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use cassandra_operator::controller::backend::{ClusterBackend, SyncEvent};
use cassandra_operator::controller::cluster_sync::reconcile_cluster;
use cassandra_operator::controller::error::Result;
use cassandra_operator::crd::{
    Cluster, ClusterSpec, ClusterStatus, DatacenterSpec, RackSpec, StorageSpec,
};
use cassandra_operator::resources::common::{DECOMMISSIONED_LABEL, LABEL_VALUE_FALSE, LABEL_VALUE_TRUE};

pub const NAMESPACE: &str = "t";
pub const SIDECAR_IMAGE: &str = "rook/cassandra:test";

/// A write performed through the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    CreateStatefulSet(String),
    Scale { name: String, replicas: i32 },
    CreateService(String),
    DeleteService(String),
    LabelService(String),
    DeleteClaim(String),
    SetConfigMapOwners(String),
    PatchStatus,
}

#[derive(Debug, Default)]
struct MockState {
    stateful_sets: BTreeMap<String, StatefulSet>,
    services: BTreeMap<String, Service>,
    pods: BTreeMap<String, Pod>,
    claims: BTreeSet<String>,
    config_maps: BTreeMap<String, ConfigMap>,
    status: Option<ClusterStatus>,
    writes: Vec<Write>,
    events: Vec<SyncEvent>,
    next_ip: u32,
    hold_readiness: bool,
}

#[derive(Debug, Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

fn matches_selector(meta: &ObjectMeta, selector: &BTreeMap<String, String>) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Keep new pods unready until `release_readiness` is called.
    pub fn hold_readiness(&self, hold: bool) {
        self.with_state(|s| s.hold_readiness = hold);
    }

    /// Run one pass of the StatefulSet controller.
    pub fn settle(&self) {
        self.with_state(|s| {
            let hold = s.hold_readiness;
            let names: Vec<String> = s.stateful_sets.keys().cloned().collect();
            for name in names {
                let Some(sts) = s.stateful_sets.get(&name).cloned() else {
                    continue;
                };
                let spec = sts.spec.clone().unwrap_or_default();
                let replicas = spec.replicas.unwrap_or(0);
                let pod_labels = spec
                    .template
                    .metadata
                    .as_ref()
                    .and_then(|m| m.labels.clone());

                for index in 0..replicas {
                    let pod_name = format!("{}-{}", name, index);
                    if s.pods.contains_key(&pod_name) {
                        continue;
                    }
                    s.pods.insert(
                        pod_name.clone(),
                        Pod {
                            metadata: ObjectMeta {
                                name: Some(pod_name.clone()),
                                namespace: Some(NAMESPACE.to_string()),
                                labels: pod_labels.clone(),
                                ..Default::default()
                            },
                            ..Default::default()
                        },
                    );
                    for template in spec.volume_claim_templates.iter().flatten() {
                        let template_name = template.metadata.name.clone().unwrap_or_default();
                        s.claims.insert(format!("{}-{}", template_name, pod_name));
                    }
                }
                s.pods.retain(|pod_name, _| {
                    match pod_name.strip_prefix(&format!("{}-", name)) {
                        Some(suffix) => suffix.parse::<i32>().map_or(true, |i| i < replicas),
                        None => true,
                    }
                });

                let existing = s
                    .pods
                    .keys()
                    .filter(|p| p.starts_with(&format!("{}-", name)))
                    .count() as i32;
                let previous_ready = sts
                    .status
                    .as_ref()
                    .and_then(|st| st.ready_replicas)
                    .unwrap_or(0);
                let ready = if hold {
                    previous_ready.min(existing)
                } else {
                    existing
                };

                if let Some(sts) = s.stateful_sets.get_mut(&name) {
                    sts.status = Some(StatefulSetStatus {
                        observed_generation: sts.metadata.generation,
                        replicas: existing,
                        ready_replicas: Some(ready),
                        ..Default::default()
                    });
                }
            }
        });
    }

    /// Mark every existing pod ready on the next `settle`.
    pub fn release_readiness(&self) {
        self.hold_readiness(false);
        self.settle();
    }

    /// Play the sidecar: finish every requested decommission.
    pub fn complete_decommissions(&self) {
        self.with_state(|s| {
            for svc in s.services.values_mut() {
                let labels = svc.metadata.labels.get_or_insert_with(BTreeMap::new);
                if labels.get(DECOMMISSIONED_LABEL).map(String::as_str) == Some(LABEL_VALUE_FALSE) {
                    labels.insert(DECOMMISSIONED_LABEL.to_string(), LABEL_VALUE_TRUE.to_string());
                }
            }
        });
    }

    pub fn status(&self) -> Option<ClusterStatus> {
        self.with_state(|s| s.status.clone())
    }

    pub fn stateful_set(&self, name: &str) -> Option<StatefulSet> {
        self.with_state(|s| s.stateful_sets.get(name).cloned())
    }

    pub fn stateful_set_replicas(&self, name: &str) -> Option<i32> {
        self.stateful_set(name)
            .and_then(|sts| sts.spec.and_then(|spec| spec.replicas))
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.with_state(|s| s.services.get(name).cloned())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.with_state(|s| s.services.keys().cloned().collect())
    }

    pub fn all_services(&self) -> Vec<Service> {
        self.with_state(|s| s.services.values().cloned().collect())
    }

    pub fn all_stateful_sets(&self) -> Vec<StatefulSet> {
        self.with_state(|s| s.stateful_sets.values().cloned().collect())
    }

    pub fn has_claim(&self, name: &str) -> bool {
        self.with_state(|s| s.claims.contains(name))
    }

    pub fn insert_service(&self, service: Service) {
        self.with_state(|s| {
            s.services.insert(service.name_any(), service);
        });
    }

    pub fn remove_service(&self, name: &str) {
        self.with_state(|s| {
            s.services.remove(name);
        });
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        self.with_state(|s| {
            s.config_maps.insert(config_map.name_any(), config_map);
        });
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.with_state(|s| s.config_maps.get(name).cloned())
    }

    pub fn label_service(&self, name: &str, key: &str, value: &str) {
        self.with_state(|s| {
            if let Some(svc) = s.services.get_mut(name) {
                svc.metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), value.to_string());
            }
        });
    }

    /// Drain the writes recorded so far.
    pub fn take_writes(&self) -> Vec<Write> {
        self.with_state(|s| std::mem::take(&mut s.writes))
    }

    /// Drain the events recorded so far.
    pub fn take_events(&self) -> Vec<SyncEvent> {
        self.with_state(|s| std::mem::take(&mut s.events))
    }

    fn record(&self, write: Write) {
        self.with_state(|s| s.writes.push(write));
    }
}

impl ClusterBackend for MockCluster {
    async fn get_stateful_set(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.stateful_set(name))
    }

    async fn create_stateful_set(&self, _namespace: &str, stateful_set: &StatefulSet) -> Result<()> {
        let name = stateful_set.name_any();
        let mut sts = stateful_set.clone();
        sts.metadata.generation = Some(1);
        self.with_state(|s| s.stateful_sets.insert(name.clone(), sts));
        self.record(Write::CreateStatefulSet(name));
        Ok(())
    }

    async fn scale_stateful_set(&self, _namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.with_state(|s| {
            if let Some(sts) = s.stateful_sets.get_mut(name) {
                sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
                sts.metadata.generation = Some(sts.metadata.generation.unwrap_or(0) + 1);
            }
        });
        self.record(Write::Scale {
            name: name.to_string(),
            replicas,
        });
        Ok(())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(name))
    }

    async fn list_services(
        &self,
        _namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        Ok(self.with_state(|s| {
            s.services
                .values()
                .filter(|svc| matches_selector(&svc.metadata, selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_service(&self, _namespace: &str, service: &Service) -> Result<()> {
        let name = service.name_any();
        let mut svc = service.clone();
        self.with_state(|s| {
            let spec = svc.spec.get_or_insert_with(Default::default);
            if spec.cluster_ip.is_none() {
                s.next_ip += 1;
                spec.cluster_ip = Some(format!("10.96.0.{}", s.next_ip));
            }
            s.services.insert(name.clone(), svc);
        });
        self.record(Write::CreateService(name));
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with_state(|s| s.services.remove(name));
        self.record(Write::DeleteService(name.to_string()));
        Ok(())
    }

    async fn patch_service_labels(
        &self,
        _namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.with_state(|s| {
            if let Some(svc) = s.services.get_mut(name) {
                svc.metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(labels.clone());
            }
        });
        self.record(Write::LabelService(name.to_string()));
        Ok(())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self.with_state(|s| {
            s.pods
                .values()
                .filter(|pod| matches_selector(&pod.metadata, selector))
                .cloned()
                .collect()
        }))
    }

    async fn delete_persistent_volume_claim(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with_state(|s| s.claims.remove(name));
        self.record(Write::DeleteClaim(name.to_string()));
        Ok(())
    }

    async fn get_config_map(&self, _namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_map(name))
    }

    async fn set_config_map_owners(
        &self,
        _namespace: &str,
        name: &str,
        owners: &[OwnerReference],
    ) -> Result<()> {
        self.with_state(|s| {
            if let Some(cm) = s.config_maps.get_mut(name) {
                cm.metadata.owner_references = Some(owners.to_vec());
            }
        });
        self.record(Write::SetConfigMapOwners(name.to_string()));
        Ok(())
    }

    async fn patch_cluster_status(&self, _cluster: &Cluster, status: &ClusterStatus) -> Result<()> {
        self.with_state(|s| s.status = Some(status.clone()));
        self.record(Write::PatchStatus);
        Ok(())
    }

    async fn record_event(&self, _cluster: &Cluster, event: &SyncEvent) {
        self.with_state(|s| s.events.push(event.clone()));
    }
}

/// A volume claim template named `name`.
pub fn claim(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn rack(name: &str, members: i32) -> RackSpec {
    RackSpec {
        name: name.to_string(),
        members,
        storage: StorageSpec {
            volume_claim_templates: vec![claim("data")],
        },
        ..Default::default()
    }
}

/// Cluster `c1` in namespace `t` with datacenter `dc1`.
pub fn cluster(racks: Vec<RackSpec>) -> Cluster {
    let mut cluster = Cluster::new(
        "c1",
        ClusterSpec {
            version: "3.1.11".to_string(),
            datacenter: DatacenterSpec {
                name: "dc1".to_string(),
                racks,
            },
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some("uid-c1".to_string());
    cluster
}

/// One controller round: reconcile against the stored status, then let the
/// platform react.
pub async fn round(mock: &MockCluster, cluster: &mut Cluster) -> Result<()> {
    cluster.status = mock.status();
    let result = reconcile_cluster(cluster, mock, SIDECAR_IMAGE).await.map(|_| ());
    mock.complete_decommissions();
    mock.settle();
    cluster.status = mock.status();
    result
}

/// Run rounds until one performs no writes. Returns the number of rounds
/// that wrote something.
pub async fn converge(mock: &MockCluster, cluster: &mut Cluster, max_rounds: usize) -> usize {
    for n in 0..max_rounds {
        round(mock, cluster).await.unwrap();
        if mock.take_writes().is_empty() {
            return n;
        }
    }
    panic!("cluster did not converge within {} rounds", max_rounds);
}
