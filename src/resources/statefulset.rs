//! StatefulSet generation for Cassandra racks.
//!
//! Each rack is one StatefulSet, created with zero replicas and grown one
//! member at a time by the reconciler. Pods run two containers:
//! - an init container copying the sidecar binaries into a shared volume
//! - the database container, whose entrypoint is the sidecar itself

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    HTTPGetAction, Lifecycle, LifecycleHandler, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceFieldSelector, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{Cluster, RackSpec};
use crate::resources::common::{
    data_dir, headless_service_name, image_for_cluster, owner_reference, rack_labels,
    service_account_name, stateful_set_name,
};

pub const INTRA_NODE_PORT: i32 = 7000;
pub const TLS_INTRA_NODE_PORT: i32 = 7001;
pub const JMX_PORT: i32 = 7199;
pub const CQL_PORT: i32 = 9042;
pub const THRIFT_PORT: i32 = 9160;
pub const CQL_SSL_PORT: i32 = 9142;
pub const JOLOKIA_PORT: i32 = 8778;
pub const PROMETHEUS_PORT: i32 = 9180;

/// Port of the sidecar's health server.
pub const PROBE_PORT: u16 = 8080;
pub const LIVENESS_PROBE_PATH: &str = "/healthz";
pub const READINESS_PROBE_PATH: &str = "/readyz";

/// Name of the database container.
pub const DATABASE_CONTAINER_NAME: &str = "cassandra";
/// Volume and mount point holding the sidecar binaries.
pub const SHARED_VOLUME_NAME: &str = "shared";
pub const SHARED_DIR: &str = "/mnt/shared";

pub const POD_IP_ENV: &str = "POD_IP";
pub const POD_NAME_ENV: &str = "POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const CPU_LIMIT_ENV: &str = "CPU_LIMIT";
pub const MEMORY_LIMIT_ENV: &str = "MEMORY_LIMIT";

/// Two days: decommissioning a large member can take very long.
const TERMINATION_GRACE_PERIOD: i64 = 200_000;

/// Generate the StatefulSet of a rack.
///
/// The StatefulSet always starts at zero replicas; scaling is driven by the
/// reconciler one member per reconciliation.
pub fn generate_statefulset(cluster: &Cluster, rack: &RackSpec, sidecar_image: &str) -> StatefulSet {
    let labels = rack_labels(cluster, rack);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(stateful_set_name(cluster, rack)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(0),
            service_name: Some(headless_service_name(cluster)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            // Members must join the ring one at a time
            pod_management_policy: Some("OrderedReady".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: generate_pod_template(cluster, rack, sidecar_image, labels),
            volume_claim_templates: Some(generate_pvc_templates(rack)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Image providing the sidecar binaries, honoring the cluster's override.
pub fn sidecar_image_for_cluster(cluster: &Cluster, default_image: &str) -> String {
    cluster
        .spec
        .sidecar_image
        .as_ref()
        .map(|image| image.reference())
        .unwrap_or_else(|| default_image.to_string())
}

fn generate_pod_template(
    cluster: &Cluster,
    rack: &RackSpec,
    sidecar_image: &str,
    labels: BTreeMap<String, String>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: rack.annotations.clone(),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: SHARED_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            init_containers: Some(vec![generate_install_container(sidecar_image)]),
            containers: vec![generate_database_container(cluster, rack)],
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
            service_account_name: Some(service_account_name(cluster)),
            affinity: affinity_for_rack(rack),
            tolerations: tolerations_for_rack(rack),
            ..Default::default()
        }),
    }
}

/// Copies the sidecar and its agents into the shared volume.
fn generate_install_container(sidecar_image: &str) -> Container {
    Container {
        name: "sidecar-install".to_string(),
        image: Some(sidecar_image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cp -a /sidecar/* {}", SHARED_DIR),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: SHARED_VOLUME_NAME.to_string(),
            mount_path: SHARED_DIR.to_string(),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn generate_database_container(cluster: &Cluster, rack: &RackSpec) -> Container {
    Container {
        name: DATABASE_CONTAINER_NAME.to_string(),
        image: Some(image_for_cluster(cluster)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(container_ports()),
        // The sidecar generates the configuration and then starts the database
        command: Some(vec![
            format!("{}/tini", SHARED_DIR),
            "--".to_string(),
            format!("{}/cassandra-sidecar", SHARED_DIR),
        ]),
        env: Some(generate_env_vars()),
        resources: Some(rack.resources.clone()),
        volume_mounts: Some(generate_volume_mounts(cluster, rack)),
        liveness_probe: Some(generate_liveness_probe()),
        readiness_probe: Some(generate_readiness_probe()),
        lifecycle: Some(generate_lifecycle()),
        ..Default::default()
    }
}

fn container_ports() -> Vec<ContainerPort> {
    [
        ("intra-node", INTRA_NODE_PORT),
        ("tls-intra-node", TLS_INTRA_NODE_PORT),
        ("jmx", JMX_PORT),
        ("cql", CQL_PORT),
        ("thrift", THRIFT_PORT),
        ("jolokia", JOLOKIA_PORT),
        ("prometheus", PROMETHEUS_PORT),
    ]
    .into_iter()
    .map(|(name, port)| ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    })
    .collect()
}

/// Pod identity and resource limits exposed through the downward API.
fn generate_env_vars() -> Vec<EnvVar> {
    vec![
        field_env(POD_IP_ENV, "status.podIP"),
        field_env(POD_NAME_ENV, "metadata.name"),
        field_env(POD_NAMESPACE_ENV, "metadata.namespace"),
        resource_env(CPU_LIMIT_ENV, "limits.cpu", "1"),
        resource_env(MEMORY_LIMIT_ENV, "limits.memory", "1Mi"),
    ]
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_env(name: &str, resource: &str, divisor: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                container_name: Some(DATABASE_CONTAINER_NAME.to_string()),
                resource: resource.to_string(),
                divisor: Some(Quantity(divisor.to_string())),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_volume_mounts(cluster: &Cluster, rack: &RackSpec) -> Vec<VolumeMount> {
    let mut mounts = vec![VolumeMount {
        name: SHARED_VOLUME_NAME.to_string(),
        mount_path: SHARED_DIR.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];

    // Only the first claim template is mounted
    if let Some(name) = rack
        .storage
        .volume_claim_templates
        .first()
        .and_then(|claim| claim.metadata.name.clone())
    {
        mounts.push(VolumeMount {
            name,
            mount_path: data_dir(cluster.spec.mode).to_string(),
            ..Default::default()
        });
    }
    mounts
}

/// Claim templates of the rack, forced to `ReadWriteOnce`.
fn generate_pvc_templates(rack: &RackSpec) -> Vec<PersistentVolumeClaim> {
    rack.storage
        .volume_claim_templates
        .iter()
        .cloned()
        .map(|mut claim| {
            let spec = claim.spec.get_or_insert_with(PersistentVolumeClaimSpec::default);
            spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
            claim
        })
        .collect()
}

/// Liveness probe.
///
/// The initial delay is large because Scylla benchmarks its disks on first start.
fn generate_liveness_probe() -> Probe {
    http_probe(LIVENESS_PROBE_PATH, 400)
}

fn generate_readiness_probe() -> Probe {
    http_probe(READINESS_PROBE_PATH, 15)
}

fn http_probe(path: &str, initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(PROBE_PORT)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

/// Flush memtables and stop accepting connections before the pod stops.
fn generate_lifecycle() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec!["nodetool".to_string(), "drain".to_string()]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn affinity_for_rack(rack: &RackSpec) -> Option<Affinity> {
    rack.placement.as_ref().map(|placement| Affinity {
        node_affinity: placement.node_affinity.clone(),
        pod_affinity: placement.pod_affinity.clone(),
        pod_anti_affinity: placement.pod_anti_affinity.clone(),
    })
}

fn tolerations_for_rack(rack: &RackSpec) -> Option<Vec<Toleration>> {
    rack.placement
        .as_ref()
        .and_then(|placement| placement.tolerations.clone())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterMode, ClusterSpec, DatacenterSpec, ImageSpec, PlacementSpec, StorageSpec,
    };
    use crate::resources::common::RACK_NAME_LABEL;

    fn test_rack() -> RackSpec {
        RackSpec {
            name: "r1".to_string(),
            members: 3,
            storage: StorageSpec {
                volume_claim_templates: vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("data".to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadOnlyMany".to_string()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    fn test_cluster(name: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                version: "3.11.1".to_string(),
                datacenter: DatacenterSpec {
                    name: "dc1".to_string(),
                    racks: vec![test_rack()],
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_generate_statefulset_basics() {
        let cluster = test_cluster("c1");
        let rack = &cluster.spec.datacenter.racks[0];
        let sts = generate_statefulset(&cluster, rack, "rook/cassandra:master");

        assert_eq!(sts.metadata.name, Some("c1-dc1-r1".to_string()));
        assert_eq!(sts.metadata.namespace, Some("default".to_string()));
        let owners = sts.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].controller, Some(true));

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(0));
        assert_eq!(spec.service_name, Some("c1-client".to_string()));
        assert_eq!(spec.pod_management_policy, Some("OrderedReady".to_string()));
        assert_eq!(
            spec.update_strategy.unwrap().type_,
            Some("RollingUpdate".to_string())
        );
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.get(RACK_NAME_LABEL).unwrap(), "r1");
    }

    #[test]
    fn test_pod_spec() {
        let cluster = test_cluster("c1");
        let sts = generate_statefulset(
            &cluster,
            &cluster.spec.datacenter.racks[0],
            "rook/cassandra:master",
        );
        let pod = sts.spec.unwrap().template.spec.unwrap();

        assert_eq!(pod.termination_grace_period_seconds, Some(200_000));
        assert_eq!(pod.service_account_name, Some("c1-member".to_string()));
        assert_eq!(pod.volumes.unwrap()[0].name, "shared");
        assert!(pod.affinity.is_none());
        assert!(pod.tolerations.is_none());

        let init = &pod.init_containers.unwrap()[0];
        assert_eq!(init.image, Some("rook/cassandra:master".to_string()));
        assert_eq!(init.command.as_ref().unwrap()[2], "cp -a /sidecar/* /mnt/shared");

        let container = &pod.containers[0];
        assert_eq!(container.image, Some("cassandra:3.11.1".to_string()));
        let ports: Vec<i32> = container
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert_eq!(ports, vec![7000, 7001, 7199, 9042, 9160, 8778, 9180]);
    }

    #[test]
    fn test_env_vars_use_downward_api() {
        let cluster = test_cluster("c1");
        let sts = generate_statefulset(&cluster, &cluster.spec.datacenter.racks[0], "img");
        let container = sts.spec.unwrap().template.spec.unwrap().containers[0].clone();
        let env = container.env.unwrap();

        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["POD_IP", "POD_NAME", "POD_NAMESPACE", "CPU_LIMIT", "MEMORY_LIMIT"]
        );

        let memory = env.iter().find(|e| e.name == "MEMORY_LIMIT").unwrap();
        let field = memory
            .value_from
            .as_ref()
            .unwrap()
            .resource_field_ref
            .as_ref()
            .unwrap();
        assert_eq!(field.resource, "limits.memory");
        assert_eq!(field.divisor, Some(Quantity("1Mi".to_string())));
    }

    #[test]
    fn test_probes_and_lifecycle() {
        let cluster = test_cluster("c1");
        let sts = generate_statefulset(&cluster, &cluster.spec.datacenter.racks[0], "img");
        let container = sts.spec.unwrap().template.spec.unwrap().containers[0].clone();

        let liveness = container.liveness_probe.unwrap();
        assert_eq!(liveness.initial_delay_seconds, Some(400));
        assert_eq!(liveness.period_seconds, Some(10));
        assert_eq!(liveness.timeout_seconds, Some(5));
        let http = liveness.http_get.unwrap();
        assert_eq!(http.path, Some("/healthz".to_string()));
        assert_eq!(http.port, IntOrString::Int(8080));

        let readiness = container.readiness_probe.unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(15));
        assert_eq!(
            readiness.http_get.unwrap().path,
            Some("/readyz".to_string())
        );

        let pre_stop = container.lifecycle.unwrap().pre_stop.unwrap();
        assert_eq!(
            pre_stop.exec.unwrap().command.unwrap(),
            vec!["nodetool".to_string(), "drain".to_string()]
        );
    }

    #[test]
    fn test_claim_template_forced_read_write_once() {
        let cluster = test_cluster("c1");
        let sts = generate_statefulset(&cluster, &cluster.spec.datacenter.racks[0], "img");
        let spec = sts.spec.unwrap();
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(
            claims[0].spec.as_ref().unwrap().access_modes,
            Some(vec!["ReadWriteOnce".to_string()])
        );

        let mounts = spec.template.spec.unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        assert_eq!(mounts[1].name, "data");
        assert_eq!(mounts[1].mount_path, "/var/lib/cassandra");
    }

    #[test]
    fn test_scylla_data_dir() {
        let mut cluster = test_cluster("c1");
        cluster.spec.mode = ClusterMode::Scylla;
        let sts = generate_statefulset(&cluster, &cluster.spec.datacenter.racks[0], "img");
        let container = sts.spec.unwrap().template.spec.unwrap().containers[0].clone();
        assert_eq!(container.image, Some("scylladb/scylla:3.11.1".to_string()));
        assert_eq!(container.volume_mounts.unwrap()[1].mount_path, "/var/lib/scylla");
    }

    #[test]
    fn test_placement() {
        let mut cluster = test_cluster("c1");
        cluster.spec.datacenter.racks[0].placement = Some(PlacementSpec {
            tolerations: Some(vec![Toleration {
                key: Some("dedicated".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let sts = generate_statefulset(&cluster, &cluster.spec.datacenter.racks[0], "img");
        let pod = sts.spec.unwrap().template.spec.unwrap();
        assert!(pod.affinity.is_some());
        assert_eq!(pod.tolerations.unwrap().len(), 1);
    }

    #[test]
    fn test_sidecar_image_override() {
        let mut cluster = test_cluster("c1");
        assert_eq!(sidecar_image_for_cluster(&cluster, "rook/cassandra:master"), "rook/cassandra:master");
        cluster.spec.sidecar_image = Some(ImageSpec {
            version: "v1.0".to_string(),
            repository: "example/sidecar".to_string(),
        });
        assert_eq!(sidecar_image_for_cluster(&cluster, "rook/cassandra:master"), "example/sidecar:v1.0");
    }
}
