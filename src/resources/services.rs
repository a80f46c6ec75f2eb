//! Service generation for Cassandra clusters.
//!
//! Creates two kinds of services:
//! - **Headless Service**: governing service of every rack StatefulSet
//! - **Member Service**: one ClusterIP service per pod, whose stable IP is the
//!   member's broadcast address

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::Cluster;
use crate::resources::common::{
    CLUSTER_NAME_LABEL, DATACENTER_NAME_LABEL, InvalidName, RACK_NAME_LABEL, SEED_LABEL,
    cluster_labels, common_labels, headless_service_name, is_seed, member_index, owner_reference,
    pod_identity_selector,
};
use crate::resources::statefulset::{
    CQL_PORT, CQL_SSL_PORT, INTRA_NODE_PORT, JMX_PORT, PROMETHEUS_PORT, THRIFT_PORT,
    TLS_INTRA_NODE_PORT,
};

/// Keeps endpoints of unready pods published on older platforms.
const TOLERATE_UNREADY_ENDPOINTS_ANNOTATION: &str =
    "service.alpha.kubernetes.io/tolerate-unready-endpoints";

/// Generate the headless Service of a cluster.
///
/// The platform rejects services without ports, so the prometheus port is
/// exposed even though nothing connects through this service.
pub fn generate_headless_service(cluster: &Cluster) -> Service {
    let labels = cluster_labels(cluster);

    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(cluster)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("prometheus".to_string()),
                port: PROMETHEUS_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the per-member Service of a pod.
///
/// Fails when the pod name carries no member index. Members 0 and 1 of every
/// rack are labeled as seeds.
pub fn generate_member_service(pod: &Pod, cluster: &Cluster) -> Result<Service, InvalidName> {
    let pod_name = pod.name_any();
    let index = member_index(&pod_name)?;

    let mut labels = common_labels();
    let pod_labels = pod.labels();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    for key in [DATACENTER_NAME_LABEL, RACK_NAME_LABEL] {
        if let Some(value) = pod_labels.get(key) {
            labels.insert(key.to_string(), value.clone());
        }
    }
    if is_seed(index) {
        labels.insert(SEED_LABEL.to_string(), String::new());
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(
        TOLERATE_UNREADY_ENDPOINTS_ANNOTATION.to_string(),
        "true".to_string(),
    );

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: pod.namespace().or_else(|| cluster.namespace()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_identity_selector(&pod_name)),
            publish_not_ready_addresses: Some(true),
            ports: Some(member_ports()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn member_ports() -> Vec<ServicePort> {
    [
        ("inter-node-communication", INTRA_NODE_PORT),
        ("ssl-inter-node-communication", TLS_INTRA_NODE_PORT),
        ("jmx-monitoring", JMX_PORT),
        ("cql", CQL_PORT),
        ("thrift", THRIFT_PORT),
        ("cql-ssl", CQL_SSL_PORT),
    ]
    .into_iter()
    .map(|(name, port)| ServicePort {
        name: Some(name.to_string()),
        port,
        ..Default::default()
    })
    .collect()
}

/// Whether a service is headless (`clusterIP: None`).
pub fn is_headless(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        == Some("None")
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
    use crate::crd::{ClusterSpec, DatacenterSpec};

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
                    racks: vec![],
                },
                ..Default::default()
            },
            status: None,
        }
    }

    fn test_pod(name: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_NAME_LABEL.to_string(), "c1".to_string());
        labels.insert(DATACENTER_NAME_LABEL.to_string(), "dc1".to_string());
        labels.insert(RACK_NAME_LABEL.to_string(), "r1".to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_headless_service() {
        let cluster = test_cluster("c1");
        let svc = generate_headless_service(&cluster);

        assert_eq!(svc.metadata.name, Some("c1-client".to_string()));
        assert!(is_headless(&svc));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 9180);
        assert_eq!(
            spec.selector.unwrap().get(CLUSTER_NAME_LABEL).unwrap(),
            "c1"
        );
    }

    #[test]
    fn test_generate_member_service() {
        let cluster = test_cluster("c1");
        let svc = generate_member_service(&test_pod("c1-dc1-r1-2"), &cluster).unwrap();

        assert_eq!(svc.metadata.name, Some("c1-dc1-r1-2".to_string()));
        assert!(!is_headless(&svc));
        let labels = svc.metadata.labels.unwrap();
        assert_eq!(labels.get(RACK_NAME_LABEL).unwrap(), "r1");
        assert!(!labels.contains_key(SEED_LABEL));
        assert_eq!(
            svc.metadata
                .annotations
                .unwrap()
                .get(TOLERATE_UNREADY_ENDPOINTS_ANNOTATION)
                .unwrap(),
            "true"
        );

        let spec = svc.spec.unwrap();
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(
            spec.selector.unwrap(),
            pod_identity_selector("c1-dc1-r1-2")
        );
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![7000, 7001, 7199, 9042, 9160, 9142]);
    }

    #[test]
    fn test_first_two_members_are_seeds() {
        let cluster = test_cluster("c1");
        for (name, seed) in [("c1-dc1-r1-0", true), ("c1-dc1-r1-1", true), ("c1-dc1-r1-2", false)] {
            let svc = generate_member_service(&test_pod(name), &cluster).unwrap();
            assert_eq!(
                svc.metadata.labels.unwrap().contains_key(SEED_LABEL),
                seed,
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_member_service_rejects_invalid_name() {
        let cluster = test_cluster("c1");
        assert!(generate_member_service(&test_pod("c1-dc1-r1-x"), &cluster).is_err());
    }
}
