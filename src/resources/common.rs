//! Naming, labels and ownership shared by every generated resource.
//!
//! All names are derived deterministically from the Cluster and rack so the
//! reconciler and the sidecar agree on them without coordination.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use thiserror::Error;

use crate::crd::{Cluster, ClusterMode, RackSpec};

/// Value of `app.kubernetes.io/managed-by`.
pub const MANAGED_BY: &str = "cassandra-operator";
/// Value of the `app` and `app.kubernetes.io/name` labels.
pub const APP_NAME: &str = "rook-cassandra";

pub const CLUSTER_NAME_LABEL: &str = "cassandra.rook.io/cluster";
pub const DATACENTER_NAME_LABEL: &str = "cassandra.rook.io/datacenter";
pub const RACK_NAME_LABEL: &str = "cassandra.rook.io/rack";
/// Present (with an empty value) on the services of seed members.
pub const SEED_LABEL: &str = "cassandra.rook.io/seed";
/// `false` while a decommission is in progress, `true` once the sidecar finished it.
pub const DECOMMISSIONED_LABEL: &str = "cassandra.rook.io/decommissioned";
/// Label the StatefulSet controller puts on every pod.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Cluster annotation switching Scylla to developer mode.
pub const DEVELOPER_MODE_ANNOTATION: &str = "cassandra.rook.io/developer-mode";

pub const LABEL_VALUE_TRUE: &str = "true";
pub const LABEL_VALUE_FALSE: &str = "false";

/// Members with an index below this value are seeds.
pub const SEEDS_PER_RACK: i32 = 2;

const DATA_DIR_CASSANDRA: &str = "/var/lib/cassandra";
const DATA_DIR_SCYLLA: &str = "/var/lib/scylla";

/// A pod or service name that does not end in a member index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid member name {0:?}: expected a numeric suffix after the last '-'")]
pub struct InvalidName(pub String);

/// `<cluster>-<datacenter>-<rack>`
pub fn stateful_set_name(cluster: &Cluster, rack: &RackSpec) -> String {
    format!(
        "{}-{}-{}",
        cluster.name_any(),
        cluster.spec.datacenter.name,
        rack.name
    )
}

/// `<cluster>-client`
pub fn headless_service_name(cluster: &Cluster) -> String {
    format!("{}-client", cluster.name_any())
}

/// `<cluster>-member`
pub fn service_account_name(cluster: &Cluster) -> String {
    format!("{}-member", cluster.name_any())
}

/// Name of the `index`-th member of a rack.
pub fn member_name(cluster: &Cluster, rack: &RackSpec, index: i32) -> String {
    format!("{}-{}", stateful_set_name(cluster, rack), index)
}

/// Parse the ordinal suffix of a member (pod or per-member service) name.
pub fn member_index(name: &str) -> Result<i32, InvalidName> {
    let (_, suffix) = name
        .rsplit_once('-')
        .ok_or_else(|| InvalidName(name.to_string()))?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidName(name.to_string()));
    }
    suffix.parse().map_err(|_| InvalidName(name.to_string()))
}

/// Whether the member at `index` is a seed.
pub fn is_seed(index: i32) -> bool {
    (0..SEEDS_PER_RACK).contains(&index)
}

/// Name of the claim the StatefulSet controller creates for a member.
pub fn pvc_name(template_name: &str, member: &str) -> String {
    format!("{}-{}", template_name, member)
}

/// Labels shared by everything the operator manages.
pub fn common_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), APP_NAME.to_string());
    labels.insert("app.kubernetes.io/name".to_string(), APP_NAME.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels
}

/// Common labels plus the cluster label. Selects every member of a cluster.
pub fn cluster_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = common_labels();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    labels
}

/// Labels of a rack: common labels plus cluster, datacenter and rack.
pub fn rack_labels(cluster: &Cluster, rack: &RackSpec) -> BTreeMap<String, String> {
    let mut labels = common_labels();
    labels.extend(rack_selector(cluster, rack));
    labels
}

/// The `{cluster, datacenter, rack}` selector of a rack.
pub fn rack_selector(cluster: &Cluster, rack: &RackSpec) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    selector.insert(
        DATACENTER_NAME_LABEL.to_string(),
        cluster.spec.datacenter.name.clone(),
    );
    selector.insert(RACK_NAME_LABEL.to_string(), rack.name.clone());
    selector
}

/// Selects exactly one pod by name.
pub fn pod_identity_selector(pod_name: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert(POD_NAME_LABEL.to_string(), pod_name.to_string());
    selector
}

/// Render a label map as a list selector (`k1=v1,k2=v2`).
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector used by members to find the seeds of their cluster.
pub fn seed_selector(cluster_name: &str) -> String {
    format!("{},{}={}", SEED_LABEL, CLUSTER_NAME_LABEL, cluster_name)
}

/// Database image of the cluster (`repository:version`).
pub fn image_for_cluster(cluster: &Cluster) -> String {
    let repository = cluster
        .spec
        .repository
        .clone()
        .unwrap_or_else(|| match cluster.spec.mode {
            ClusterMode::Cassandra => "cassandra".to_string(),
            ClusterMode::Scylla => "scylladb/scylla".to_string(),
        });
    format!("{}:{}", repository, cluster.spec.version)
}

/// Directory the data volume is mounted at.
pub fn data_dir(mode: ClusterMode) -> &'static str {
    match mode {
        ClusterMode::Cassandra => DATA_DIR_CASSANDRA,
        ClusterMode::Scylla => DATA_DIR_SCYLLA,
    }
}

/// Controller owner reference pointing at the Cluster.
pub fn owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: "cassandra.rook.io/v1alpha1".to_string(),
        kind: "Cluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Non-controlling owner reference, used for user ConfigMaps.
pub fn non_controlling_owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        controller: Some(false),
        block_owner_deletion: None,
        ..owner_reference(cluster)
    }
}

/// Whether `meta` is controlled by the Cluster.
pub fn is_controlled_by(meta: &ObjectMeta, cluster: &Cluster) -> bool {
    let uid = cluster.uid().unwrap_or_default();
    meta.owner_references.iter().flatten().any(|r| {
        r.controller == Some(true) && r.kind == "Cluster" && r.uid == uid
    })
}

/// Whether `meta` carries any owner reference to the Cluster.
pub fn has_owner(meta: &ObjectMeta, cluster: &Cluster) -> bool {
    let uid = cluster.uid().unwrap_or_default();
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.kind == "Cluster" && r.uid == uid)
}
