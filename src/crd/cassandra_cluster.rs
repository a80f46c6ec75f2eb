//! Cassandra `Cluster` Custom Resource Definition.
//!
//! A Cluster describes one Cassandra (or Scylla) datacenter split into racks.
//! Each rack becomes one StatefulSet; each member of a rack gets its own
//! ClusterIP service whose address is used as the member's broadcast address.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    NodeAffinity, PersistentVolumeClaim, PodAffinity, PodAntiAffinity, ResourceRequirements,
    Toleration,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is the desired state of a Cassandra or Scylla deployment.
///
/// Example:
/// ```yaml
/// apiVersion: cassandra.rook.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: c1
/// spec:
///   version: 3.11.1
///   mode: cassandra
///   datacenter:
///     name: dc1
///     racks:
///       - name: r1
///         members: 3
///         storage:
///           volumeClaimTemplates:
///             - metadata:
///                 name: data
///               spec:
///                 resources:
///                   requests:
///                     storage: 5Gi
///         resources:
///           limits:
///             cpu: 1
///             memory: 2Gi
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cassandra.rook.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Datacenter", "type":"string", "jsonPath":".spec.datacenter.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Database version, used as the image tag.
    pub version: String,

    /// Image repository. Defaults to `cassandra` or `scylladb/scylla` depending on `mode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Database flavor.
    #[serde(default)]
    pub mode: ClusterMode,

    /// Free-form annotations for the cluster.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Overrides the image that provides the sidecar binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_image: Option<ImageSpec>,

    /// The single datacenter of this cluster.
    pub datacenter: DatacenterSpec,
}

/// Database flavor run by the cluster members.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    Cassandra,
    Scylla,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Cassandra => write!(f, "cassandra"),
            ClusterMode::Scylla => write!(f, "scylla"),
        }
    }
}

/// Container image coordinates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub version: String,
    pub repository: String,
}

impl ImageSpec {
    /// `repository:version`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.version)
    }
}

/// A datacenter is an ordered list of racks.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterSpec {
    /// Datacenter name. Immutable after creation.
    pub name: String,

    /// Racks of the datacenter. Racks can be appended but never removed.
    #[serde(default)]
    pub racks: Vec<RackSpec>,
}

/// A rack is a failure domain backed by one StatefulSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RackSpec {
    /// Rack name. Identifies the rack and never changes.
    pub name: String,

    /// Desired number of members.
    #[serde(default)]
    pub members: i32,

    /// Name of a user ConfigMap holding configuration overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    /// Persistent storage of each member.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Extra annotations for the rack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Scheduling constraints for members of this rack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementSpec>,

    /// Compute resources of the database container.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Storage of a rack's members.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Claim templates. Admission requires exactly one.
    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

/// Affinity and tolerations applied to a rack's pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity: Option<PodAntiAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

/// Observed state of a Cluster, written only by the operator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Per-rack status keyed by rack name.
    #[serde(default)]
    pub racks: BTreeMap<String, RackStatus>,
}

/// Observed state of one rack.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RackStatus {
    /// Current member count (the StatefulSet's replicas).
    pub members: i32,
    /// Members reported ready by the StatefulSet.
    pub ready_members: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RackCondition>,
}

impl RackStatus {
    /// Whether the rack carries a `MemberLeaving=True` condition.
    pub fn is_member_leaving(&self) -> bool {
        self.conditions.iter().any(|c| {
            c.type_ == RackConditionType::MemberLeaving && c.status == ConditionStatus::True
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RackCondition {
    #[serde(rename = "type")]
    pub type_: RackConditionType,
    pub status: ConditionStatus,
}

impl RackCondition {
    pub fn member_leaving() -> Self {
        Self {
            type_: RackConditionType::MemberLeaving,
            status: ConditionStatus::True,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RackConditionType {
    MemberLeaving,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Cluster {
    /// Look up a rack of the datacenter by name.
    pub fn rack(&self, name: &str) -> Option<&RackSpec> {
        self.spec.datacenter.racks.iter().find(|r| r.name == name)
    }
}
