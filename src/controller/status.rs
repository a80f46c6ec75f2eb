//! Status computation.
//!
//! Derives a rack's status from its StatefulSet and per-member services and
//! checks the decommission invariant: only the last member of a rack may be
//! decommissioning.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::error;

use crate::controller::error::{Error, Result};
use crate::crd::{RackCondition, RackStatus};
use crate::resources::common::{DECOMMISSIONED_LABEL, member_index};

/// Desired replicas of a StatefulSet.
pub fn replicas(stateful_set: &StatefulSet) -> i32 {
    stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0)
}

/// Whether the StatefulSet controller has observed the latest spec.
pub fn is_observed(stateful_set: &StatefulSet) -> bool {
    let observed = stateful_set
        .status
        .as_ref()
        .and_then(|status| status.observed_generation);
    observed == stateful_set.metadata.generation
}

/// Compute the status of a rack.
///
/// `services` are the per-member services selected by the rack selector.
/// Fails with `InvariantViolation` when a decommissioning member is not the
/// last one.
pub fn rack_status(stateful_set: &StatefulSet, services: &[Service]) -> Result<RackStatus> {
    let members = replicas(stateful_set);
    let ready_members = stateful_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0)
        .clamp(0, members.max(0));

    let mut conditions = Vec::new();
    let leaving: Vec<&Service> = services
        .iter()
        .filter(|svc| svc.labels().contains_key(DECOMMISSIONED_LABEL))
        .collect();

    if !leaving.is_empty() {
        conditions.push(RackCondition::member_leaving());
        for svc in leaving {
            let name = svc.name_any();
            match member_index(&name) {
                Ok(index) if index == members - 1 => {}
                Ok(index) => {
                    return Err(Error::InvariantViolation(format!(
                        "member {} (index {}) is decommissioning but the rack has {} members",
                        name, index, members
                    )));
                }
                Err(e) => error!(error = %e, "Skipping decommissioning service with invalid name"),
            }
        }
    }

    Ok(RackStatus {
        members,
        ready_members,
        conditions,
    })
}
