//! Immutability validation policy.
//!
//! Tier 2 (Update): Only enforced on UPDATE operations
//!
//! Validates:
//! - Cluster-wide image, mode and datacenter identity never change
//! - Racks are never removed
//! - Placement, storage and resources of persisted racks never change

use super::{ValidationContext, ValidationResult, reasons};

fn immutable(field: &str) -> ValidationResult {
    ValidationResult::denied(
        reasons::IMMUTABLE_FIELD,
        format!("change of {} is currently not supported", field),
    )
}

/// Validate immutability constraints on UPDATE operations
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let Some(old) = ctx.old_resource else {
        return ValidationResult::allowed();
    };
    let old = &old.spec;
    let new = &ctx.resource.spec;

    if old.version != new.version {
        return immutable("version");
    }
    if old.repository != new.repository {
        return immutable("repository");
    }
    if old.mode != new.mode {
        return immutable("mode");
    }
    if old.sidecar_image != new.sidecar_image {
        return immutable("sidecarImage");
    }
    if old.datacenter.name != new.datacenter.name {
        return immutable("datacenter name");
    }

    for old_rack in &old.datacenter.racks {
        let Some(new_rack) = new.datacenter.racks.iter().find(|r| r.name == old_rack.name) else {
            return ValidationResult::denied(
                reasons::RACK_REMOVED,
                format!("rack {} is missing, removing racks is not supported", old_rack.name),
            );
        };

        if old_rack.placement != new_rack.placement {
            return immutable(&format!("placement of rack {}", old_rack.name));
        }
        if old_rack.storage != new_rack.storage {
            return immutable(&format!("storage of rack {}", old_rack.name));
        }
        if old_rack.resources != new_rack.resources {
            return immutable(&format!("resources of rack {}", old_rack.name));
        }
    }

    ValidationResult::allowed()
}
