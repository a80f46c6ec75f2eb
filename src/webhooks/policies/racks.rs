//! Rack value validation policy.
//!
//! Tier 1 (Values): Enforced on CREATE and UPDATE
//!
//! Validates:
//! - Rack names are unique within the datacenter
//! - Each rack has exactly one volume claim template
//! - `configMapName` is not set

use std::collections::HashSet;

use super::{ValidationContext, ValidationResult, reasons};

/// Validate the racks of the new object
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let mut seen = HashSet::new();

    for rack in &ctx.resource.spec.datacenter.racks {
        if !seen.insert(rack.name.as_str()) {
            return ValidationResult::denied(
                reasons::DUPLICATE_RACK,
                format!("rack names must be unique, rack {} is defined more than once", rack.name),
            );
        }

        match rack.storage.volume_claim_templates.len() {
            1 => {}
            0 => {
                return ValidationResult::denied(
                    reasons::NO_STORAGE,
                    format!("rack {} has no volume claim template, exactly one is required", rack.name),
                );
            }
            n => {
                return ValidationResult::denied(
                    reasons::TOO_MANY_STORAGE,
                    format!(
                        "rack {} has {} volume claim templates, exactly one is required",
                        rack.name, n
                    ),
                );
            }
        }

        if rack.config_map_name.is_some() {
            return ValidationResult::denied(
                reasons::UNSUPPORTED_FIELD,
                format!("rack {}: configMapName is currently not supported", rack.name),
            );
        }
    }

    ValidationResult::allowed()
}
