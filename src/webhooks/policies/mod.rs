//! Validation policies for Cluster admission webhooks.
//!
//! Policies are organized into tiers:
//! - Tier 1 (Values): Always enforced (rack names, storage, reserved fields)
//! - Tier 2 (Update): Only enforced on UPDATE operations (immutability)

pub mod immutability;
pub mod racks;

use crate::crd::Cluster;

/// Denial reasons reported by the policies.
pub mod reasons {
    pub const BAD_REQUEST: &str = "BadRequest";
    pub const DUPLICATE_RACK: &str = "DuplicateRack";
    pub const NO_STORAGE: &str = "NoStorage";
    pub const TOO_MANY_STORAGE: &str = "TooManyStorage";
    pub const UNSUPPORTED_FIELD: &str = "UnsupportedField";
    pub const IMMUTABLE_FIELD: &str = "ImmutableField";
    pub const RACK_REMOVED: &str = "RackRemoved";
}

/// Result of a validation check
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the validation passed
    pub allowed: bool,
    /// Reason for denial (if not allowed)
    pub reason: Option<String>,
    /// Detailed message (if not allowed)
    pub message: Option<String>,
}

impl ValidationResult {
    /// Create an allowed result
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    /// Create a denied result
    pub fn denied(reason: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Context for validation
pub struct ValidationContext<'a> {
    /// The Cluster being validated
    pub resource: &'a Cluster,
    /// The persisted Cluster (for UPDATE operations)
    pub old_resource: Option<&'a Cluster>,
}

impl ValidationContext<'_> {
    /// Check if this is an UPDATE operation
    pub fn is_update(&self) -> bool {
        self.old_resource.is_some()
    }
}

/// Run all validation policies
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    let result = racks::validate(ctx);
    if !result.allowed {
        return result;
    }

    if ctx.is_update() {
        let result = immutability::validate(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
