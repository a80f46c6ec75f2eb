//! Validating admission for `Cluster` objects.
//!
//! Value checks run on every CREATE and UPDATE. Update checks compare the
//! request against the stored object and guard fields the operator cannot
//! reconcile once set (mode, version, datacenter, removed racks).

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{
    VALIDATE_CLUSTER_PATH, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError,
    create_webhook_router, review_request, run_webhook_server,
};

// Admission types used by callers building reviews by hand.
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
