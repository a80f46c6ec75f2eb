//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use thiserror::Error;

use crate::resources::common::InvalidName;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A dependent object required by this sync is absent
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Observed state contradicts the decommission protocol
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A member name without a numeric index
    #[error(transparent)]
    InvalidName(#[from] InvalidName),

    /// An object with the expected name is not controlled by the Cluster
    #[error("{kind} {name} already exists and is not controlled by cluster {cluster}")]
    OwnershipConflict {
        kind: &'static str,
        name: String,
        cluster: String,
    },

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error may resolve itself without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::NotFound { .. } | Error::InvariantViolation(_) => true,
            Error::OwnershipConflict { .. }
            | Error::InvalidName(_)
            | Error::MissingField(_)
            | Error::Serialization(_) => false,
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
