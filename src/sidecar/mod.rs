//! Member sidecar.
//!
//! Copied into every member pod by the init container. It writes the
//! database configuration, starts the database, serves the probes and
//! carries out decommission requests.

pub mod config;
pub mod env;
pub mod jolokia;
pub mod member;
pub mod probes;

use thiserror::Error;

pub use config::ConfigError;
pub use env::SidecarEnv;
pub use jolokia::{JolokiaClient, JolokiaError};
pub use member::MemberController;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Jolokia error: {0}")]
    Jolokia(#[from] JolokiaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("pod is missing label {0}")]
    MissingLabel(&'static str),

    #[error("decommission stopped in operation mode {0}")]
    DecommissionFailed(String),

    #[error("database exited: {0}")]
    DatabaseExited(String),

    #[error("probe server failed: {0}")]
    ProbeServer(String),
}

pub type Result<T, E = SidecarError> = std::result::Result<T, E>;
