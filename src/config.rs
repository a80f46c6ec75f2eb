//! Operator runtime configuration.
//!
//! Read from `CASSANDRA_OPERATOR_*` environment variables.

use serde::Deserialize;

/// Prefix of every operator environment variable.
pub const ENV_PREFIX: &str = "CASSANDRA_OPERATOR_";

const DEFAULT_WORKERS: u16 = 5;
const DEFAULT_SIDECAR_IMAGE: &str = "rook/cassandra:master";

/// Runtime configuration of the operator process.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OperatorConfig {
    /// Number of clusters reconciled concurrently.
    #[serde(default = "default_workers")]
    pub workers: u16,

    /// Image whose `/sidecar` directory holds the member sidecar binaries.
    #[serde(default = "default_sidecar_image")]
    pub sidecar_image: String,

    /// Restrict the operator to one namespace. Cluster-wide when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sidecar_image: default_sidecar_image(),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Build the config from the process environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }
}

fn default_workers() -> u16 {
    DEFAULT_WORKERS
}

fn default_sidecar_image() -> String {
    DEFAULT_SIDECAR_IMAGE.to_string()
}
