//! Sidecar environment.
//!
//! The StatefulSet injects the pod identity and the database container's
//! resource limits through the downward API.

use serde::Deserialize;

use crate::sidecar::config::ConfigError;

/// Resource limits of the database container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Whole CPUs.
    pub cpus: i64,
    /// Memory in MiB.
    pub memory_mib: i64,
}

/// Environment variables read by the sidecar.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SidecarEnv {
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub pod_namespace: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

impl SidecarEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn pod_ip(&self) -> Result<&str, ConfigError> {
        required(&self.pod_ip, "POD_IP")
    }

    pub fn pod_name(&self) -> Result<&str, ConfigError> {
        required(&self.pod_name, "POD_NAME")
    }

    pub fn pod_namespace(&self) -> Result<&str, ConfigError> {
        required(&self.pod_namespace, "POD_NAMESPACE")
    }

    /// CPU and memory limits, failing with `MissingLimit` when either is unset.
    pub fn limits(&self) -> Result<ResourceLimits, ConfigError> {
        Ok(ResourceLimits {
            cpus: limit(&self.cpu_limit, "CPU_LIMIT")?,
            memory_mib: limit(&self.memory_limit, "MEMORY_LIMIT")?,
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnv(name)),
    }
}

fn limit(value: &Option<String>, name: &'static str) -> Result<i64, ConfigError> {
    let raw = match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Err(ConfigError::MissingLimit(name)),
    };
    raw.parse().map_err(|_| ConfigError::InvalidLimit {
        name,
        value: raw.to_string(),
    })
}
