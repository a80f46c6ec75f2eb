//! Controller module for cassandra-operator.
//!
//! Contains the Cluster reconciliation loop, the sync steps it runs against a
//! [`backend::ClusterBackend`], status computation, error handling and the
//! retry schedule.

pub mod backend;
pub mod backoff;
pub mod cluster_reconciler;
pub mod cluster_sync;
pub mod context;
pub mod error;
pub mod kube_backend;
pub mod status;
