//! Custom Resource Definitions for cassandra-operator.
//!
//! - `Cluster`: a Cassandra or Scylla datacenter made of racks

mod cassandra_cluster;

pub use cassandra_cluster::*;
