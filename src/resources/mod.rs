//! Resource generation module.
//!
//! Pure constructors for the Kubernetes objects owned by a Cluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | One per rack, created at zero replicas |
//! | Headless Service | Governing service of the rack StatefulSets |
//! | Member Service | One per pod, stable broadcast address of the member |

pub mod common;
pub mod services;
pub mod statefulset;

pub use common::{owner_reference, rack_labels};
