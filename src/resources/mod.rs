//! Resource generation module.
//!
//! Contains utilities for generating Kubernetes resources owned by CrdbCluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | Stable pod identity for database nodes |
//! | Discovery Service | Headless peer discovery (publishNotReadyAddresses) |
//! | Public Service | Client access endpoint for SQL and the admin UI |
//! | PodDisruptionBudget | Maintain range quorum during disruptions |
//! | ServiceAccount/Role/RoleBinding | Per-cluster pod identity |
//! | Job | One-shot container image version check |
//! | Ingress | Optional UI/SQL/gRPC exposure |

pub mod apply;
pub mod common;
pub mod ingress;
pub mod job;
pub mod pdb;
pub mod port_forward;
pub mod rbac;
pub mod services;
pub mod statefulset;

// Re-export commonly used items
pub use apply::{persist, PersistResult, FIELD_MANAGER};
pub use common::{owner_reference, standard_labels};
