//! Custom Resource Definitions (CRDs) for cockroach-operator.
//!
//! - `CrdbCluster`: Deploy and manage a CockroachDB cluster

mod crdb_cluster;

pub use crdb_cluster::*;
