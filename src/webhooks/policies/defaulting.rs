//! Defaulting for the mutating webhook.
//!
//! Serde defaults already materialize when the raw admission object is
//! deserialized into a `CrdbCluster`; this module adds the few defaults that
//! depend on other fields, then the server diffs the result against the raw
//! object to produce the JSON patch.

use crate::crd::{CrdbCluster, DataStoreSpec, EmptyDirSpec};
use crate::version;

/// Fill in defaults the schema alone cannot express.
pub fn apply_defaults(cluster: &mut CrdbCluster) {
    let spec = &mut cluster.spec;

    // Neither an image nor a version: fall back to the operator default so
    // the validating policy has something concrete to check.
    if spec.image.name.is_empty() && spec.cockroach_db_version.is_empty() {
        spec.cockroach_db_version = version::DEFAULT_VERSION.to_string();
    }

    // No data store at all means an ephemeral cluster.
    if spec.data_store.volume_claim.is_none() && spec.data_store.empty_dir.is_none() {
        spec.data_store = DataStoreSpec {
            volume_claim: None,
            empty_dir: Some(EmptyDirSpec::default()),
        };
    }
}
