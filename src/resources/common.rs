//! Common resource generation utilities.
//!
//! Labels, annotations, and owner references shared by all builders.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::CrdbCluster;

/// Standard labels applied to all managed resources
pub fn standard_labels(cluster: &CrdbCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "cockroachdb".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "cockroach-operator".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "database".to_string(),
    );

    // Merge user-defined labels
    for (key, value) in &cluster.spec.additional_labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Pod selector labels. Kept to the minimal stable subset since StatefulSet
/// selectors are immutable.
pub fn selector_labels(cluster: &CrdbCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "cockroachdb".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.name_any());
    labels
}

/// User-defined annotations from the spec.
pub fn standard_annotations(cluster: &CrdbCluster) -> BTreeMap<String, String> {
    cluster.spec.additional_annotations.clone()
}

/// Create owner reference for a CrdbCluster
pub fn owner_reference(cluster: &CrdbCluster) -> OwnerReference {
    OwnerReference {
        api_version: "crdb.cockroachlabs.com/v1alpha1".to_string(),
        kind: "CrdbCluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Merge extra entries into a map, with the extras winning.
pub fn merged(
    base: BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base;
    for (key, value) in extra {
        out.insert(key.clone(), value.clone());
    }
    out
}
