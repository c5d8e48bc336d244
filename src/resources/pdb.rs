//! PodDisruptionBudget generation for CockroachDB clusters.
//!
//! Creates a PDB to maintain range quorum during voluntary disruptions
//! such as node drains or cluster upgrades.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::controller::Result;
use crate::resources::common::{owner_reference, selector_labels, standard_labels};

/// Generate a PodDisruptionBudget for a CrdbCluster.
///
/// When the spec sets neither minAvailable nor maxUnavailable the PDB
/// defaults to maxUnavailable=1, which is safe for any cluster size that
/// keeps its default 3x replication factor.
pub fn generate_pod_disruption_budget(cluster: &Cluster) -> Result<PodDisruptionBudget> {
    let cr = cluster.cr();
    let name = cluster.statefulset_name()?;
    let labels = standard_labels(cr);

    let (min_available, max_unavailable) = match (cr.spec.min_available, cr.spec.max_unavailable) {
        (Some(min), _) => (Some(IntOrString::Int(min)), None),
        (None, Some(max)) => (None, Some(IntOrString::Int(max))),
        (None, None) => (None, Some(IntOrString::Int(1))),
    };

    Ok(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cr.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available,
            max_unavailable,
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(cr)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec};
    use std::sync::Arc;

    fn test_cluster(spec: CrdbClusterSpec) -> Cluster {
        Cluster::new(Arc::new(CrdbCluster {
            metadata: ObjectMeta {
                name: Some("my-cluster".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }))
    }

    #[test]
    fn test_generate_pdb_default() {
        let pdb = generate_pod_disruption_budget(&test_cluster(CrdbClusterSpec {
            nodes: 3,
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(pdb.metadata.name, Some("my-cluster".to_string()));
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
        assert_eq!(spec.min_available, None);
    }

    #[test]
    fn test_generate_pdb_min_available() {
        let pdb = generate_pod_disruption_budget(&test_cluster(CrdbClusterSpec {
            nodes: 5,
            min_available: Some(4),
            ..Default::default()
        }))
        .unwrap();

        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(4)));
        assert_eq!(spec.max_unavailable, None);
    }

    #[test]
    fn test_generate_pdb_max_unavailable() {
        let pdb = generate_pod_disruption_budget(&test_cluster(CrdbClusterSpec {
            nodes: 5,
            max_unavailable: Some(2),
            ..Default::default()
        }))
        .unwrap();

        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(2)));
    }

    #[test]
    fn test_pdb_selector() {
        let pdb = generate_pod_disruption_budget(&test_cluster(CrdbClusterSpec {
            nodes: 3,
            ..Default::default()
        }))
        .unwrap();

        let labels = pdb.spec.unwrap().selector.unwrap().match_labels.unwrap();
        assert_eq!(
            labels.get("app.kubernetes.io/instance"),
            Some(&"my-cluster".to_string())
        );
    }
}
