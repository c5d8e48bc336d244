//! PVC prune actor.
//!
//! StatefulSets leave the volume claims of scaled-away pods behind. When the
//! gate is on and the cluster is at its desired size, claims whose ordinal is
//! at or above the replica count are deleted so a later scale-out starts from
//! empty disks instead of stale ones.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, ListParams};
use tracing::info;

use super::Outcome;
use crate::cluster::Cluster;
use crate::controller::{Context, Result};
use crate::crd::CrdbClusterStatus;
use crate::features::{self, Feature};
use crate::resources::statefulset::DATA_VOLUME_NAME;

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    _status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    if !features::enabled(Feature::AutoPrunePVC) {
        return Ok(Outcome::Skipped);
    }

    let ns = cluster.namespace()?;
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let Some(sts) = statefulsets.get_opt(&cluster.statefulset_name()?).await? else {
        return Ok(Outcome::Skipped);
    };

    // Only prune when the statefulset has settled at the desired size.
    let desired = cluster.desired_nodes();
    let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let ready_replicas = sts.status.as_ref().map(|s| s.replicas).unwrap_or(0);
    if spec_replicas != desired || ready_replicas != desired {
        return Ok(Outcome::Skipped);
    }

    let prefix = format!("{}-{}-", DATA_VOLUME_NAME, cluster.statefulset_name()?);
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    let list = claims.list(&ListParams::default()).await?;

    let mut deleted = 0;
    for claim in &list.items {
        let Some(name) = claim.metadata.name.as_deref() else {
            continue;
        };
        let Some(ordinal) = claim_ordinal(name, &prefix) else {
            continue;
        };
        if ordinal < desired {
            continue;
        }
        info!(pvc = name, "pruning orphaned volume claim");
        claims.delete(name, &DeleteParams::default()).await?;
        deleted += 1;
    }

    if deleted > 0 {
        ctx.publish_normal_event(
            cluster.cr(),
            "PVCPruned",
            "PrunePVC",
            Some(format!("deleted {deleted} orphaned volume claims")),
        )
        .await;
        return Ok(Outcome::Completed);
    }
    Ok(Outcome::Skipped)
}

/// Ordinal of a claim named `<volume>-<statefulset>-<n>`, or None when the
/// name belongs to something else.
fn claim_ordinal(name: &str, prefix: &str) -> Option<i32> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_ordinal_parses_suffix() {
        assert_eq!(claim_ordinal("datadir-crdb-3", "datadir-crdb-"), Some(3));
        assert_eq!(claim_ordinal("datadir-crdb-0", "datadir-crdb-"), Some(0));
    }

    #[test]
    fn test_claim_ordinal_rejects_other_claims() {
        assert_eq!(claim_ordinal("datadir-other-1", "datadir-crdb-"), None);
        assert_eq!(claim_ordinal("datadir-crdb-extra", "datadir-crdb-"), None);
    }
}
