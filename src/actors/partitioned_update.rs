//! Partitioned-update actor.
//!
//! Rolls a validated image change through the StatefulSet one pod at a time
//! using the RollingUpdate partition, from the highest ordinal down. Before
//! each step the previous pod must be running the new revision, be ready,
//! and the cluster must report zero underreplicated ranges. Major-version
//! rollouts pin `cluster.preserve_downgrade_option` first so a half-upgraded
//! cluster can still roll back.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info};

use super::Outcome;
use crate::cluster::{
    self, Cluster, CONTAINER_IMAGE_ANNOTATION, VERSION_ANNOTATION,
};
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbClusterStatus};
use crate::db::sql::{DbClient, PRESERVE_DOWNGRADE_SETTING};
use crate::features::{self, Feature};
use crate::resources::statefulset::DB_CONTAINER_NAME;
use crate::version;

/// A pod that has not become ready this long after starting fails the
/// rollout instead of wedging it forever.
const POD_UPDATE_TIMEOUT_SECS: i64 = 180;

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    if !features::enabled(Feature::PartitionedUpdate) {
        return Ok(Outcome::Skipped);
    }
    if !cluster.condition_true(ClusterConditionType::Initialized) {
        return Ok(Outcome::Skipped);
    }

    let ns = cluster.namespace()?;
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let Some(sts) = statefulsets.get_opt(&cluster.statefulset_name()?).await? else {
        return Ok(Outcome::Skipped);
    };

    // Single-node clusters have no quorum to protect; Deploy applies the
    // image change as a plain statefulset update instead.
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if !handles_replica_count(replicas) {
        return Ok(Outcome::Skipped);
    }

    let Some(target_image) = cluster.running_image() else {
        return Ok(Outcome::Skipped);
    };
    let sts_image = container_image(&sts);
    let restarting = cluster.condition_true(ClusterConditionType::ClusterRestart);

    if sts_image.as_deref() == Some(target_image) && !restarting {
        return Ok(Outcome::Skipped);
    }

    if !restarting {
        // Refuse to start on top of an unrelated rollout.
        if statefulset_is_updating(&sts) {
            return Err(Error::NotReady(
                "statefulset has an update in flight".to_string(),
            ));
        }
        start_rollout(ctx, cluster, status, &sts, target_image).await?;
        return Err(Error::NotReady("rolling update started".to_string()));
    }

    resume_rollout(ctx, cluster, status, &sts).await
}

/// The partitioned machinery only makes sense with at least two pods.
pub fn handles_replica_count(replicas: i32) -> bool {
    replicas >= 2
}

/// Whether the StatefulSet controller is still acting on a previous change.
pub fn statefulset_is_updating(sts: &StatefulSet) -> bool {
    let Some(sts_status) = sts.status.as_ref() else {
        return false;
    };
    if sts_status.observed_generation.unwrap_or(0) == 0 {
        return false;
    }
    if sts_status.current_revision != sts_status.update_revision {
        return true;
    }
    let generation = sts.metadata.generation.unwrap_or(0);
    let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    generation > sts_status.observed_generation.unwrap_or(0)
        && spec_replicas == sts_status.replicas
}

fn container_image(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == DB_CONTAINER_NAME))
        .and_then(|c| c.image.clone())
}

fn sts_annotation<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Whether the rollout crosses a release train, judged from the version the
/// StatefulSet is stamped with versus the newly validated one.
fn crosses_release_train(cluster: &Cluster, sts: &StatefulSet) -> bool {
    let (Some(old), Some(new)) = (
        sts_annotation(sts, VERSION_ANNOTATION),
        cluster.running_version(),
    ) else {
        return false;
    };
    match (version::parse_version(old), version::parse_version(new)) {
        (Ok(from), Ok(to)) => version::is_major_change(&from, &to),
        _ => false,
    }
}

async fn start_rollout(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
    sts: &StatefulSet,
    target_image: &str,
) -> Result<()> {
    let ns = cluster.namespace()?;
    let name = cluster.statefulset_name()?;
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);

    if crosses_release_train(cluster, sts) {
        pin_downgrade_option(ctx, cluster, sts).await?;
    }

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({
        "metadata": {
            "annotations": { CONTAINER_IMAGE_ANNOTATION: target_image }
        },
        "spec": {
            "updateStrategy": {
                "type": "RollingUpdate",
                "rollingUpdate": { "partition": replicas }
            },
            "template": {
                "spec": {
                    "containers": [{ "name": DB_CONTAINER_NAME, "image": target_image }]
                }
            }
        }
    });
    statefulsets
        .patch(&name, &PatchParams::default(), &Patch::Strategic(patch))
        .await?;

    cluster::set_condition(
        status,
        ClusterConditionType::ClusterRestart,
        ConditionStatus::True,
        "RollingUpdate",
        &format!("rolling to image {target_image}"),
    );
    info!(statefulset = %name, image = %target_image, "partitioned update started");
    ctx.publish_normal_event(
        cluster.cr(),
        "RollingUpdateStarted",
        "PartitionedUpdate",
        Some(format!("rolling to image {target_image}")),
    )
    .await;
    Ok(())
}

/// Pin the downgrade option to the currently running major.minor so the
/// cluster does not auto-finalize mid-rollout.
async fn pin_downgrade_option(ctx: &Context, cluster: &Cluster, sts: &StatefulSet) -> Result<()> {
    let old = sts_annotation(sts, VERSION_ANNOTATION)
        .ok_or_else(|| Error::NotReady("statefulset has no version annotation".to_string()))?;
    let parsed = version::parse_version(old)?;
    let pin = version::major_minor(&parsed);

    let db = DbClient::connect(ctx.client.clone(), cluster).await?;
    let current = db.show_cluster_setting(PRESERVE_DOWNGRADE_SETTING).await?;
    if current != pin {
        db.set_cluster_setting(PRESERVE_DOWNGRADE_SETTING, &pin).await?;
        info!(pin = %pin, "preserve_downgrade_option set before major upgrade");
    }
    Ok(())
}

async fn resume_rollout(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
    sts: &StatefulSet,
) -> Result<Outcome> {
    let ns = cluster.namespace()?;
    let name = cluster.statefulset_name()?;
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let partition = sts
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(replicas);

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);

    if partition >= replicas {
        // Nothing updated yet; release the highest ordinal.
        set_partition(&statefulsets, &name, replicas - 1).await?;
        return Err(Error::NotReady(format!(
            "updating pod {}",
            replicas - 1
        )));
    }

    // The most recently released ordinal must settle before the next one.
    verify_pod_updated(ctx, cluster, sts, partition).await?;
    verify_quorum(ctx, cluster).await?;

    if partition > 0 {
        set_partition(&statefulsets, &name, partition - 1).await?;
        return Err(Error::NotReady(format!("updating pod {}", partition - 1)));
    }

    finalize_rollout(ctx, cluster, status, sts).await?;
    Ok(Outcome::Completed)
}

async fn set_partition(api: &Api<StatefulSet>, name: &str, partition: i32) -> Result<()> {
    debug!(statefulset = name, partition = partition, "advancing update partition");
    let patch = json!({
        "spec": { "updateStrategy": { "rollingUpdate": { "partition": partition } } }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Verify the pod at an ordinal runs the updated revision and is ready.
async fn verify_pod_updated(
    ctx: &Context,
    cluster: &Cluster,
    sts: &StatefulSet,
    ordinal: i32,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let pod_name = cluster.pod_name(ordinal)?;
    let pod = pods
        .get_opt(&pod_name)
        .await?
        .ok_or_else(|| Error::NotReady(format!("pod {pod_name} is being replaced")))?;

    let update_revision = sts
        .status
        .as_ref()
        .and_then(|s| s.update_revision.as_deref())
        .unwrap_or_default();
    let pod_revision = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get("controller-revision-hash"))
        .map(String::as_str)
        .unwrap_or_default();
    if pod_revision != update_revision {
        return Err(Error::NotReady(format!(
            "pod {pod_name} still runs the old revision"
        )));
    }

    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if ready {
        return Ok(());
    }

    let stuck_secs = pod
        .status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .and_then(|t| jiff::Timestamp::from_second(t.0.timestamp()).ok())
        .map(|started| jiff::Timestamp::now().duration_since(started).as_secs())
        .unwrap_or(0);
    if stuck_secs > POD_UPDATE_TIMEOUT_SECS {
        return Err(Error::Transient(format!(
            "pod {pod_name} has not become ready within the update timeout"
        )));
    }
    Err(Error::NotReady(format!("pod {pod_name} is not ready yet")))
}

/// A pod restart is only safe while every range has its full complement of
/// replicas.
async fn verify_quorum(ctx: &Context, cluster: &Cluster) -> Result<()> {
    let db = DbClient::connect(ctx.client.clone(), cluster).await?;
    let underreplicated = db.underreplicated_ranges().await?;
    if underreplicated > 0 {
        return Err(Error::NotReady(format!(
            "{underreplicated} ranges are underreplicated"
        )));
    }
    Ok(())
}

async fn finalize_rollout(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
    sts: &StatefulSet,
) -> Result<()> {
    let ns = cluster.namespace()?;
    let name = cluster.statefulset_name()?;
    let new_version = cluster.running_version().unwrap_or_default().to_string();

    // Crossing a release train is finalized by releasing the downgrade pin.
    if crosses_release_train(cluster, sts) {
        let db = DbClient::connect(ctx.client.clone(), cluster).await?;
        let pinned = db.show_cluster_setting(PRESERVE_DOWNGRADE_SETTING).await?;
        if !pinned.is_empty() {
            db.reset_cluster_setting(PRESERVE_DOWNGRADE_SETTING).await?;
            info!("preserve_downgrade_option reset; upgrade will finalize");
        }
    }

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({
        "metadata": { "annotations": { VERSION_ANNOTATION: new_version } }
    });
    statefulsets
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;

    status.version = new_version.clone();
    if let Some(image) = cluster.running_image() {
        status.crdb_container_image = image.to_string();
    }
    cluster::set_condition(
        status,
        ClusterConditionType::ClusterRestart,
        ConditionStatus::False,
        "RollingUpdateFinished",
        "",
    );
    info!(statefulset = %name, version = %new_version, "partitioned update finished");
    ctx.publish_normal_event(
        cluster.cr(),
        "RollingUpdateFinished",
        "PartitionedUpdate",
        Some(format!("cluster is running {new_version}")),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sts(
        generation: i64,
        observed: i64,
        current_rev: &str,
        update_rev: &str,
        spec_replicas: i32,
        status_replicas: i32,
    ) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(spec_replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(observed),
                current_revision: Some(current_rev.to_string()),
                update_revision: Some(update_rev.to_string()),
                replicas: status_replicas,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_never_observed_is_not_updating() {
        assert!(!statefulset_is_updating(&sts(1, 0, "a", "a", 3, 3)));
    }

    #[test]
    fn test_revision_mismatch_is_updating() {
        assert!(statefulset_is_updating(&sts(2, 2, "a", "b", 3, 3)));
    }

    #[test]
    fn test_unobserved_generation_is_updating() {
        assert!(statefulset_is_updating(&sts(3, 2, "a", "a", 3, 3)));
    }

    #[test]
    fn test_settled_is_not_updating() {
        assert!(!statefulset_is_updating(&sts(2, 2, "a", "a", 3, 3)));
    }

    #[test]
    fn test_scale_in_progress_is_not_flagged_as_update() {
        // generation ahead but replica counts differ: a scale, not a rollout
        assert!(!statefulset_is_updating(&sts(3, 2, "a", "a", 5, 3)));
    }

    #[test]
    fn test_single_node_clusters_are_not_rolled_by_partition() {
        assert!(!handles_replica_count(0));
        assert!(!handles_replica_count(1));
        assert!(handles_replica_count(2));
        assert!(handles_replica_count(5));
    }
}
