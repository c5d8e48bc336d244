//! Decommission actor.
//!
//! Scales the cluster in one node at a time. The highest-ordinal node is
//! decommissioned through the CockroachDB CLI, its replica drain is watched
//! for progress, and only once the node holds zero replicas is the
//! StatefulSet replica count lowered. A drain that stops making progress is
//! reported as a failure rather than left spinning.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{info, warn};

use super::Outcome;
use crate::cluster::{
    self, Cluster, DRAIN_CHECKED_AT_ANNOTATION, DRAIN_REPLICAS_ANNOTATION,
};
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbCluster, CrdbClusterStatus};
use crate::db::exec::{cockroach_cmd, exec_in_pod};
use crate::db::node_status::{find_node_by_host, parse_node_statuses};
use crate::features::{self, Feature};
use crate::resources::statefulset::DB_CONTAINER_NAME;

/// How long the blocking `node decommission --wait=all` call is given before
/// the actor backs off and polls drain progress instead. The drain keeps
/// running server-side after the exec is dropped.
const DECOMMISSION_EXEC_TIMEOUT_SECS: u64 = 60;

/// A drain whose replica count has not moved for this long is stalled.
const DRAIN_STALL_TIMEOUT_SECS: i64 = 600;

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    if !features::enabled(Feature::UseDecommission) {
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
    let live = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let desired = cluster.desired_nodes();

    if desired >= live {
        // Decommission=False marks an in-flight scale-in; seeing it here
        // means the previous pass shrank the statefulset and the scale-in
        // is done. Decommission=True is the completed state.
        if cluster.condition(ClusterConditionType::Decommission) == ConditionStatus::False {
            mark_scale_in_finished(status, desired);
            clear_drain_annotations(ctx, cluster).await?;
            ctx.publish_normal_event(
                cluster.cr(),
                "DecommissionFinished",
                "Decommission",
                Some(format!("cluster scaled in to {desired} nodes")),
            )
            .await;
            return Ok(Outcome::Completed);
        }
        return Ok(Outcome::Skipped);
    }

    mark_scale_in_progress(status, live, desired);

    decommission_highest_node(ctx, cluster, &statefulsets, live).await
}

fn mark_scale_in_progress(status: &mut CrdbClusterStatus, live: i32, desired: i32) {
    cluster::set_condition(
        status,
        ClusterConditionType::Decommission,
        ConditionStatus::False,
        "ScaleInProgress",
        &format!("scaling in from {live} to {desired} nodes"),
    );
}

fn mark_scale_in_finished(status: &mut CrdbClusterStatus, desired: i32) {
    cluster::set_condition(
        status,
        ClusterConditionType::Decommission,
        ConditionStatus::True,
        "ScaleInFinished",
        &format!("cluster scaled in to {desired} nodes"),
    );
}

/// Drive the decommission of ordinal `live - 1` forward by one step.
async fn decommission_highest_node(
    ctx: &Context,
    cluster: &Cluster,
    statefulsets: &Api<StatefulSet>,
    live: i32,
) -> Result<Outcome> {
    let ns = cluster.namespace()?;
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let exec_pod = cluster.pod_name(0)?;
    let target_fqdn = cluster.pod_fqdn(live - 1)?;

    let output = exec_in_pod(
        &pods,
        &exec_pod,
        DB_CONTAINER_NAME,
        cockroach_cmd(
            cluster.secure(),
            &["node", "status", "--decommission", "--format=csv"],
        ),
    )
    .await?;
    let statuses = parse_node_statuses(&output.stdout)?;
    let node = find_node_by_host(&statuses, &target_fqdn).ok_or_else(|| {
        Error::NotReady(format!("node at {target_fqdn} is not in the cluster yet"))
    })?;

    if node.drained() && node.is_decommissioning {
        info!(node_id = node.node_id, "node drained; lowering replica count");
        let patch = json!({ "spec": { "replicas": live - 1 } });
        statefulsets
            .patch(
                &cluster.statefulset_name()?,
                &PatchParams::default(),
                &Patch::Merge(patch),
            )
            .await?;
        clear_drain_annotations(ctx, cluster).await?;
        // Further ordinals, if any, are handled on the next pass.
        return Err(Error::NotReady(format!(
            "statefulset scaled to {} replicas",
            live - 1
        )));
    }

    if !node.is_decommissioning {
        start_decommission(ctx, cluster, &pods, &exec_pod, node.node_id).await?;
        return Err(Error::NotReady(format!(
            "decommission of node {} started",
            node.node_id
        )));
    }

    check_drain_progress(ctx, cluster, node.replicas).await?;
    Err(Error::NotReady(format!(
        "node {} still holds {} replicas",
        node.node_id, node.replicas
    )))
}

async fn start_decommission(
    ctx: &Context,
    cluster: &Cluster,
    pods: &Api<Pod>,
    exec_pod: &str,
    node_id: u64,
) -> Result<()> {
    info!(node_id = node_id, "starting node decommission");
    ctx.publish_normal_event(
        cluster.cr(),
        "DecommissionStarted",
        "Decommission",
        Some(format!("decommissioning node {node_id}")),
    )
    .await;

    let id = node_id.to_string();
    let command = cockroach_cmd(
        cluster.secure(),
        &["node", "decommission", &id, "--wait=all"],
    );
    // The CLI blocks until the drain completes. Cap the exec and fall back
    // to polling; the server keeps draining either way.
    let exec = exec_in_pod(pods, exec_pod, DB_CONTAINER_NAME, command);
    match tokio::time::timeout(
        std::time::Duration::from_secs(DECOMMISSION_EXEC_TIMEOUT_SECS),
        exec,
    )
    .await
    {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            warn!(node_id = node_id, "decommission exec timed out; polling drain progress");
        }
    }
    Ok(())
}

/// Compare the current replica count against the last observed one, recorded
/// as annotations on the custom resource. An unchanged count past the stall
/// timeout fails the scale-in.
async fn check_drain_progress(ctx: &Context, cluster: &Cluster, replicas: u64) -> Result<()> {
    let last_replicas = cluster
        .annotation(DRAIN_REPLICAS_ANNOTATION)
        .and_then(|v| v.parse::<u64>().ok());
    let last_checked = cluster
        .annotation(DRAIN_CHECKED_AT_ANNOTATION)
        .and_then(|v| v.parse::<jiff::Timestamp>().ok());

    if let (Some(last), Some(checked_at)) = (last_replicas, last_checked) {
        if replicas >= last {
            let stalled_secs = jiff::Timestamp::now().duration_since(checked_at).as_secs();
            if stalled_secs > DRAIN_STALL_TIMEOUT_SECS {
                return Err(Error::Permanent(format!(
                    "node drain stalled at {replicas} replicas; \
                     check cluster capacity before retrying the scale-in"
                )));
            }
            // Still within the stall window; keep the original checkpoint.
            return Ok(());
        }
    }

    record_drain_checkpoint(ctx, cluster, replicas).await
}

async fn record_drain_checkpoint(ctx: &Context, cluster: &Cluster, replicas: u64) -> Result<()> {
    let clusters: Api<CrdbCluster> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let patch = json!({
        "metadata": {
            "annotations": {
                DRAIN_REPLICAS_ANNOTATION: replicas.to_string(),
                DRAIN_CHECKED_AT_ANNOTATION: jiff::Timestamp::now().to_string(),
            }
        }
    });
    clusters
        .patch(cluster.name()?, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

async fn clear_drain_annotations(ctx: &Context, cluster: &Cluster) -> Result<()> {
    if cluster.annotation(DRAIN_REPLICAS_ANNOTATION).is_none()
        && cluster.annotation(DRAIN_CHECKED_AT_ANNOTATION).is_none()
    {
        return Ok(());
    }
    let clusters: Api<CrdbCluster> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let patch = json!({
        "metadata": {
            "annotations": {
                DRAIN_REPLICAS_ANNOTATION: null,
                DRAIN_CHECKED_AT_ANNOTATION: null,
            }
        }
    });
    clusters
        .patch(cluster.name()?, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decommission_condition(status: &CrdbClusterStatus) -> (ConditionStatus, String) {
        status
            .conditions
            .iter()
            .find(|c| c.r#type == ClusterConditionType::Decommission)
            .map(|c| (c.status, c.reason.clone()))
            .unwrap_or((ConditionStatus::Unknown, String::new()))
    }

    #[test]
    fn test_decommission_is_false_while_scaling_in() {
        let mut status = CrdbClusterStatus::default();
        mark_scale_in_progress(&mut status, 5, 3);
        let (state, reason) = decommission_condition(&status);
        assert_eq!(state, ConditionStatus::False);
        assert_eq!(reason, "ScaleInProgress");
    }

    #[test]
    fn test_decommission_is_true_once_scale_in_completes() {
        let mut status = CrdbClusterStatus::default();
        mark_scale_in_progress(&mut status, 5, 3);
        mark_scale_in_finished(&mut status, 3);
        // True is the terminal state a finished scale-down leaves behind;
        // the pruner and anything else reading the condition key off it.
        let (state, reason) = decommission_condition(&status);
        assert_eq!(state, ConditionStatus::True);
        assert_eq!(reason, "ScaleInFinished");
    }
}
