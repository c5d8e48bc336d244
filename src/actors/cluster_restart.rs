//! Cluster-restart actor.
//!
//! Restarts a running cluster on request. The request is an annotation on
//! the custom resource: `crdb.io/restarttype: Rolling` bounces pods one at a
//! time through a pod template change, `crdb.io/restarttype: Fullcluster`
//! scales the StatefulSet to zero and back so every node reloads its
//! certificates at once. The annotation is removed when the restart is done.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::info;

use super::partitioned_update::statefulset_is_updating;
use super::Outcome;
use crate::cluster::{self, Cluster, RESTART_AT_ANNOTATION, RESTART_TYPE_ANNOTATION};
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbCluster, CrdbClusterStatus};

/// Supported restart kinds, matching the annotation values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartType {
    Rolling,
    FullCluster,
}

/// Parse the `crdb.io/restarttype` annotation value.
pub fn parse_restart_type(value: &str) -> Result<RestartType> {
    match value {
        "Rolling" => Ok(RestartType::Rolling),
        "Fullcluster" => Ok(RestartType::FullCluster),
        other => Err(Error::Validation(format!(
            "unknown restart type {other:?}; expected \"Rolling\" or \"Fullcluster\""
        ))),
    }
}

/// Whether the StatefulSet controller has finished rolling and every pod is
/// ready again.
pub fn restart_rollout_complete(sts: &StatefulSet, desired: i32) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    if statefulset_is_updating(sts) {
        return false;
    }
    status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
}

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    if !crate::features::enabled(crate::features::Feature::ClusterRestart) {
        return Ok(Outcome::Skipped);
    }
    let Some(requested) = cluster.annotation(RESTART_TYPE_ANNOTATION) else {
        return Ok(Outcome::Skipped);
    };
    let restart_type = parse_restart_type(requested)?;
    if !cluster.condition_true(ClusterConditionType::Initialized) {
        return Ok(Outcome::Skipped);
    }

    let ns = cluster.namespace()?;
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let Some(sts) = statefulsets.get_opt(&cluster.statefulset_name()?).await? else {
        return Ok(Outcome::Skipped);
    };

    let in_flight = cluster.condition_true(ClusterConditionType::ClusterRestart)
        && template_restart_stamp(&sts).is_some();

    if !in_flight {
        if statefulset_is_updating(&sts) {
            return Err(Error::NotReady(
                "statefulset has an update in flight; restart waits".to_string(),
            ));
        }
        start_restart(ctx, cluster, status, &statefulsets, restart_type).await?;
        return Err(Error::NotReady("cluster restart started".to_string()));
    }

    resume_restart(ctx, cluster, status, &statefulsets, &sts, restart_type).await
}

fn template_restart_stamp(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(RESTART_AT_ANNOTATION))
        .map(String::as_str)
}

async fn start_restart(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
    statefulsets: &Api<StatefulSet>,
    restart_type: RestartType,
) -> Result<()> {
    let now = jiff::Timestamp::now().to_string();
    let patch = match restart_type {
        // A fresh template annotation makes a new revision; the StatefulSet
        // controller rolls it out pod by pod.
        RestartType::Rolling => json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { RESTART_AT_ANNOTATION: &now }
                    }
                }
            }
        }),
        RestartType::FullCluster => json!({
            "spec": {
                "replicas": 0,
                "template": {
                    "metadata": {
                        "annotations": { RESTART_AT_ANNOTATION: &now }
                    }
                }
            }
        }),
    };
    statefulsets
        .patch(
            &cluster.statefulset_name()?,
            &PatchParams::default(),
            &Patch::Merge(patch),
        )
        .await?;

    cluster::set_condition(
        status,
        ClusterConditionType::ClusterRestart,
        ConditionStatus::True,
        "RestartStarted",
        &format!("{restart_type:?} restart in progress"),
    );
    info!(restart = ?restart_type, "cluster restart started");
    ctx.publish_normal_event(
        cluster.cr(),
        "RestartStarted",
        "ClusterRestart",
        Some(format!("{restart_type:?} restart started")),
    )
    .await;
    Ok(())
}

async fn resume_restart(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
    statefulsets: &Api<StatefulSet>,
    sts: &StatefulSet,
    restart_type: RestartType,
) -> Result<Outcome> {
    let desired = cluster.desired_nodes();
    let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);

    if restart_type == RestartType::FullCluster && spec_replicas == 0 {
        let down = sts.status.as_ref().map(|s| s.replicas).unwrap_or(0) == 0;
        if !down {
            return Err(Error::NotReady("waiting for all pods to stop".to_string()));
        }
        statefulsets
            .patch(
                &cluster.statefulset_name()?,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "replicas": desired } })),
            )
            .await?;
        return Err(Error::NotReady("scaling cluster back up".to_string()));
    }

    if !restart_rollout_complete(sts, desired) {
        return Err(Error::NotReady("restart rollout in progress".to_string()));
    }

    finish_restart(ctx, cluster, status).await?;
    Ok(Outcome::Completed)
}

async fn finish_restart(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<()> {
    let clusters: Api<CrdbCluster> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let patch = json!({
        "metadata": {
            "annotations": { RESTART_TYPE_ANNOTATION: null }
        }
    });
    clusters
        .patch(cluster.name()?, &PatchParams::default(), &Patch::Merge(patch))
        .await?;

    cluster::set_condition(
        status,
        ClusterConditionType::ClusterRestart,
        ConditionStatus::False,
        "RestartFinished",
        "all pods restarted",
    );
    info!("cluster restart finished");
    ctx.publish_normal_event(
        cluster.cr(),
        "RestartFinished",
        "ClusterRestart",
        Some("all pods restarted".to_string()),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sts(updated: i32, ready: i32, current_rev: &str, update_rev: &str) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(2),
                replicas: 3,
                updated_replicas: Some(updated),
                ready_replicas: Some(ready),
                current_revision: Some(current_rev.to_string()),
                update_revision: Some(update_rev.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_restart_type() {
        assert_eq!(parse_restart_type("Rolling").unwrap(), RestartType::Rolling);
        assert_eq!(
            parse_restart_type("Fullcluster").unwrap(),
            RestartType::FullCluster
        );
        assert!(parse_restart_type("rolling").is_err());
        assert!(parse_restart_type("").is_err());
    }

    #[test]
    fn test_rollout_complete_when_all_pods_on_new_revision() {
        assert!(restart_rollout_complete(&sts(3, 3, "b", "b"), 3));
    }

    #[test]
    fn test_rollout_incomplete_while_revisions_differ() {
        assert!(!restart_rollout_complete(&sts(1, 3, "a", "b"), 3));
    }

    #[test]
    fn test_rollout_incomplete_until_pods_ready() {
        assert!(!restart_rollout_complete(&sts(3, 2, "b", "b"), 3));
    }
}
