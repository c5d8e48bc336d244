//! Reconciliation loop for CrdbCluster.
//!
//! Each pass seeds the status conditions, lets the actor director make at
//! most one unit of progress, rolls the results up into the cluster status,
//! and patches the status subresource. Owned objects are garbage-collected
//! through owner references, so no finalizer is needed; TLS secrets are
//! deliberately left behind for a recreated cluster to pick up.

use std::sync::Arc;
use std::time::Instant;

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::{
    actors,
    cluster::{self, Cluster},
    controller::{context::Context, error::Error},
    crd::{ClusterStatus, CrdbCluster},
    resources::FIELD_MANAGER,
};

/// How long a settled cluster waits between routine passes.
const STEADY_STATE_REQUEUE_SECS: u64 = 300;

/// Reconcile a CrdbCluster.
pub async fn reconcile(obj: Arc<CrdbCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let cluster = Cluster::new(obj.clone());
    let name = obj.name_any();
    let namespace = cluster.namespace()?.to_string();

    debug!(name = %name, namespace = %namespace, "reconciling CrdbCluster");

    if obj.metadata.deletion_timestamp.is_some() {
        // Owner references tear everything down; certificates stay.
        info!(name = %name, "cluster deleted; owned objects are garbage collected");
        return Ok(Action::await_change());
    }

    let mut status = obj.status.clone().unwrap_or_default();
    cluster::seed_conditions(&mut status);

    let outcome = actors::run(&ctx, &cluster, &mut status).await;

    let action = match &outcome {
        Ok(Some(action_type)) => {
            info!(name = %name, action = %action_type, "actor completed");
            // More work may be applicable right away.
            Action::requeue(std::time::Duration::from_secs(1))
        }
        Ok(None) => Action::requeue(std::time::Duration::from_secs(STEADY_STATE_REQUEUE_SECS)),
        Err(Error::NotReady(reason)) => {
            debug!(name = %name, reason = %reason, "waiting for in-progress work");
            Action::requeue(Error::NotReady(reason.clone()).requeue_after())
        }
        Err(e) => {
            warn!(name = %name, error = %e, "actor failed");
            ctx.publish_warning_event(
                &obj,
                "ReconcileFailed",
                "Reconcile",
                Some(e.to_string()),
            )
            .await;
            Action::requeue(e.requeue_after())
        }
    };

    cluster::summarize_status(&mut status);
    status.observed_generation = obj.metadata.generation;
    patch_status(&ctx, &namespace, &name, &status).await?;

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        health_state.metrics.set_cluster_nodes(
            &namespace,
            &name,
            i64::from(cluster.desired_nodes()),
        );
        match &outcome {
            Ok(Some(action_type)) => {
                health_state
                    .metrics
                    .record_action(&action_type.to_string(), "Finished");
            }
            Err(e) if !matches!(e, Error::NotReady(_)) => {
                health_state.metrics.record_error(&namespace, &name);
            }
            _ => {}
        }
    }

    // A failed actor is recorded in status but still surfaces as an error so
    // the controller backs off.
    match outcome {
        Err(e) if !matches!(e, Error::NotReady(_)) => Err(e),
        _ => Ok(action),
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<CrdbCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "cluster not found, likely deleted");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "retryable error");
    } else {
        error!(name = %name, error = %error, "reconcile failed");
    }
    Action::requeue(error.requeue_after())
}

async fn patch_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &crate::crd::CrdbClusterStatus,
) -> Result<(), Error> {
    let api: Api<CrdbCluster> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// True once the cluster has converged and is serving.
#[allow(dead_code)]
pub fn is_running(status: &crate::crd::CrdbClusterStatus) -> bool {
    status.cluster_status == ClusterStatus::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActionType, ClusterAction, CrdbClusterStatus};

    #[test]
    fn test_summarized_status_reports_failed_actions() {
        let mut status = CrdbClusterStatus::default();
        cluster::seed_conditions(&mut status);
        cluster::record_action(
            &mut status,
            ActionType::VersionCheck,
            Some("image not found"),
        );
        cluster::summarize_status(&mut status);
        assert_eq!(status.cluster_status, ClusterStatus::Failed);
        assert!(status
            .operator_actions
            .iter()
            .any(|a: &ClusterAction| a.r#type == ActionType::VersionCheck));
    }

    #[test]
    fn test_fresh_cluster_is_starting() {
        let mut status = CrdbClusterStatus::default();
        cluster::seed_conditions(&mut status);
        cluster::summarize_status(&mut status);
        assert_eq!(status.cluster_status, ClusterStatus::Starting);
        assert!(!is_running(&status));
    }
}
