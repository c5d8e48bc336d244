//! Actors: the units of reconciliation work.
//!
//! Each actor owns one long-running operation (version checking, deploying,
//! rolling updates, decommission, PVC management). Actors are resumable: an
//! invocation inspects the live state, performs at most one durable step, and
//! either completes, skips, or asks to be called again. The director runs
//! them in a fixed order and stops at the first one that made progress, so a
//! crashed operator picks up exactly where it left off.

pub mod cluster_restart;
pub mod decommission;
pub mod deploy;
pub mod generate_cert;
pub mod partitioned_update;
pub mod prune_pvc;
pub mod resize_pvc;
pub mod version_check;

use tracing::{info, warn};

use crate::cluster::{self, Cluster};
use crate::controller::{Context, Error, Result};
use crate::crd::{ActionType, CrdbClusterStatus};

/// Outcome of a single actor invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Nothing for this actor to do; the director moves on.
    Skipped,
    /// The actor finished its operation (or a durable step of it) and the
    /// director should stop this pass.
    Completed,
}

async fn dispatch(
    action: ActionType,
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    match action {
        ActionType::VersionCheck => version_check::act(ctx, cluster, status).await,
        ActionType::ClusterRestart => cluster_restart::act(ctx, cluster, status).await,
        ActionType::Deploy => deploy::act(ctx, cluster, status).await,
        ActionType::PartitionedUpdate => partitioned_update::act(ctx, cluster, status).await,
        ActionType::Decommission => decommission::act(ctx, cluster, status).await,
        ActionType::ResizePVC => resize_pvc::act(ctx, cluster, status).await,
        ActionType::PrunePVC => prune_pvc::act(ctx, cluster, status).await,
        // GenerateCert runs as a subroutine of Deploy; Unknown never runs.
        ActionType::GenerateCert | ActionType::Unknown => Ok(Outcome::Skipped),
    }
}

/// Run the actors in order until one makes progress.
///
/// Returns the action that completed, or None when the cluster is already in
/// its desired state. Waiting states surface as `Error::NotReady` so the
/// reconciler requeues quickly without recording a failure.
pub async fn run(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Option<ActionType>> {
    for action in ActionType::ORDERED {
        match dispatch(action, ctx, cluster, status).await {
            Ok(Outcome::Skipped) => continue,
            Ok(Outcome::Completed) => {
                info!(action = %action, "actor completed");
                cluster::record_action(status, action, None);
                return Ok(Some(action));
            }
            Err(e @ Error::NotReady(_)) => {
                // In-progress work; no failure to record.
                return Err(e);
            }
            Err(e) => {
                warn!(action = %action, error = %e, "actor failed");
                cluster::record_action(status, action, Some(&e.to_string()));
                return Err(e);
            }
        }
    }
    Ok(None)
}
