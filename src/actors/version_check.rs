//! Version-check actor.
//!
//! Resolves the requested image, runs it once in a throwaway Job to read the
//! actual build tag out of its logs, and only then records the image as fit
//! for the StatefulSet. Catches mislabeled images, unsupported versions, and
//! unpullable references before they can touch the database pods.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use super::Outcome;
use crate::cluster::{
    self, Cluster, CONTAINER_IMAGE_ANNOTATION, VERSION_ANNOTATION,
};
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbCluster, CrdbClusterStatus};
use crate::resources::apply::FIELD_MANAGER;
use crate::resources::job::{generate_vcheck_job, parse_build_tag};
use crate::version;

/// Give a stuck image pull this long before declaring the image bad.
const IMAGE_PULL_DEADLINE_SECS: i64 = 180;

/// The image the spec asks for, before validation.
fn requested_image(cluster: &Cluster) -> Result<String> {
    let spec = &cluster.cr().spec;
    if !spec.image.name.is_empty() {
        return Ok(spec.image.name.clone());
    }
    if !spec.cockroach_db_version.is_empty() {
        return version::image_for_version(&spec.cockroach_db_version).ok_or_else(|| {
            Error::Permanent(format!(
                "version {} is not in the supported version table",
                spec.cockroach_db_version
            ))
        });
    }
    Err(Error::Validation(
        "neither image.name nor cockroachDBVersion is set".to_string(),
    ))
}

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    let requested = requested_image(cluster)?;

    // Already validated and nothing changed.
    if cluster.condition_true(ClusterConditionType::CrdbVersionChecked)
        && cluster.running_image() == Some(requested.as_str())
    {
        return Ok(Outcome::Skipped);
    }

    // Guard against release-train skips before spending a job on it.
    guard_release_train(cluster, &requested)?;

    let ns = cluster.namespace()?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let job_name = cluster.vcheck_job_name()?;

    let Some(job) = jobs.get_opt(&job_name).await? else {
        let job = generate_vcheck_job(cluster, &requested)?;
        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {}
            // Lost a creation race; the existing job is checked next pass.
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        info!(job = %job_name, image = %requested, "started version check job");
        return Err(Error::NotReady("version check job starting".to_string()));
    };

    // A leftover job for a different image must be replaced.
    let job_image = job
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref());
    if job_image != Some(requested.as_str()) {
        jobs.delete(&job_name, &foreground_delete()).await?;
        return Err(Error::NotReady("replacing stale version check job".to_string()));
    }

    let succeeded = job
        .status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or_default()
        > 0;
    if !succeeded {
        check_pull_failure(ctx, ns, &job).await?;
        return Err(Error::NotReady("version check job running".to_string()));
    }

    let tag = read_build_tag(ctx, ns, &job_name).await?;
    debug!(tag = %tag, "version check job reported build tag");

    validate_tag(cluster, &tag)?;

    persist_validated(ctx, cluster, &requested, &tag).await?;
    status.version = tag.clone();
    status.crdb_container_image = requested.clone();
    cluster::set_condition(
        status,
        ClusterConditionType::CrdbVersionChecked,
        ConditionStatus::True,
        "VersionChecked",
        &format!("image {requested} runs {tag}"),
    );

    // The job served its purpose; clean it up eagerly rather than waiting
    // for the TTL controller.
    jobs.delete(&job_name, &foreground_delete()).await?;

    info!(image = %requested, version = %tag, "container image validated");
    Ok(Outcome::Completed)
}

fn foreground_delete() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(5),
        propagation_policy: Some(kube::api::PropagationPolicy::Foreground),
        ..Default::default()
    }
}

/// Reject an upgrade that hops over a release train before spending a
/// validation job on the image.
fn guard_release_train(cluster: &Cluster, requested: &str) -> Result<()> {
    let (Some(current), Ok(target_tag)) = (
        cluster.running_version(),
        extract_requested_version(cluster, requested),
    ) else {
        return Ok(());
    };
    if let (Ok(from), Ok(to)) = (
        version::parse_version(current),
        version::parse_version(&target_tag),
    ) {
        if version::skips_release_train(&from, &to) {
            return Err(Error::Permanent(format!(
                "MajorVersionSkip: upgrade from {current} to {target_tag} \
                 skips a release train"
            )));
        }
    }
    Ok(())
}

/// The version we expect the build tag to be, when the spec pins one.
fn extract_requested_version(cluster: &Cluster, image: &str) -> Result<String> {
    let spec_version = &cluster.cr().spec.cockroach_db_version;
    if !spec_version.is_empty() {
        return Ok(spec_version.clone());
    }
    version::image_tag(image)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("image {image} has no tag")))
}

fn validate_tag(cluster: &Cluster, tag: &str) -> Result<()> {
    version::parse_version(tag)?;

    let spec_version = &cluster.cr().spec.cockroach_db_version;
    if !spec_version.is_empty() && spec_version != tag {
        return Err(Error::Permanent(format!(
            "image reports build tag {tag} but spec requests {spec_version}"
        )));
    }

    if !version::is_supported(tag) {
        return Err(Error::Permanent(format!(
            "version {tag} is not in the supported version table"
        )));
    }

    Ok(())
}

/// Fail fast on ImagePullBackOff once the job has been stuck long enough.
async fn check_pull_failure(ctx: &Context, ns: &str, job: &Job) -> Result<()> {
    let age_secs = job
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| jiff::Timestamp::from_second(t.0.timestamp()).ok())
        .map(|created| jiff::Timestamp::now().duration_since(created).as_secs())
        .unwrap_or(0);
    if age_secs < IMAGE_PULL_DEADLINE_SECS {
        return Ok(());
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let selector = format!("job-name={}", job.name_any());
    let pod_list = pods.list(&ListParams::default().labels(&selector)).await?;

    for pod in pod_list {
        let waiting_reason = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.first())
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref());
        if matches!(waiting_reason, Some("ImagePullBackOff") | Some("ErrImagePull")) {
            return Err(Error::Permanent(
                "container image cannot be pulled".to_string(),
            ));
        }
    }
    Ok(())
}

/// Read the build tag from the completed job's pod logs.
async fn read_build_tag(ctx: &Context, ns: &str, job_name: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let selector = format!("job-name={job_name}");
    let pod_list = pods.list(&ListParams::default().labels(&selector)).await?;

    let pod = pod_list
        .items
        .into_iter()
        .find(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Succeeded")
        })
        .ok_or_else(|| Error::NotReady("version check pod not finished".to_string()))?;

    let logs = pods
        .logs(&pod.name_any(), &LogParams::default())
        .await?;

    parse_build_tag(&logs).ok_or_else(|| {
        Error::Permanent("version check output contains no Build Tag".to_string())
    })
}

/// Record the validated image and version as annotations on the CR. The
/// StatefulSet builder reads from these, never from the raw spec.
async fn persist_validated(
    ctx: &Context,
    cluster: &Cluster,
    image: &str,
    tag: &str,
) -> Result<()> {
    let api: Api<CrdbCluster> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let patch = json!({
        "metadata": {
            "annotations": {
                VERSION_ANNOTATION: tag,
                CONTAINER_IMAGE_ANNOTATION: image,
            }
        }
    });
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    api.patch(cluster.name()?, &params, &Patch::Merge(&patch)).await?;
    Ok(())
}
