//! Deploy actor.
//!
//! Materializes every Kubernetes object a cluster needs: certificates when
//! TLS is operator-managed, both services, the RBAC triple, the disruption
//! budget, optional ingresses, and finally the StatefulSet. Every persist is
//! a server-side apply, so running this actor repeatedly converges instead
//! of fighting other field managers.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::Api;
use kube::ResourceExt;
use tracing::info;

use super::{generate_cert, Outcome};
use crate::cluster::{self, Cluster};
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbClusterStatus};
use crate::pki::tls_secret;
use crate::resources::apply::persist;
use crate::resources::ingress::generate_ingresses;
use crate::resources::pdb::generate_pod_disruption_budget;
use crate::resources::rbac::{generate_role, generate_role_binding, generate_service_account};
use crate::resources::services::{generate_discovery_service, generate_public_service};
use crate::resources::statefulset::generate_statefulset;

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    if !cluster.condition_true(ClusterConditionType::CrdbVersionChecked) {
        return Ok(Outcome::Skipped);
    }

    let ns = cluster.namespace()?;
    let mut changed = generate_cert::ensure_certs(ctx, cluster, status).await?;

    // User-provided certificates must exist before pods can mount them.
    if cluster.secure() && !cluster.operator_managed_certs() {
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
        let (_, cert, key) =
            tls_secret::load_tls_material(&secrets, &cluster.node_tls_secret_name()?).await?;
        if cert.is_none() || key.is_none() {
            return Err(Error::NotReady(format!(
                "node TLS secret {} is missing tls.crt or tls.key",
                cluster.node_tls_secret_name()?
            )));
        }
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    changed |= persist(&services, &generate_discovery_service(cluster)?)
        .await?
        .changed();
    changed |= persist(&services, &generate_public_service(cluster)?)
        .await?
        .changed();

    let service_accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), ns);
    changed |= persist(&service_accounts, &generate_service_account(cluster)?)
        .await?
        .changed();
    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), ns);
    changed |= persist(&roles, &generate_role(cluster)?).await?.changed();
    let role_bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), ns);
    changed |= persist(&role_bindings, &generate_role_binding(cluster)?)
        .await?
        .changed();

    let pdbs: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), ns);
    changed |= persist(&pdbs, &generate_pod_disruption_budget(cluster)?)
        .await?
        .changed();

    let ingresses: Api<Ingress> = Api::namespaced(ctx.client.clone(), ns);
    for ingress in generate_ingresses(cluster)? {
        changed |= persist(&ingresses, &ingress).await?.changed();
    }

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let desired_sts = generate_statefulset(cluster)?;
    // Scaling is owned by the decommission actor and version rollout by the
    // partitioned-update actor; never preempt either from here.
    let desired_sts = preserve_owned_fields(&statefulsets, desired_sts).await?;
    changed |= persist(&statefulsets, &desired_sts).await?.changed();

    let first_deploy = !cluster.condition_true(ClusterConditionType::Initialized);
    if first_deploy {
        cluster::set_condition(
            status,
            ClusterConditionType::NotInitialized,
            ConditionStatus::False,
            "Deployed",
            "",
        );
        cluster::set_condition(
            status,
            ClusterConditionType::Initialized,
            ConditionStatus::True,
            "Deployed",
            "all cluster resources created",
        );
        info!(cluster = cluster.cr().name_any(), "cluster resources deployed");
        ctx.publish_normal_event(
            cluster.cr(),
            "Deployed",
            "Deploy",
            Some("cluster resources created".to_string()),
        )
        .await;
        return Ok(Outcome::Completed);
    }

    if changed {
        return Ok(Outcome::Completed);
    }
    Ok(Outcome::Skipped)
}

/// Adjust the desired StatefulSet so this actor never steps on state other
/// actors own:
/// - a shrink keeps the live replica count; decommission drains nodes first
/// - an image change keeps the live image and version annotations when the
///   partitioned-update actor will roll it one pod at a time
async fn preserve_owned_fields(
    api: &Api<StatefulSet>,
    mut desired: StatefulSet,
) -> Result<StatefulSet> {
    let name = desired
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingField("metadata.name".to_string()))?;
    let Some(live) = api.get_opt(&name).await? else {
        return Ok(desired);
    };

    let live_replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if let Some(spec) = desired.spec.as_mut() {
        if crate::features::enabled(crate::features::Feature::UseDecommission)
            && spec.replicas.unwrap_or(0) < live_replicas
        {
            spec.replicas = Some(live_replicas);
        }
    }

    if crate::features::enabled(crate::features::Feature::PartitionedUpdate)
        && super::partitioned_update::handles_replica_count(live_replicas)
    {
        let live_image = live
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone());
        let desired_image = desired
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone());

        if let (Some(live_image), Some(desired_image)) = (live_image, desired_image) {
            if live_image != desired_image {
                if let Some(container) = desired
                    .spec
                    .as_mut()
                    .and_then(|s| s.template.spec.as_mut())
                    .and_then(|p| p.containers.first_mut())
                {
                    container.image = Some(live_image);
                }
                // Keep the live rollout annotations in step with the image.
                if let (Some(desired_meta), Some(live_annotations)) =
                    (desired.metadata.annotations.as_mut(), live.metadata.annotations.as_ref())
                {
                    for key in [
                        crate::cluster::VERSION_ANNOTATION,
                        crate::cluster::CONTAINER_IMAGE_ANNOTATION,
                    ] {
                        if let Some(value) = live_annotations.get(key) {
                            desired_meta.insert(key.to_string(), value.clone());
                        }
                    }
                }
            }
        }
    }

    Ok(desired)
}
