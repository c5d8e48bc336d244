//! Certificate generation subroutine.
//!
//! Runs inside the deploy actor when TLS is enabled and the operator owns
//! the certificates. Generates (or reuses) the per-cluster CA and signs the
//! node and root client certificates with it.

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use tracing::info;

use crate::cluster::{self, Cluster, ROOT_USER};
use crate::controller::{Context, Result};
use crate::crd::{ActionType, ClusterConditionType, ConditionStatus, CrdbClusterStatus};
use crate::pki::certs::CertOptions;
use crate::pki::tls_secret;
use crate::resources::common::standard_labels;

/// Organization stamped on operator-generated cluster certificates.
const CERT_ORGANIZATION: &str = "Cockroach Operator";

/// Ensure the CA, node, and root client secrets exist and chain correctly.
/// Returns true when any certificate was newly minted.
pub async fn ensure_certs(
    ctx: &Context,
    cluster: &Cluster,
    status: &mut CrdbClusterStatus,
) -> Result<bool> {
    if !cluster.operator_managed_certs() {
        return Ok(false);
    }
    if cluster.condition_true(ClusterConditionType::CertificateGenerated) {
        return Ok(false);
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), cluster.namespace()?);
    let labels = standard_labels(cluster.cr());

    let ca = tls_secret::find_or_create_ca(
        &secrets,
        &cluster.ca_secret_name()?,
        &labels,
        &CertOptions::new(format!("{} CA", cluster.name()?)).organization(CERT_ORGANIZATION),
    )
    .await?;

    tls_secret::find_or_create_leaf(
        &secrets,
        &cluster.node_tls_secret_name()?,
        &ca,
        &labels,
        &CertOptions::new("node")
            .ip_addresses(vec![std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)])
            .organization(CERT_ORGANIZATION)
            .dns_names(cluster.node_dns_names()?),
    )
    .await?;

    tls_secret::find_or_create_leaf(
        &secrets,
        &cluster.client_tls_secret_name(ROOT_USER)?,
        &ca,
        &labels,
        &CertOptions::new(ROOT_USER).organization(CERT_ORGANIZATION),
    )
    .await?;

    cluster::set_condition(
        status,
        ClusterConditionType::CertificateGenerated,
        ConditionStatus::True,
        "CertificatesReady",
        "CA, node, and root client certificates are in place",
    );
    cluster::record_action(status, ActionType::GenerateCert, None);

    info!(cluster = cluster.name()?, "certificates generated");
    ctx.publish_normal_event(
        cluster.cr(),
        "CertificatesGenerated",
        "GenerateCert",
        Some("TLS certificates generated and stored".to_string()),
    )
    .await;

    Ok(true)
}
