//! PVC resize actor.
//!
//! Grows the data volume claims in place when the requested storage exceeds
//! what a claim currently asks for. StatefulSet volume claim templates are
//! immutable, so the claims themselves are patched; the kubelet finishes the
//! filesystem expansion on its own. Shrinking is rejected outright.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::info;

use super::Outcome;
use crate::cluster::Cluster;
use crate::controller::{Context, Error, Result};
use crate::crd::{ClusterConditionType, CrdbClusterStatus};
use crate::resources::common::selector_labels;
use crate::resources::statefulset::DATA_VOLUME_NAME;

pub async fn act(
    ctx: &Context,
    cluster: &Cluster,
    _status: &mut CrdbClusterStatus,
) -> Result<Outcome> {
    let Some(claim_spec) = cluster.cr().spec.data_store.volume_claim.as_ref() else {
        return Ok(Outcome::Skipped);
    };
    if !cluster.condition_true(ClusterConditionType::Initialized) {
        return Ok(Outcome::Skipped);
    }

    let requested = parse_quantity(&claim_spec.resources.requests.storage)?;
    let ns = cluster.namespace()?;
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    let prefix = format!("{}-{}-", DATA_VOLUME_NAME, cluster.statefulset_name()?);

    let selector = label_selector(&selector_labels(cluster.cr()));
    let list = claims
        .list(&ListParams::default().labels(&selector))
        .await?;

    let mut patched = 0;
    for claim in list.items.iter().filter(|c| {
        c.metadata
            .name
            .as_deref()
            .is_some_and(|n| n.starts_with(&prefix))
    }) {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        let current = current_storage(claim)
            .ok_or_else(|| Error::MissingField(format!("pvc {name} storage request")))?;
        let current = parse_quantity(&current)?;

        if requested < current {
            return Err(Error::Permanent(format!(
                "pvc {name} requests {current} bytes but the spec asks for \
                 {requested}; shrinking volumes is unsupported"
            )));
        }
        if requested == current {
            continue;
        }

        info!(pvc = name, storage = %claim_spec.resources.requests.storage, "expanding volume claim");
        let patch = json!({
            "spec": {
                "resources": {
                    "requests": { "storage": claim_spec.resources.requests.storage }
                }
            }
        });
        claims
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        patched += 1;
    }

    if patched > 0 {
        ctx.publish_normal_event(
            cluster.cr(),
            "PVCResized",
            "ResizePVC",
            Some(format!(
                "expanded {patched} volume claims to {}",
                claim_spec.resources.requests.storage
            )),
        )
        .await;
        return Ok(Outcome::Completed);
    }
    Ok(Outcome::Skipped)
}

fn current_storage(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|Quantity(q)| q.clone())
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a Kubernetes resource quantity into bytes. Handles the binary and
/// decimal suffixes that show up in storage requests; plain integers are
/// bytes.
pub fn parse_quantity(quantity: &str) -> Result<u128> {
    let trimmed = quantity.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("empty storage quantity".to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| Error::Validation(format!("invalid storage quantity {quantity:?}")))?;

    let multiplier: u128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        _ => {
            return Err(Error::Validation(format!(
                "unsupported storage suffix in {quantity:?}"
            )))
        }
    };
    Ok((value * multiplier as f64) as u128)
}
