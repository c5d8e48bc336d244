//! Webhook certificate bootstrap.
//!
//! On startup the operator provisions its own webhook PKI: a CA kept in a
//! secret in the operator namespace, a serving certificate for the webhook
//! service written to disk for the TLS listener, and the CA bundle patched
//! into the mutating and validating webhook configurations so the API
//! server trusts the endpoint.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::controller::{Error, Result};
use crate::pki::certs::{generate_leaf, GeneratedCert};
use crate::pki::tls_secret::find_or_create_ca;
use crate::pki::CertOptions;
use crate::webhooks::server::{WEBHOOK_CERT_DIR, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH};

const WEBHOOK_CA_SECRET: &str = "cockroach-operator-webhook-ca";
const WEBHOOK_SERVICE: &str = "cockroach-operator-webhook-service";
const MUTATING_CONFIG: &str = "cockroach-operator-mutating-webhook-configuration";
const VALIDATING_CONFIG: &str = "cockroach-operator-validating-webhook-configuration";
const MUTATING_HOOK: &str = "mcrdbcluster.kb.io";
const VALIDATING_HOOK: &str = "vcrdbcluster.kb.io";
const CERT_ORGANIZATION: &str = "Cockroach DB Operator";

/// Namespace the operator itself runs in.
pub fn operator_namespace() -> Result<String> {
    std::env::var("NAMESPACE")
        .map_err(|_| Error::MissingField("NAMESPACE environment variable".to_string()))
}

/// Provision the webhook PKI and wire the CA bundle into the webhook
/// configurations. Returns the CA so callers can inspect it in tests.
pub async fn ensure_webhook_certificates(client: Client) -> Result<GeneratedCert> {
    let namespace = operator_namespace()?;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let ca = find_or_create_ca(
        &secrets,
        WEBHOOK_CA_SECRET,
        &BTreeMap::new(),
        &CertOptions::new("cockroach operator webhook CA").organization(CERT_ORGANIZATION),
    )
    .await?;

    // The serving certificate is regenerated on every start; only the CA
    // needs to be stable.
    let serving = generate_leaf(
        &ca,
        &CertOptions::new(WEBHOOK_SERVICE)
            .organization(CERT_ORGANIZATION)
            .dns_names(service_dns_names(&namespace)),
    )?;
    write_serving_cert(&serving)?;

    patch_ca_bundle(client, &ca.cert_pem).await?;
    info!(namespace = %namespace, "webhook certificates provisioned");
    Ok(ca)
}

fn service_dns_names(namespace: &str) -> Vec<String> {
    vec![
        WEBHOOK_SERVICE.to_string(),
        format!("{WEBHOOK_SERVICE}.{namespace}"),
        format!("{WEBHOOK_SERVICE}.{namespace}.svc"),
        format!("{WEBHOOK_SERVICE}.{namespace}.svc.cluster.local"),
    ]
}

fn write_serving_cert(serving: &GeneratedCert) -> Result<()> {
    let dir = Path::new(WEBHOOK_CERT_DIR);
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;

    fs::write(WEBHOOK_CERT_PATH, &serving.cert_pem)?;
    fs::set_permissions(WEBHOOK_CERT_PATH, fs::Permissions::from_mode(0o600))?;
    fs::write(WEBHOOK_KEY_PATH, &serving.key_pem)?;
    fs::set_permissions(WEBHOOK_KEY_PATH, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Patch the CA bundle into both webhook configurations. The configurations
/// are installed by the deployment manifests; a missing hook entry is a
/// deployment error worth failing loudly on.
async fn patch_ca_bundle(client: Client, ca_pem: &str) -> Result<()> {
    let bundle = ByteString(ca_pem.as_bytes().to_vec());

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let config = mutating.get(MUTATING_CONFIG).await?;
    let index = hook_index(
        config.webhooks.iter().flatten().map(|w| w.name.as_str()),
        MUTATING_HOOK,
    )?;
    mutating
        .patch(
            MUTATING_CONFIG,
            &PatchParams::default(),
            &Patch::Json::<()>(ca_bundle_patch(index, &bundle)?),
        )
        .await?;

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client);
    let config = validating.get(VALIDATING_CONFIG).await?;
    let index = hook_index(
        config.webhooks.iter().flatten().map(|w| w.name.as_str()),
        VALIDATING_HOOK,
    )?;
    validating
        .patch(
            VALIDATING_CONFIG,
            &PatchParams::default(),
            &Patch::Json::<()>(ca_bundle_patch(index, &bundle)?),
        )
        .await?;

    Ok(())
}

fn hook_index<'a>(names: impl Iterator<Item = &'a str>, hook: &str) -> Result<usize> {
    names
        .enumerate()
        .find_map(|(i, name)| (name == hook).then_some(i))
        .ok_or_else(|| {
            Error::Permanent(format!(
                "webhook configuration does not contain hook {hook}; \
                 reinstall the operator manifests"
            ))
        })
}

fn ca_bundle_patch(index: usize, bundle: &ByteString) -> Result<json_patch::Patch> {
    let patch = json!([{
        "op": "replace",
        "path": format!("/webhooks/{index}/clientConfig/caBundle"),
        "value": bundle,
    }]);
    Ok(serde_json::from_value(patch)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_dns_names_cover_all_forms() {
        let names = service_dns_names("operator-ns");
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"cockroach-operator-webhook-service".to_string()));
        assert!(names.contains(
            &"cockroach-operator-webhook-service.operator-ns.svc.cluster.local".to_string()
        ));
    }

    #[test]
    fn test_hook_index_finds_named_hook() {
        let names = ["other.kb.io", "mcrdbcluster.kb.io"];
        assert_eq!(
            hook_index(names.iter().copied(), "mcrdbcluster.kb.io").unwrap(),
            1
        );
    }

    #[test]
    fn test_hook_index_missing_hook_fails() {
        let names = ["other.kb.io"];
        assert!(hook_index(names.iter().copied(), "vcrdbcluster.kb.io").is_err());
    }

    #[test]
    fn test_ca_bundle_patch_targets_hook_entry() {
        let patch = ca_bundle_patch(2, &ByteString(b"pem".to_vec())).unwrap();
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value[0]["path"].as_str().unwrap(),
            "/webhooks/2/clientConfig/caBundle"
        );
    }
}
