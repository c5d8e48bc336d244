//! TLS secret storage.
//!
//! Generated certificates live in plain Kubernetes secrets using the
//! conventional `ca.crt` / `tls.crt` / `tls.key` data keys. These secrets are
//! deliberately NOT owner-referenced by the CrdbCluster: deleting a cluster
//! must not destroy its certificates, so a re-created cluster of the same
//! name can rejoin its persisted data without a certificate mismatch.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use tracing::{debug, info};

use super::certs::{self, CertOptions, GeneratedCert};
use crate::controller::{Error, Result};

/// Data key for the CA certificate.
pub const CA_CERT_KEY: &str = "ca.crt";
/// Data key for the CA private key (CA secret only).
pub const CA_KEY_KEY: &str = "ca.key";
/// Data key for a leaf certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Data key for a leaf private key.
pub const TLS_KEY_KEY: &str = "tls.key";

fn string_data(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

fn secret_with_data(
    name: &str,
    labels: &BTreeMap<String, String>,
    data: BTreeMap<String, String>,
    secret_type: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        string_data: Some(data),
        type_: Some(secret_type.to_string()),
        ..Default::default()
    }
}

async fn create_secret(api: &Api<Secret>, secret: Secret) -> Result<Secret> {
    match api.create(&PostParams::default(), &secret).await {
        Ok(created) => Ok(created),
        // A parallel reconcile won the race; read what it wrote.
        Err(kube::Error::Api(e)) if e.code == 409 => {
            let name = secret
                .metadata
                .name
                .as_deref()
                .ok_or(Error::MissingField("metadata.name".to_string()))?;
            Ok(api.get(name).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Load an existing CA from its secret, or mint a new one and store it.
pub async fn find_or_create_ca(
    api: &Api<Secret>,
    secret_name: &str,
    labels: &BTreeMap<String, String>,
    opts: &CertOptions,
) -> Result<GeneratedCert> {
    if let Some(existing) = api.get_opt(secret_name).await? {
        if let (Some(cert_pem), Some(key_pem)) = (
            string_data(&existing, CA_CERT_KEY),
            string_data(&existing, CA_KEY_KEY),
        ) {
            // Validate the stored key is still loadable before trusting it.
            certs::keypair_from_pkcs1_pem(&key_pem)?;
            debug!(secret = secret_name, "reusing existing CA secret");
            return Ok(GeneratedCert { cert_pem, key_pem });
        }
        return Err(Error::Pki(format!(
            "CA secret {secret_name} exists but is incomplete; delete it to regenerate"
        )));
    }

    info!(secret = secret_name, "generating new CA certificate");
    let ca = certs::generate_ca(opts)?;

    let mut data = BTreeMap::new();
    data.insert(CA_CERT_KEY.to_string(), ca.cert_pem.clone());
    data.insert(CA_KEY_KEY.to_string(), ca.key_pem.clone());
    // The CA secret stays Opaque: kubernetes.io/tls demands tls.crt/tls.key,
    // which a CA pair does not carry.
    create_secret(api, secret_with_data(secret_name, labels, data, "Opaque")).await?;

    Ok(ca)
}

/// Load an existing leaf certificate from its secret, verifying it against
/// the CA, or mint a new one and store it.
pub async fn find_or_create_leaf(
    api: &Api<Secret>,
    secret_name: &str,
    ca: &GeneratedCert,
    labels: &BTreeMap<String, String>,
    opts: &CertOptions,
) -> Result<GeneratedCert> {
    if let Some(existing) = api.get_opt(secret_name).await? {
        if let (Some(cert_pem), Some(key_pem)) = (
            string_data(&existing, TLS_CERT_KEY),
            string_data(&existing, TLS_KEY_KEY),
        ) {
            certs::verify_signed_by(&cert_pem, &ca.cert_pem, &opts.common_name)?;
            debug!(secret = secret_name, "reusing existing certificate secret");
            return Ok(GeneratedCert { cert_pem, key_pem });
        }
        return Err(Error::Pki(format!(
            "certificate secret {secret_name} exists but is incomplete; delete it to regenerate"
        )));
    }

    info!(
        secret = secret_name,
        common_name = %opts.common_name,
        "generating new certificate"
    );
    let leaf = certs::generate_leaf(ca, opts)?;

    let mut data = BTreeMap::new();
    data.insert(CA_CERT_KEY.to_string(), ca.cert_pem.clone());
    data.insert(TLS_CERT_KEY.to_string(), leaf.cert_pem.clone());
    data.insert(TLS_KEY_KEY.to_string(), leaf.key_pem.clone());
    create_secret(
        api,
        secret_with_data(secret_name, labels, data, "kubernetes.io/tls"),
    )
    .await?;

    Ok(leaf)
}

/// Fetch PEM material from a (possibly user-provided) TLS secret. Accepts
/// both the operator's layout and cert-manager style secrets.
pub async fn load_tls_material(
    api: &Api<Secret>,
    secret_name: &str,
) -> Result<(Option<String>, Option<String>, Option<String>)> {
    let secret = api.get_opt(secret_name).await?.ok_or_else(|| {
        Error::NotReady(format!("TLS secret {secret_name} does not exist yet"))
    })?;
    Ok((
        string_data(&secret, CA_CERT_KEY),
        string_data(&secret, TLS_CERT_KEY),
        string_data(&secret, TLS_KEY_KEY),
    ))
}

/// Decode a PEM data entry as raw bytes, for building rustls stores.
pub fn byte_data(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(bytes)| bytes.clone())
}
