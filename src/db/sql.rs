//! SQL access to a CockroachDB cluster.
//!
//! In-cluster the operator dials the public service directly; outside (local
//! development, tests) it transparently port-forwards to pod 0. Secure
//! clusters authenticate with the operator-managed root client certificate.

use std::path::Path;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use regex::Regex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::cluster::{Cluster, ROOT_USER};
use crate::controller::{Error, Result};
use crate::pki::certs::pem_to_der;
use crate::pki::tls_secret::{byte_data, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::resources::port_forward::PortForward;

/// Cluster setting gating version finalization during major upgrades.
pub const PRESERVE_DOWNGRADE_SETTING: &str = "cluster.preserve_downgrade_option";
/// Cluster setting holding the active logical version.
pub const VERSION_SETTING: &str = "version";

/// Setting names are interpolated into SHOW/SET statements, so their charset
/// is restricted to what real setting names use.
pub fn validate_setting_name(name: &str) -> Result<()> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_.]+$").expect("setting name pattern is valid")
    });
    if !pattern.is_match(name) {
        return Err(Error::Validation(format!(
            "invalid cluster setting name: {name:?}"
        )));
    }
    Ok(())
}

/// A live SQL connection to the cluster. Dropping it tears down the
/// connection task and any port-forward behind it.
pub struct DbClient {
    client: tokio_postgres::Client,
    _connection: JoinHandle<()>,
    _port_forward: Option<PortForward>,
}

fn running_in_cluster() -> bool {
    Path::new("/var/run/secrets/kubernetes.io/serviceaccount/token").exists()
}

impl DbClient {
    /// Connect to the cluster as root.
    pub async fn connect(kube_client: Client, cluster: &Cluster) -> Result<Self> {
        let ns = cluster.namespace()?;

        let (host, port, port_forward) = if running_in_cluster() {
            let host = format!("{}.{ns}", cluster.public_service_name()?);
            (host, cluster.cr().spec.sql_port as u16, None)
        } else {
            let pf = PortForward::start(
                kube_client.clone(),
                ns,
                &cluster.pod_name(0)?,
                cluster.cr().spec.sql_port as u16,
                None,
            )
            .await?;
            // "localhost" is on the node certificate, 127.0.0.1 is not.
            ("localhost".to_string(), pf.local_port(), Some(pf))
        };

        debug!(host = %host, port = port, secure = cluster.secure(), "connecting to cluster SQL");

        let mut config = tokio_postgres::Config::new();
        config
            .host(&host)
            .port(port)
            .user(ROOT_USER)
            .dbname("system")
            .connect_timeout(std::time::Duration::from_secs(10));

        if cluster.secure() {
            let tls = Self::tls_connector(kube_client, cluster).await?;
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| Error::Sql(format!("connection failed: {e}")))?;
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "SQL connection closed with error");
                }
            });
            Ok(Self {
                client,
                _connection: handle,
                _port_forward: port_forward,
            })
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| Error::Sql(format!("connection failed: {e}")))?;
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "SQL connection closed with error");
                }
            });
            Ok(Self {
                client,
                _connection: handle,
                _port_forward: port_forward,
            })
        }
    }

    /// Build a rustls connector from the cluster's CA and root client cert.
    async fn tls_connector(
        kube_client: Client,
        cluster: &Cluster,
    ) -> Result<tokio_postgres_rustls::MakeRustlsConnect> {
        let ns = cluster.namespace()?;
        let secrets: Api<Secret> = Api::namespaced(kube_client, ns);

        let client_secret_name = cluster.client_tls_secret_name(ROOT_USER)?;
        let secret = secrets.get_opt(&client_secret_name).await?.ok_or_else(|| {
            Error::NotReady(format!("client TLS secret {client_secret_name} missing"))
        })?;

        let ca_pem = byte_data(&secret, CA_CERT_KEY)
            .ok_or_else(|| Error::Pki(format!("{client_secret_name} has no {CA_CERT_KEY}")))?;
        let cert_pem = byte_data(&secret, TLS_CERT_KEY)
            .ok_or_else(|| Error::Pki(format!("{client_secret_name} has no {TLS_CERT_KEY}")))?;
        let key_pem = byte_data(&secret, TLS_KEY_KEY)
            .ok_or_else(|| Error::Pki(format!("{client_secret_name} has no {TLS_KEY_KEY}")))?;

        let ca_der = pem_to_der(std::str::from_utf8(&ca_pem).map_err(to_pki_err)?)?;
        let cert_der = pem_to_der(std::str::from_utf8(&cert_pem).map_err(to_pki_err)?)?;
        let key_der = pem_to_der(std::str::from_utf8(&key_pem).map_err(to_pki_err)?)?;

        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(CertificateDer::from(ca_der))
            .map_err(|e| Error::Pki(format!("failed to load CA certificate: {e}")))?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![CertificateDer::from(cert_der)],
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key_der)),
            )
            .map_err(|e| Error::Pki(format!("failed to load client certificate: {e}")))?;

        Ok(tokio_postgres_rustls::MakeRustlsConnect::new(config))
    }

    /// SHOW CLUSTER SETTING.
    pub async fn show_cluster_setting(&self, name: &str) -> Result<String> {
        validate_setting_name(name)?;
        let row = self
            .client
            .query_one(&format!("SHOW CLUSTER SETTING {name}"), &[])
            .await
            .map_err(|e| Error::Sql(format!("SHOW CLUSTER SETTING {name}: {e}")))?;
        row.try_get::<_, String>(0)
            .map_err(|e| Error::Sql(format!("unexpected SHOW result: {e}")))
    }

    /// SET CLUSTER SETTING. The value is embedded as a quoted literal since
    /// placeholders are not accepted in this position.
    pub async fn set_cluster_setting(&self, name: &str, value: &str) -> Result<()> {
        validate_setting_name(name)?;
        let literal = value.replace('\'', "''");
        self.client
            .execute(&format!("SET CLUSTER SETTING {name} = '{literal}'"), &[])
            .await
            .map_err(|e| Error::Sql(format!("SET CLUSTER SETTING {name}: {e}")))?;
        Ok(())
    }

    /// RESET CLUSTER SETTING back to its default.
    pub async fn reset_cluster_setting(&self, name: &str) -> Result<()> {
        validate_setting_name(name)?;
        self.client
            .execute(&format!("RESET CLUSTER SETTING {name}"), &[])
            .await
            .map_err(|e| Error::Sql(format!("RESET CLUSTER SETTING {name}: {e}")))?;
        Ok(())
    }

    /// Total underreplicated ranges across all stores. Zero means every
    /// range has its full complement of replicas and a pod can safely
    /// restart.
    pub async fn underreplicated_ranges(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT coalesce(sum((metrics->>'ranges.underreplicated')::DECIMAL), 0)::INT8 \
                 FROM crdb_internal.kv_store_status",
                &[],
            )
            .await
            .map_err(|e| Error::Sql(format!("underreplicated range query: {e}")))?;
        row.try_get::<_, i64>(0)
            .map_err(|e| Error::Sql(format!("unexpected range count: {e}")))
    }
}

fn to_pki_err(e: std::str::Utf8Error) -> Error {
    Error::Pki(format!("secret data is not valid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_setting_name_accepts_real_settings() {
        assert!(validate_setting_name("version").is_ok());
        assert!(validate_setting_name("cluster.preserve_downgrade_option").is_ok());
        assert!(validate_setting_name("kv.snapshot_rebalance.max_rate").is_ok());
        // setting names can carry digits
        assert!(validate_setting_name("sql.defaults.distsql2").is_ok());
    }

    #[test]
    fn test_validate_setting_name_rejects_injection() {
        assert!(validate_setting_name("version; DROP TABLE users").is_err());
        assert!(validate_setting_name("version'").is_err());
        assert!(validate_setting_name("").is_err());
        assert!(validate_setting_name("a b").is_err());
    }
}
