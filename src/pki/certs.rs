//! Self-signed certificate generation.
//!
//! The operator acts as a private CA per cluster: it mints a CA certificate,
//! then signs node and client (root user) certificates with it. Private keys
//! are RSA and stored PKCS#1-encoded, matching what `cockroach` expects to
//! find in its certs directory.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use x509_parser::prelude::*;

use crate::controller::{Error, Result};

/// Default certificate validity in years.
pub const DEFAULT_VALIDITY_YEARS: i32 = 10;

/// Default RSA key size in bits.
pub const DEFAULT_KEY_SIZE: usize = 4096;

/// Default organization on generated certificates.
pub const DEFAULT_ORGANIZATION: &str = "Self-Signed Issuer";

/// Options for a certificate to generate.
#[derive(Clone, Debug)]
pub struct CertOptions {
    /// Subject common name.
    pub common_name: String,
    /// Subject organization.
    pub organization: String,
    /// DNS subject alternative names (empty for pure client certs).
    pub dns_names: Vec<String>,
    /// IP subject alternative names.
    pub ip_addresses: Vec<std::net::IpAddr>,
    /// Validity in years from the start of the current year.
    pub validity_years: i32,
    /// RSA key size in bits.
    pub key_size: usize,
}

impl CertOptions {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: DEFAULT_ORGANIZATION.to_string(),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            validity_years: DEFAULT_VALIDITY_YEARS,
            key_size: DEFAULT_KEY_SIZE,
        }
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = org.into();
        self
    }

    pub fn dns_names(mut self, names: Vec<String>) -> Self {
        self.dns_names = names;
        self
    }

    pub fn ip_addresses(mut self, addrs: Vec<std::net::IpAddr>) -> Self {
        self.ip_addresses = addrs;
        self
    }

    pub fn key_size(mut self, bits: usize) -> Self {
        self.key_size = bits;
        self
    }
}

/// A generated certificate with its private key.
#[derive(Clone, Debug)]
pub struct GeneratedCert {
    /// PEM-encoded X.509 certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#1 RSA private key.
    pub key_pem: String,
}

/// Generate a fresh RSA private key and return it as PKCS#1 PEM.
fn generate_rsa_key_pem(bits: usize) -> Result<String> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| Error::Pki(format!("RSA key generation failed: {e}")))?;
    let pem = key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| Error::Pki(format!("failed to encode RSA key: {e}")))?;
    Ok(pem.to_string())
}

/// Build an rcgen key pair from a stored PKCS#1 PEM key. rcgen wants PKCS#8,
/// so the key is transcoded in memory.
pub fn keypair_from_pkcs1_pem(key_pem: &str) -> Result<KeyPair> {
    let key = RsaPrivateKey::from_pkcs1_pem(key_pem)
        .map_err(|e| Error::Pki(format!("failed to parse RSA key: {e}")))?;
    let pkcs8 = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| Error::Pki(format!("failed to transcode RSA key: {e}")))?;
    KeyPair::from_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Error::Pki(format!("failed to load RSA key pair: {e}")))
}

fn base_params(opts: &CertOptions) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(opts.common_name.clone()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(opts.organization.clone()),
    );
    params.distinguished_name = dn;

    // Validity is anchored at Jan 1 so renewing in the same year is a no-op.
    let year = i32::from(jiff::Zoned::now().year());
    params.not_before = rcgen::date_time_ymd(year, 1, 1);
    params.not_after = rcgen::date_time_ymd(year + opts.validity_years, 1, 1);

    params.serial_number = Some(rcgen::SerialNumber::from(vec![1u8]));

    params.subject_alt_names = opts
        .dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.as_str())
                .map(SanType::DnsName)
                .map_err(|e| Error::Pki(format!("invalid DNS name {name:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    params
        .subject_alt_names
        .extend(opts.ip_addresses.iter().map(|addr| SanType::IpAddress(*addr)));

    Ok(params)
}

/// Generate a self-signed CA certificate.
pub fn generate_ca(opts: &CertOptions) -> Result<GeneratedCert> {
    let mut params = base_params(opts)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let key_pem = generate_rsa_key_pem(opts.key_size)?;
    let key_pair = keypair_from_pkcs1_pem(&key_pem)?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Pki(format!("failed to create CA certificate: {e}")))?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem,
    })
}

/// Generate a leaf certificate signed by the given CA. Node certificates
/// carry both server and client auth since CockroachDB nodes dial each other.
pub fn generate_leaf(ca: &GeneratedCert, opts: &CertOptions) -> Result<GeneratedCert> {
    let mut params = base_params(opts)?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let ca_key = keypair_from_pkcs1_pem(&ca.key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, ca_key)
        .map_err(|e| Error::Pki(format!("failed to load CA as issuer: {e}")))?;

    let key_pem = generate_rsa_key_pem(opts.key_size)?;
    let key_pair = keypair_from_pkcs1_pem(&key_pem)?;
    let cert = params
        .signed_by(&key_pair, &issuer)
        .map_err(|e| Error::Pki(format!("failed to sign certificate: {e}")))?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem,
    })
}

/// Parse PEM-encoded data and return the DER bytes.
pub fn pem_to_der(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::Pki(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// Verify that a certificate was signed by the given CA and carries the
/// expected common name. Used to decide whether stored secrets are reusable.
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str, expected_cn: &str) -> Result<()> {
    let cert_der = pem_to_der(cert_pem)?;
    let ca_der = pem_to_der(ca_cert_pem)?;

    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| Error::Pki(format!("failed to parse certificate: {e}")))?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| Error::Pki(format!("failed to parse CA certificate: {e}")))?;

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| Error::Pki(format!("certificate not signed by CA: {e}")))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default();
    if cn != expected_cn {
        return Err(Error::Pki(format!(
            "certificate common name {cn:?} does not match expected {expected_cn:?}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4096-bit keys are too slow for unit tests; the key size is an option
    // for exactly this reason.
    const TEST_KEY_SIZE: usize = 2048;

    #[test]
    fn test_ca_and_node_cert_chain() {
        let ca = generate_ca(
            &CertOptions::new("Cockroach CA")
                .organization("Cockroach Operator")
                .key_size(TEST_KEY_SIZE),
        )
        .expect("CA generation");

        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("BEGIN RSA PRIVATE KEY"));

        let node = generate_leaf(
            &ca,
            &CertOptions::new("node")
                .dns_names(vec![
                    "localhost".to_string(),
                    "cockroachdb-public".to_string(),
                    "*.cockroachdb.default".to_string(),
                ])
                .key_size(TEST_KEY_SIZE),
        )
        .expect("node cert generation");

        verify_signed_by(&node.cert_pem, &ca.cert_pem, "node").expect("chain verification");
    }

    #[test]
    fn test_verify_rejects_wrong_ca() {
        let ca1 = generate_ca(&CertOptions::new("CA one").key_size(TEST_KEY_SIZE)).unwrap();
        let ca2 = generate_ca(&CertOptions::new("CA two").key_size(TEST_KEY_SIZE)).unwrap();
        let leaf = generate_leaf(&ca1, &CertOptions::new("root").key_size(TEST_KEY_SIZE)).unwrap();

        assert!(verify_signed_by(&leaf.cert_pem, &ca2.cert_pem, "root").is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_common_name() {
        let ca = generate_ca(&CertOptions::new("CA").key_size(TEST_KEY_SIZE)).unwrap();
        let leaf = generate_leaf(&ca, &CertOptions::new("root").key_size(TEST_KEY_SIZE)).unwrap();

        assert!(verify_signed_by(&leaf.cert_pem, &ca.cert_pem, "node").is_err());
    }

    #[test]
    fn test_stored_key_round_trips_through_pkcs1() {
        let ca = generate_ca(&CertOptions::new("CA").key_size(TEST_KEY_SIZE)).unwrap();
        // Reloading the key the way a later reconcile would.
        keypair_from_pkcs1_pem(&ca.key_pem).expect("stored key must stay loadable");
    }

    #[test]
    fn test_loopback_ip_san_on_leaf() {
        use x509_parser::extensions::GeneralName;

        let ca = generate_ca(&CertOptions::new("CA").key_size(TEST_KEY_SIZE)).unwrap();
        let leaf = generate_leaf(
            &ca,
            &CertOptions::new("node")
                .dns_names(vec!["localhost".to_string()])
                .ip_addresses(vec![std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)])
                .key_size(TEST_KEY_SIZE),
        )
        .unwrap();

        let der = ::pem::parse(leaf.cert_pem.as_bytes()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(der.contents()).unwrap();
        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("leaf has a SAN extension");
        let has_loopback = san.value.general_names.iter().any(|name| {
            matches!(name, GeneralName::IPAddress(octets) if *octets == [127, 0, 0, 1])
        });
        assert!(has_loopback);
    }

    #[test]
    fn test_invalid_dns_name_rejected() {
        let result = generate_ca(
            &CertOptions::new("CA")
                .dns_names(vec!["bad\u{fF}name".to_string()])
                .key_size(TEST_KEY_SIZE),
        );
        assert!(result.is_err());
    }
}
