//! Certificate generation and TLS secret management.
//!
//! - `certs`: self-signed CA and leaf certificate generation (rcgen)
//! - `tls_secret`: persistence of certificate material in Kubernetes secrets

pub mod certs;
pub mod tls_secret;

pub use certs::{CertOptions, GeneratedCert};
