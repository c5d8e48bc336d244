//! Admission webhooks for CrdbCluster.
//!
//! A mutating webhook materializes defaults, a validating webhook enforces
//! structural and transition rules, and the bootstrap module provisions the
//! self-signed serving PKI on startup.

pub mod bootstrap;
pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
