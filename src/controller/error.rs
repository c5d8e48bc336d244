//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// A dependency has not settled yet; retry shortly without backoff
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Optimistic-concurrency conflict while persisting a resource
    #[error("Conflict persisting {0}")]
    Conflict(String),

    /// SQL execution against the cluster failed
    #[error("SQL error: {0}")]
    Sql(String),

    /// Certificate generation or parsing failed
    #[error("PKI error: {0}")]
    Pki(String),

    /// Filesystem error (webhook serving certs, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::NotReady(_)
            | Error::Conflict(_)
            | Error::Sql(_)
            | Error::Pki(_)
            | Error::Io(_)
            | Error::Transient(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            // Waiting states poll quickly
            Error::NotReady(_) => Duration::from_secs(5),
            Error::Conflict(_) => Duration::from_secs(2),
            Error::Sql(_) => Duration::from_secs(15),
            _ if self.is_retryable() => Duration::from_secs(30),
            // Don't hammer on non-retryable errors; a spec change will
            // trigger a new reconcile anyway
            _ => Duration::from_secs(3600),
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
