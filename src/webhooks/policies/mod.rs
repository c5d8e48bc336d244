//! Admission policies for CrdbCluster.
//!
//! `spec_rules` are enforced on every CREATE and UPDATE; `update_rules` only
//! run when an old object exists and guard transitions that would lose data
//! or wedge the cluster. `defaulting` fills in the optional fields the
//! mutating webhook materializes before validation runs.

pub mod defaulting;
pub mod spec_rules;
pub mod update_rules;

use crate::crd::CrdbCluster;

/// Result of a validation check
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the validation passed
    pub allowed: bool,
    /// Reason for denial (if not allowed)
    pub reason: Option<String>,
    /// Detailed message (if not allowed)
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Context for validation
pub struct ValidationContext<'a> {
    /// The cluster being validated
    pub cluster: &'a CrdbCluster,
    /// The old cluster (for UPDATE operations)
    pub old_cluster: Option<&'a CrdbCluster>,
    /// Whether this is a dry-run request
    pub dry_run: bool,
    /// The namespace of the resource
    pub namespace: Option<&'a str>,
}

impl<'a> ValidationContext<'a> {
    pub fn is_update(&self) -> bool {
        self.old_cluster.is_some()
    }
}

/// Run all validation policies
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    let result = spec_rules::validate(ctx);
    if !result.allowed {
        return result;
    }

    if ctx.is_update() {
        let result = update_rules::validate(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
