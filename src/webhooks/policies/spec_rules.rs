//! Structural spec validation, enforced on every CREATE and UPDATE.

use super::{ValidationContext, ValidationResult};
use crate::version;

/// Validate a CrdbCluster spec in isolation.
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let spec = &ctx.cluster.spec;

    if spec.nodes < 1 {
        return ValidationResult::denied(
            "InvalidNodes",
            &format!("spec.nodes must be at least 1 (got {})", spec.nodes),
        );
    }

    let has_image = !spec.image.name.is_empty();
    let has_version = !spec.cockroach_db_version.is_empty();
    if has_image && has_version {
        return ValidationResult::denied(
            "AmbiguousImage",
            "spec.image.name and spec.cockroachDBVersion are mutually exclusive; set one",
        );
    }
    if !has_image && !has_version {
        return ValidationResult::denied(
            "MissingImage",
            "one of spec.image.name or spec.cockroachDBVersion must be set",
        );
    }
    if has_version {
        if let Err(e) = version::parse_version(&spec.cockroach_db_version) {
            return ValidationResult::denied("InvalidVersion", &e.to_string());
        }
        if !version::is_supported(&spec.cockroach_db_version) {
            return ValidationResult::denied(
                "UnsupportedVersion",
                &format!(
                    "spec.cockroachDBVersion {:?} has no RELATED_IMAGE_COCKROACH_* \
                     mapping on this operator",
                    spec.cockroach_db_version
                ),
            );
        }
    }

    if spec.min_available.is_some() && spec.max_unavailable.is_some() {
        return ValidationResult::denied(
            "InvalidDisruptionBudget",
            "spec.minAvailable and spec.maxUnavailable are mutually exclusive",
        );
    }
    if let Some(min) = spec.min_available {
        if min < 0 || min >= spec.nodes {
            return ValidationResult::denied(
                "InvalidDisruptionBudget",
                &format!(
                    "spec.minAvailable must be between 0 and spec.nodes - 1 (got {min})"
                ),
            );
        }
    }
    if let Some(max) = spec.max_unavailable {
        if max < 1 {
            return ValidationResult::denied(
                "InvalidDisruptionBudget",
                &format!("spec.maxUnavailable must be at least 1 (got {max})"),
            );
        }
    }

    if !spec.tls_enabled && (!spec.node_tls_secret.is_empty() || !spec.client_tls_secret.is_empty())
    {
        return ValidationResult::denied(
            "InvalidTLSConfig",
            "TLS secrets are set but spec.tlsEnabled is false",
        );
    }

    if let Some(logging) = spec.cluster_logging.as_deref() {
        if serde_yaml::from_str::<serde_yaml::Value>(logging).is_err() {
            return ValidationResult::denied(
                "InvalidLoggingConfig",
                "spec.clusterLogging is not valid YAML",
            );
        }
    }

    ValidationResult::allowed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cluster(mutate: impl FnOnce(&mut CrdbClusterSpec)) -> CrdbCluster {
        let mut spec = CrdbClusterSpec {
            nodes: 3,
            ..Default::default()
        };
        spec.image.name = "cockroachdb/cockroach:v24.2.2".to_string();
        mutate(&mut spec);
        CrdbCluster {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn check(cluster: &CrdbCluster) -> ValidationResult {
        validate(&ValidationContext {
            cluster,
            old_cluster: None,
            dry_run: false,
            namespace: Some("default"),
        })
    }

    #[test]
    fn test_valid_spec() {
        assert!(check(&cluster(|_| {})).allowed);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let result = check(&cluster(|s| s.nodes = 0));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidNodes");
    }

    #[test]
    fn test_image_and_version_mutually_exclusive() {
        let result = check(&cluster(|s| {
            s.cockroach_db_version = "v24.2.2".to_string();
        }));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "AmbiguousImage");
    }

    #[test]
    fn test_neither_image_nor_version_rejected() {
        let result = check(&cluster(|s| s.image.name = String::new()));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "MissingImage");
    }

    #[test]
    fn test_malformed_version_rejected() {
        let result = check(&cluster(|s| {
            s.image.name = String::new();
            s.cockroach_db_version = "not-a-version".to_string();
        }));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidVersion");
    }

    #[test]
    fn test_both_disruption_fields_rejected() {
        let result = check(&cluster(|s| {
            s.min_available = Some(2);
            s.max_unavailable = Some(1);
        }));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidDisruptionBudget");
    }

    #[test]
    fn test_min_available_must_leave_headroom() {
        let result = check(&cluster(|s| s.min_available = Some(3)));
        assert!(!result.allowed);
    }

    #[test]
    fn test_tls_secret_without_tls_rejected() {
        let result = check(&cluster(|s| {
            s.node_tls_secret = "my-certs".to_string();
        }));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidTLSConfig");
    }

    #[test]
    fn test_bad_logging_yaml_rejected() {
        let result = check(&cluster(|s| {
            s.cluster_logging = Some("{sinks: [unclosed".to_string());
        }));
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "InvalidLoggingConfig");
    }
}
