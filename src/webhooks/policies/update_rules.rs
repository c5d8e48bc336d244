//! Transition validation, enforced only on UPDATE.
//!
//! Guards the changes that would lose data or wedge a running cluster:
//! scale-in without decommission, volume shrinks, TLS flips on an
//! initialized cluster, and version moves the database cannot absorb.

use super::{ValidationContext, ValidationResult};
use crate::actors::resize_pvc::parse_quantity;
use crate::cluster::condition_status;
use crate::crd::{ClusterConditionType, ConditionStatus, CrdbCluster};
use crate::features::{self, Feature};
use crate::version;

pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let Some(old) = ctx.old_cluster else {
        return ValidationResult::allowed();
    };
    let new = ctx.cluster;

    if new.spec.nodes < old.spec.nodes && !features::enabled(Feature::UseDecommission) {
        return ValidationResult::denied(
            "ScaleInDisabled",
            &format!(
                "cannot scale from {} to {} nodes: the UseDecommission feature \
                 gate is disabled and nodes would be removed without draining",
                old.spec.nodes, new.spec.nodes
            ),
        );
    }

    if let Some(result) = check_storage(old, new) {
        return result;
    }

    if new.spec.tls_enabled != old.spec.tls_enabled && is_initialized(old) {
        return ValidationResult::denied(
            "ImmutableTLSConfig",
            "spec.tlsEnabled cannot change once the cluster is initialized",
        );
    }

    if let Some(result) = check_version_move(old, new) {
        return result;
    }

    ValidationResult::allowed()
}

fn is_initialized(cluster: &CrdbCluster) -> bool {
    condition_status(cluster.status.as_ref(), ClusterConditionType::Initialized)
        == ConditionStatus::True
}

fn check_storage(old: &CrdbCluster, new: &CrdbCluster) -> Option<ValidationResult> {
    let old_claim = old.spec.data_store.volume_claim.as_ref()?;
    let new_claim = new.spec.data_store.volume_claim.as_ref()?;

    let old_size = parse_quantity(&old_claim.resources.requests.storage).ok()?;
    let new_size = match parse_quantity(&new_claim.resources.requests.storage) {
        Ok(size) => size,
        Err(e) => return Some(ValidationResult::denied("InvalidStorage", &e.to_string())),
    };
    if new_size < old_size {
        return Some(ValidationResult::denied(
            "StorageShrink",
            &format!(
                "cannot shrink storage from {} to {}; volume shrinking is unsupported",
                old_claim.resources.requests.storage, new_claim.resources.requests.storage
            ),
        ));
    }
    None
}

fn check_version_move(old: &CrdbCluster, new: &CrdbCluster) -> Option<ValidationResult> {
    if old.spec.cockroach_db_version.is_empty() || new.spec.cockroach_db_version.is_empty() {
        return None;
    }
    let from = version::parse_version(&old.spec.cockroach_db_version).ok()?;
    let to = match version::parse_version(&new.spec.cockroach_db_version) {
        Ok(v) => v,
        Err(e) => return Some(ValidationResult::denied("InvalidVersion", &e.to_string())),
    };

    if to < from {
        return Some(ValidationResult::denied(
            "VersionDowngrade",
            &format!(
                "cannot downgrade from {} to {}",
                old.spec.cockroach_db_version, new.spec.cockroach_db_version
            ),
        ));
    }
    if version::skips_release_train(&from, &to) {
        return Some(ValidationResult::denied(
            "MajorVersionSkip",
            &format!(
                "upgrading from {} to {} skips a release train; upgrade one \
                 major version at a time",
                old.spec.cockroach_db_version, new.spec.cockroach_db_version
            ),
        ));
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::{ClusterCondition, CrdbClusterSpec, CrdbClusterStatus, VolumeClaimSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cluster(mutate: impl FnOnce(&mut CrdbCluster)) -> CrdbCluster {
        let mut cluster = CrdbCluster {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: 3,
                ..Default::default()
            },
            status: None,
        };
        cluster.spec.cockroach_db_version = "v24.1.5".to_string();
        mutate(&mut cluster);
        cluster
    }

    fn check(old: &CrdbCluster, new: &CrdbCluster) -> ValidationResult {
        validate(&ValidationContext {
            cluster: new,
            old_cluster: Some(old),
            dry_run: false,
            namespace: Some("default"),
        })
    }

    fn with_storage(cluster: &mut CrdbCluster, storage: &str) {
        let mut claim = VolumeClaimSpec::default();
        claim.resources.requests.storage = storage.to_string();
        cluster.spec.data_store.volume_claim = Some(claim);
    }

    fn initialized_status() -> CrdbClusterStatus {
        CrdbClusterStatus {
            conditions: vec![ClusterCondition::new(
                ClusterConditionType::Initialized,
                ConditionStatus::True,
            )],
            ..Default::default()
        }
    }

    #[test]
    fn test_scale_out_allowed() {
        let old = cluster(|_| {});
        let new = cluster(|c| c.spec.nodes = 5);
        assert!(check(&old, &new).allowed);
    }

    #[test]
    fn test_storage_grow_allowed() {
        let old = cluster(|c| with_storage(c, "10Gi"));
        let new = cluster(|c| with_storage(c, "20Gi"));
        assert!(check(&old, &new).allowed);
    }

    #[test]
    fn test_storage_shrink_rejected() {
        let old = cluster(|c| with_storage(c, "20Gi"));
        let new = cluster(|c| with_storage(c, "10Gi"));
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "StorageShrink");
    }

    #[test]
    fn test_tls_flip_rejected_once_initialized() {
        let old = cluster(|c| c.status = Some(initialized_status()));
        let new = cluster(|c| c.spec.tls_enabled = true);
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "ImmutableTLSConfig");
    }

    #[test]
    fn test_tls_flip_allowed_before_init() {
        let old = cluster(|_| {});
        let new = cluster(|c| c.spec.tls_enabled = true);
        assert!(check(&old, &new).allowed);
    }

    #[test]
    fn test_version_downgrade_rejected() {
        let old = cluster(|_| {});
        let new = cluster(|c| c.spec.cockroach_db_version = "v23.2.1".to_string());
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "VersionDowngrade");
    }

    #[test]
    fn test_train_skip_rejected() {
        let old = cluster(|c| c.spec.cockroach_db_version = "v23.1.10".to_string());
        let new = cluster(|c| c.spec.cockroach_db_version = "v24.1.5".to_string());
        let result = check(&old, &new);
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "MajorVersionSkip");
    }

    #[test]
    fn test_single_train_hop_allowed() {
        let old = cluster(|c| c.spec.cockroach_db_version = "v23.2.4".to_string());
        let new = cluster(|c| c.spec.cockroach_db_version = "v24.1.5".to_string());
        assert!(check(&old, &new).allowed);
    }
}
