//! ServiceAccount, Role, and RoleBinding generation.
//!
//! Every cluster gets its own service account so database pods never run as
//! `default`. The role is intentionally narrow: pods only read secrets, which
//! covers certificate material lookups at startup.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::controller::Result;
use crate::resources::common::{owner_reference, standard_labels};

/// Generate the per-cluster ServiceAccount.
pub fn generate_service_account(cluster: &Cluster) -> Result<ServiceAccount> {
    let cr = cluster.cr();
    Ok(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(cluster.service_account_name()?),
            namespace: cr.namespace(),
            labels: Some(standard_labels(cr)),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Generate the per-cluster Role.
pub fn generate_role(cluster: &Cluster) -> Result<Role> {
    let cr = cluster.cr();
    Ok(Role {
        metadata: ObjectMeta {
            name: Some(cluster.role_name()?),
            namespace: cr.namespace(),
            labels: Some(standard_labels(cr)),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    })
}

/// Generate the RoleBinding tying the service account to the role.
pub fn generate_role_binding(cluster: &Cluster) -> Result<RoleBinding> {
    let cr = cluster.cr();
    Ok(RoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster.role_binding_name()?),
            namespace: cr.namespace(),
            labels: Some(standard_labels(cr)),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: cluster.role_name()?,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: cluster.service_account_name()?,
            namespace: cr.namespace(),
            ..Default::default()
        }]),
    })
}
