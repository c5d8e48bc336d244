//! Cluster view helpers.
//!
//! A thin wrapper over a `CrdbCluster` resource that centralizes the derived
//! names of managed objects, well-known annotations, and condition
//! bookkeeping. Every actor and builder goes through this module so the
//! naming scheme lives in exactly one place.

use std::sync::Arc;

use crate::controller::{Error, Result};
use crate::crd::{
    ActionType, ClusterAction, ClusterCondition, ClusterConditionType, ClusterStatus,
    ConditionStatus, CrdbCluster, CrdbClusterStatus,
};

/// Annotation recording the resolved CockroachDB version.
pub const VERSION_ANNOTATION: &str = "crdb.io/version";
/// Annotation recording the resolved container image.
pub const CONTAINER_IMAGE_ANNOTATION: &str = "crdb.io/containerimage";
/// Annotation on the CR recording the replica count seen at the last drain
/// progress check, for stall detection.
pub const DRAIN_REPLICAS_ANNOTATION: &str = "crdb.io/drain-replicas";
/// Annotation on the CR recording when the drain progress was last checked.
pub const DRAIN_CHECKED_AT_ANNOTATION: &str = "crdb.io/drain-checked-at";

/// Requests an operator-driven restart; removed once the restart is done.
pub const RESTART_TYPE_ANNOTATION: &str = "crdb.io/restarttype";

/// Timestamp stamped into the pod template to trigger a rolling restart.
pub const RESTART_AT_ANNOTATION: &str = "crdb.io/restart";

/// Mount path of the data volume inside the cockroach container.
pub const DATA_DIR: &str = "/cockroach/cockroach-data";
/// Certs directory name relative to the cockroach working directory.
pub const CERTS_DIR: &str = "cockroach-certs";
/// SQL user whose client certificate the operator manages.
pub const ROOT_USER: &str = "root";

/// View over a CrdbCluster with derived-name helpers.
#[derive(Clone)]
pub struct Cluster {
    cr: Arc<CrdbCluster>,
}

impl Cluster {
    pub fn new(cr: Arc<CrdbCluster>) -> Self {
        Self { cr }
    }

    pub fn cr(&self) -> &CrdbCluster {
        &self.cr
    }

    pub fn name(&self) -> Result<&str> {
        self.cr
            .metadata
            .name
            .as_deref()
            .ok_or(Error::MissingField("metadata.name".to_string()))
    }

    pub fn namespace(&self) -> Result<&str> {
        self.cr
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingField("metadata.namespace".to_string()))
    }

    /// StatefulSet and headless discovery service share the cluster name.
    pub fn statefulset_name(&self) -> Result<String> {
        Ok(self.name()?.to_string())
    }

    pub fn discovery_service_name(&self) -> Result<String> {
        Ok(self.name()?.to_string())
    }

    pub fn public_service_name(&self) -> Result<String> {
        Ok(format!("{}-public", self.name()?))
    }

    pub fn ca_secret_name(&self) -> Result<String> {
        Ok(format!("{}-ca", self.name()?))
    }

    /// Node TLS secret: user override wins, otherwise `<name>-node`.
    pub fn node_tls_secret_name(&self) -> Result<String> {
        if !self.cr.spec.node_tls_secret.is_empty() {
            return Ok(self.cr.spec.node_tls_secret.clone());
        }
        Ok(format!("{}-node", self.name()?))
    }

    /// Client TLS secret for a SQL user: override wins for root, otherwise
    /// `<name>-<user>`.
    pub fn client_tls_secret_name(&self, user: &str) -> Result<String> {
        if user == ROOT_USER && !self.cr.spec.client_tls_secret.is_empty() {
            return Ok(self.cr.spec.client_tls_secret.clone());
        }
        Ok(format!("{}-{user}", self.name()?))
    }

    pub fn service_account_name(&self) -> Result<String> {
        Ok(format!("{}-sa", self.name()?))
    }

    pub fn role_name(&self) -> Result<String> {
        Ok(format!("{}-role", self.name()?))
    }

    pub fn role_binding_name(&self) -> Result<String> {
        Ok(format!("{}-rolebinding", self.name()?))
    }

    pub fn vcheck_job_name(&self) -> Result<String> {
        Ok(format!("{}-vcheck", self.name()?))
    }

    /// Whether the operator manages node certificates itself.
    pub fn operator_managed_certs(&self) -> bool {
        self.cr.spec.tls_enabled && self.cr.spec.node_tls_secret.is_empty()
    }

    pub fn secure(&self) -> bool {
        self.cr.spec.tls_enabled
    }

    pub fn desired_nodes(&self) -> i32 {
        self.cr.spec.nodes
    }

    pub fn pod_name(&self, ordinal: i32) -> Result<String> {
        Ok(format!("{}-{ordinal}", self.statefulset_name()?))
    }

    /// Stable in-cluster DNS name of a pod through the headless service.
    pub fn pod_fqdn(&self, ordinal: i32) -> Result<String> {
        Ok(format!(
            "{}.{}.{}",
            self.pod_name(ordinal)?,
            self.discovery_service_name()?,
            self.namespace()?
        ))
    }

    /// DNS names that must appear on the node certificate.
    pub fn node_dns_names(&self) -> Result<Vec<String>> {
        let name = self.name()?;
        let ns = self.namespace()?;
        Ok(vec![
            "localhost".to_string(),
            format!("{name}-public"),
            format!("{name}-public.{ns}"),
            format!("{name}-public.{ns}.svc"),
            format!("{name}-public.{ns}.svc.cluster.local"),
            format!("*.{name}"),
            format!("*.{name}.{ns}"),
            format!("*.{name}.{ns}.svc"),
            format!("*.{name}.{ns}.svc.cluster.local"),
        ])
    }

    /// Annotation value on the CR, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.cr
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Resolved container image recorded by the version checker.
    pub fn running_image(&self) -> Option<&str> {
        self.annotation(CONTAINER_IMAGE_ANNOTATION)
    }

    /// Resolved version recorded by the version checker.
    pub fn running_version(&self) -> Option<&str> {
        self.annotation(VERSION_ANNOTATION)
    }

    pub fn status(&self) -> Option<&CrdbClusterStatus> {
        self.cr.status.as_ref()
    }

    /// Current status of a condition; Unknown when the condition has never
    /// been written.
    pub fn condition(&self, condition_type: ClusterConditionType) -> ConditionStatus {
        condition_status(self.status(), condition_type)
    }

    pub fn condition_true(&self, condition_type: ClusterConditionType) -> bool {
        self.condition(condition_type) == ConditionStatus::True
    }
}

/// Look up a condition's status in a status block.
pub fn condition_status(
    status: Option<&CrdbClusterStatus>,
    condition_type: ClusterConditionType,
) -> ConditionStatus {
    status
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.status)
        .unwrap_or(ConditionStatus::Unknown)
}

/// Set a condition, refreshing the transition time only when the status
/// actually changes.
pub fn set_condition(
    status: &mut CrdbClusterStatus,
    condition_type: ClusterConditionType,
    new_status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition_type)
    {
        if existing.status != new_status {
            existing.status = new_status;
            existing.last_transition_time = jiff::Timestamp::now().to_string();
        }
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }

    let mut condition = ClusterCondition::new(condition_type, new_status);
    condition.reason = reason.to_string();
    condition.message = message.to_string();
    status.conditions.push(condition);
}

/// Ensure exactly one condition per known type exists. On first observation
/// NotInitialized starts True and everything else Unknown.
pub fn seed_conditions(status: &mut CrdbClusterStatus) {
    for condition_type in ClusterConditionType::ALL {
        if status
            .conditions
            .iter()
            .any(|c| c.r#type == condition_type)
        {
            continue;
        }
        let initial = match condition_type {
            ClusterConditionType::NotInitialized => ConditionStatus::True,
            _ => ConditionStatus::Unknown,
        };
        status
            .conditions
            .push(ClusterCondition::new(condition_type, initial));
    }
}

/// Record the outcome of an actor run, one entry per action kind.
pub fn record_action(status: &mut CrdbClusterStatus, action: ActionType, error: Option<&str>) {
    let (result, message) = match error {
        None => ("Finished".to_string(), String::new()),
        Some(msg) => ("Failed".to_string(), msg.to_string()),
    };

    if let Some(existing) = status
        .operator_actions
        .iter_mut()
        .find(|a| a.r#type == action)
    {
        existing.status = result;
        existing.message = message;
        existing.last_transition_time = jiff::Timestamp::now().to_string();
        return;
    }

    status.operator_actions.push(ClusterAction {
        r#type: action,
        status: result,
        message,
        last_transition_time: jiff::Timestamp::now().to_string(),
    });
}

/// Summarize conditions into the coarse clusterStatus field.
pub fn summarize_status(status: &mut CrdbClusterStatus) {
    let failed = status.operator_actions.iter().any(|a| a.status == "Failed");
    let initialized = condition_status(Some(status), ClusterConditionType::Initialized)
        == ConditionStatus::True;
    let restarting = condition_status(Some(status), ClusterConditionType::ClusterRestart)
        == ConditionStatus::True;

    status.cluster_status = if failed {
        ClusterStatus::Failed
    } else if initialized && !restarting {
        ClusterStatus::Running
    } else {
        ClusterStatus::Starting
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CrdbClusterSpec;
    use kube::api::ObjectMeta;

    fn cluster(name: &str, ns: &str) -> Cluster {
        let cr = CrdbCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: 3,
                tls_enabled: true,
                ..Default::default()
            },
            status: None,
        };
        Cluster::new(Arc::new(cr))
    }

    #[test]
    fn test_derived_names() {
        let c = cluster("cockroachdb", "default");
        assert_eq!(c.statefulset_name().unwrap(), "cockroachdb");
        assert_eq!(c.discovery_service_name().unwrap(), "cockroachdb");
        assert_eq!(c.public_service_name().unwrap(), "cockroachdb-public");
        assert_eq!(c.ca_secret_name().unwrap(), "cockroachdb-ca");
        assert_eq!(c.node_tls_secret_name().unwrap(), "cockroachdb-node");
        assert_eq!(
            c.client_tls_secret_name("root").unwrap(),
            "cockroachdb-root"
        );
        assert_eq!(c.service_account_name().unwrap(), "cockroachdb-sa");
        assert_eq!(c.role_name().unwrap(), "cockroachdb-role");
        assert_eq!(c.role_binding_name().unwrap(), "cockroachdb-rolebinding");
        assert_eq!(c.vcheck_job_name().unwrap(), "cockroachdb-vcheck");
    }

    #[test]
    fn test_user_secret_overrides() {
        let mut cr = cluster("db", "ns").cr().clone();
        cr.spec.node_tls_secret = "my-node".to_string();
        cr.spec.client_tls_secret = "my-client".to_string();
        let c = Cluster::new(Arc::new(cr));

        assert_eq!(c.node_tls_secret_name().unwrap(), "my-node");
        assert_eq!(c.client_tls_secret_name("root").unwrap(), "my-client");
        // Non-root users always use the derived name.
        assert_eq!(c.client_tls_secret_name("app").unwrap(), "db-app");
        assert!(!c.operator_managed_certs());
    }

    #[test]
    fn test_pod_fqdn() {
        let c = cluster("crdb", "prod");
        assert_eq!(c.pod_fqdn(2).unwrap(), "crdb-2.crdb.prod");
    }

    #[test]
    fn test_node_dns_names_cover_wildcard_and_public() {
        let c = cluster("crdb", "prod");
        let names = c.node_dns_names().unwrap();
        assert!(names.contains(&"localhost".to_string()));
        assert!(names.contains(&"crdb-public".to_string()));
        // Both the short .svc form and the fully qualified one must verify.
        assert!(names.contains(&"crdb-public.prod.svc".to_string()));
        assert!(names.contains(&"*.crdb.prod.svc".to_string()));
        assert!(names.contains(&"*.crdb.prod.svc.cluster.local".to_string()));
    }

    #[test]
    fn test_seed_conditions_once() {
        let mut status = CrdbClusterStatus::default();
        seed_conditions(&mut status);
        assert_eq!(status.conditions.len(), ClusterConditionType::ALL.len());
        assert_eq!(
            condition_status(Some(&status), ClusterConditionType::NotInitialized),
            ConditionStatus::True
        );
        assert_eq!(
            condition_status(Some(&status), ClusterConditionType::Initialized),
            ConditionStatus::Unknown
        );

        // Idempotent.
        seed_conditions(&mut status);
        assert_eq!(status.conditions.len(), ClusterConditionType::ALL.len());
    }

    #[test]
    fn test_set_condition_keeps_time_when_unchanged() {
        let mut status = CrdbClusterStatus::default();
        seed_conditions(&mut status);

        set_condition(
            &mut status,
            ClusterConditionType::Initialized,
            ConditionStatus::True,
            "DeployFinished",
            "",
        );
        let first = status
            .conditions
            .iter()
            .find(|c| c.r#type == ClusterConditionType::Initialized)
            .unwrap()
            .last_transition_time
            .clone();

        set_condition(
            &mut status,
            ClusterConditionType::Initialized,
            ConditionStatus::True,
            "DeployFinished",
            "still fine",
        );
        let second = &status
            .conditions
            .iter()
            .find(|c| c.r#type == ClusterConditionType::Initialized)
            .unwrap()
            .last_transition_time;

        assert_eq!(&first, second);
    }

    #[test]
    fn test_record_action_caps_one_per_kind() {
        let mut status = CrdbClusterStatus::default();
        record_action(&mut status, ActionType::Deploy, None);
        record_action(&mut status, ActionType::Deploy, Some("boom"));
        assert_eq!(status.operator_actions.len(), 1);
        assert_eq!(status.operator_actions[0].status, "Failed");
        assert_eq!(status.operator_actions[0].message, "boom");
    }

    #[test]
    fn test_summarize_status() {
        let mut status = CrdbClusterStatus::default();
        seed_conditions(&mut status);
        summarize_status(&mut status);
        assert_eq!(status.cluster_status, ClusterStatus::Starting);

        set_condition(
            &mut status,
            ClusterConditionType::Initialized,
            ConditionStatus::True,
            "",
            "",
        );
        summarize_status(&mut status);
        assert_eq!(status.cluster_status, ClusterStatus::Running);

        record_action(&mut status, ActionType::VersionCheck, Some("unsupported"));
        summarize_status(&mut status);
        assert_eq!(status.cluster_status, ClusterStatus::Failed);
    }
}
