//! CrdbCluster Custom Resource Definition.
//!
//! Defines the CrdbCluster CRD for deploying and managing CockroachDB
//! clusters on Kubernetes. A cluster is declared by node count, image or
//! symbolic version, storage, and TLS settings; the operator drives the
//! underlying objects toward that state.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CrdbCluster is a custom resource for deploying CockroachDB clusters.
///
/// Example:
/// ```yaml
/// apiVersion: crdb.cockroachlabs.com/v1alpha1
/// kind: CrdbCluster
/// metadata:
///   name: cockroachdb
/// spec:
///   nodes: 3
///   tlsEnabled: true
///   image:
///     name: cockroachdb/cockroach:v24.2.2
///   dataStore:
///     volumeClaim:
///       resources:
///         requests:
///           storage: 10Gi
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crdb.cockroachlabs.com",
    version = "v1alpha1",
    kind = "CrdbCluster",
    plural = "crdbclusters",
    shortname = "crdb",
    status = "CrdbClusterStatus",
    namespaced,
    // Print columns for kubectl get
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.clusterStatus"}"#,
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterSpec {
    /// Number of CockroachDB nodes (pods) in the cluster.
    pub nodes: i32,

    /// Container image configuration. `image.name` pins an exact image;
    /// mutually exclusive with `cockroachDBVersion`.
    #[serde(default)]
    pub image: ImageSpec,

    /// Symbolic CockroachDB version (e.g. "v24.2.2") resolved through
    /// RELATED_IMAGE_COCKROACH_* environment variables on the operator.
    /// Mutually exclusive with `image.name`.
    #[serde(default, rename = "cockroachDBVersion")]
    pub cockroach_db_version: String,

    /// Enable TLS between nodes and for SQL clients.
    #[serde(default)]
    pub tls_enabled: bool,

    /// Name of a user-provided node TLS secret. Empty means the operator
    /// generates and owns the node certificates.
    #[serde(default, rename = "nodeTLSSecret")]
    pub node_tls_secret: String,

    /// Name of a user-provided client (root) TLS secret. Empty means the
    /// operator generates and owns the client certificates.
    #[serde(default, rename = "clientTLSSecret")]
    pub client_tls_secret: String,

    /// Data store configuration: a PVC template or an emptyDir.
    #[serde(default)]
    pub data_store: DataStoreSpec,

    /// GRPC (intra-node) port (default 26258).
    #[serde(default = "default_grpc_port")]
    pub grpc_port: i32,

    /// SQL port (default 26257).
    #[serde(default = "default_sql_port", rename = "sqlPort")]
    pub sql_port: i32,

    /// HTTP (admin UI / health) port (default 8080).
    #[serde(default = "default_http_port")]
    pub http_port: i32,

    /// CockroachDB `--cache` flag value (default 25%).
    #[serde(default = "default_cache")]
    pub cache: String,

    /// CockroachDB `--max-sql-memory` flag value (default 25%).
    #[serde(default = "default_max_sql_memory", rename = "maxSQLMemory")]
    pub max_sql_memory: String,

    /// Extra arguments appended to the `cockroach start` command.
    #[serde(default)]
    pub additional_args: Vec<String>,

    /// Additional labels applied to all managed resources.
    #[serde(default)]
    pub additional_labels: BTreeMap<String, String>,

    /// Additional annotations applied to all managed resources.
    #[serde(default)]
    pub additional_annotations: BTreeMap<String, String>,

    /// Container resource requests and limits (corev1.ResourceRequirements).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub resources: Option<serde_json::Value>,

    /// Pod affinity rules (corev1.Affinity). Honored only when the
    /// AffinityRules feature gate is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub affinity: Option<serde_json::Value>,

    /// Pod tolerations (corev1.Toleration list). Honored only when the
    /// TolerationRules feature gate is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub tolerations: Option<serde_json::Value>,

    /// Topology spread constraints. Honored only when the
    /// TopologySpreadRules feature gate is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub topology_spread_constraints: Option<serde_json::Value>,

    /// Ingress exposure for the UI, SQL, and gRPC endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// Minimum number of pods that must remain available (PDB).
    /// Mutually exclusive with `maxUnavailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,

    /// Maximum number of pods that may be unavailable (PDB).
    /// Mutually exclusive with `minAvailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,

    /// Inline CockroachDB logging configuration (YAML). Checked
    /// syntactically at admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_logging: Option<String>,
}

impl Default for CrdbClusterSpec {
    fn default() -> Self {
        Self {
            nodes: 1,
            image: ImageSpec::default(),
            cockroach_db_version: String::new(),
            tls_enabled: false,
            node_tls_secret: String::new(),
            client_tls_secret: String::new(),
            data_store: DataStoreSpec::default(),
            grpc_port: default_grpc_port(),
            sql_port: default_sql_port(),
            http_port: default_http_port(),
            cache: default_cache(),
            max_sql_memory: default_max_sql_memory(),
            additional_args: Vec::new(),
            additional_labels: BTreeMap::new(),
            additional_annotations: BTreeMap::new(),
            resources: None,
            affinity: None,
            tolerations: None,
            topology_spread_constraints: None,
            ingress: None,
            min_available: None,
            max_unavailable: None,
            cluster_logging: None,
        }
    }
}

fn default_grpc_port() -> i32 {
    26258
}

fn default_sql_port() -> i32 {
    26257
}

fn default_http_port() -> i32 {
    8080
}

fn default_cache() -> String {
    "25%".to_string()
}

fn default_max_sql_memory() -> String {
    "25%".to_string()
}

/// Schema hook for embedded Kubernetes object fragments that are passed
/// through to the API server without re-modeling their full schema.
fn preserve_arbitrary(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap_or(schemars::schema::Schema::Bool(true))
}

/// Container image specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Full image reference including tag (e.g. cockroachdb/cockroach:v24.2.2).
    #[serde(default)]
    pub name: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub pull_policy: String,

    /// Image pull secret name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// Data store configuration. Exactly one of `volumeClaim` or `emptyDir`
/// should be set; `volumeClaim` wins when both are present.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreSpec {
    /// PersistentVolumeClaim template for the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim: Option<VolumeClaimSpec>,

    /// Use an emptyDir for the data directory (data is lost on pod
    /// rescheduling; test clusters only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirSpec>,
}

/// PVC template for the data directory.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSpec {
    /// Storage class name. If not set, uses the cluster default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access modes (default: ReadWriteOnce).
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    /// Storage resource requests.
    #[serde(default)]
    pub resources: StorageResources,
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

/// Storage resource requests for the data PVC.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageResources {
    #[serde(default)]
    pub requests: StorageRequests,
}

/// Storage request quantity.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequests {
    /// Requested volume size (e.g. "10Gi").
    #[serde(default = "default_storage_size")]
    pub storage: String,
}

impl Default for StorageRequests {
    fn default() -> Self {
        Self {
            storage: default_storage_size(),
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// EmptyDir marker.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirSpec {}

/// Ingress exposure configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Admin UI ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<IngressRule>,

    /// SQL ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<IngressRule>,

    /// gRPC ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<IngressRule>,
}

/// A single ingress sub-rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Hostname to route (e.g. ui.example.com).
    pub host: String,

    /// Ingress class name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    /// Annotations merged onto the generated Ingress.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Names of TLS secrets for the ingress.
    #[serde(default)]
    pub tls: Vec<String>,
}

/// Status of a CrdbCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterStatus {
    /// Resolved short version (e.g. "v24.2.2"). Written only by the
    /// version checker.
    #[serde(default)]
    pub version: String,

    /// Container image the cluster is running, resolved by the version
    /// checker.
    #[serde(default)]
    pub crdb_container_image: String,

    /// Coarse cluster state.
    #[serde(default)]
    pub cluster_status: ClusterStatus,

    /// Conditions describing the current state, one entry per known type.
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Last result per operator action kind, capped in length.
    #[serde(default)]
    pub operator_actions: Vec<ClusterAction>,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Coarse cluster state summarized for users.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterStatus {
    /// Initial state, resources are being materialized.
    #[default]
    Starting,
    /// Cluster is operational.
    Running,
    /// A fatal condition was recorded; see operatorActions.
    Failed,
    /// Cluster finished a terminal operation.
    Finished,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Starting => write!(f, "Starting"),
            ClusterStatus::Running => write!(f, "Running"),
            ClusterStatus::Failed => write!(f, "Failed"),
            ClusterStatus::Finished => write!(f, "Finished"),
        }
    }
}

/// Condition status following the Kubernetes convention.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Known condition types for CrdbCluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterConditionType {
    /// Set on first observation, cleared by the first successful deploy.
    NotInitialized,
    /// All core resources have been materialized at least once.
    Initialized,
    /// The version checker has resolved and validated the image.
    CrdbVersionChecked,
    /// Operator-owned TLS secrets exist and are complete.
    CertificateGenerated,
    /// A scale-down decommission has completed.
    Decommission,
    /// An operator-driven rolling restart is in progress.
    ClusterRestart,
}

impl ClusterConditionType {
    /// All known condition types, in a stable order.
    pub const ALL: [ClusterConditionType; 6] = [
        ClusterConditionType::NotInitialized,
        ClusterConditionType::Initialized,
        ClusterConditionType::CrdbVersionChecked,
        ClusterConditionType::CertificateGenerated,
        ClusterConditionType::Decommission,
        ClusterConditionType::ClusterRestart,
    ];
}

impl std::fmt::Display for ClusterConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterConditionType::NotInitialized => write!(f, "NotInitialized"),
            ClusterConditionType::Initialized => write!(f, "Initialized"),
            ClusterConditionType::CrdbVersionChecked => write!(f, "CrdbVersionChecked"),
            ClusterConditionType::CertificateGenerated => write!(f, "CertificateGenerated"),
            ClusterConditionType::Decommission => write!(f, "Decommission"),
            ClusterConditionType::ClusterRestart => write!(f, "ClusterRestart"),
        }
    }
}

/// A single cluster condition.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition.
    pub r#type: ClusterConditionType,
    /// Status of the condition.
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message about the last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
}

impl ClusterCondition {
    /// Create a new condition stamped with the current time.
    pub fn new(condition_type: ClusterConditionType, status: ConditionStatus) -> Self {
        Self {
            r#type: condition_type,
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }
}

/// Kinds of operator actions recorded in status.operatorActions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ActionType {
    VersionCheck,
    ClusterRestart,
    Deploy,
    GenerateCert,
    PartitionedUpdate,
    Decommission,
    ResizePVC,
    PrunePVC,
    Unknown,
}

impl ActionType {
    /// The fixed execution order of actors within a reconcile. GenerateCert
    /// runs as a subroutine of Deploy and is listed for status bookkeeping.
    pub const ORDERED: [ActionType; 7] = [
        ActionType::VersionCheck,
        ActionType::ClusterRestart,
        ActionType::Deploy,
        ActionType::PartitionedUpdate,
        ActionType::Decommission,
        ActionType::ResizePVC,
        ActionType::PrunePVC,
    ];
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::VersionCheck => write!(f, "VersionCheck"),
            ActionType::ClusterRestart => write!(f, "ClusterRestart"),
            ActionType::Deploy => write!(f, "Deploy"),
            ActionType::GenerateCert => write!(f, "GenerateCert"),
            ActionType::PartitionedUpdate => write!(f, "PartitionedUpdate"),
            ActionType::Decommission => write!(f, "Decommission"),
            ActionType::ResizePVC => write!(f, "ResizePVC"),
            ActionType::PrunePVC => write!(f, "PrunePVC"),
            ActionType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Outcome of a single actor run, recorded per action kind.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAction {
    /// Action kind.
    pub r#type: ActionType,
    /// "Finished" or "Failed".
    pub status: String,
    /// Failure detail, empty on success.
    #[serde(default)]
    pub message: String,
    /// Time the result was recorded.
    pub last_transition_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_status_display() {
        assert_eq!(ClusterStatus::Starting.to_string(), "Starting");
        assert_eq!(ClusterStatus::Running.to_string(), "Running");
        assert_eq!(ClusterStatus::Failed.to_string(), "Failed");
        assert_eq!(ClusterStatus::Finished.to_string(), "Finished");
    }

    #[test]
    fn test_cluster_status_default() {
        assert_eq!(ClusterStatus::default(), ClusterStatus::Starting);
    }

    #[test]
    fn test_default_spec_ports() {
        let spec = CrdbClusterSpec::default();
        assert_eq!(spec.grpc_port, 26258);
        assert_eq!(spec.sql_port, 26257);
        assert_eq!(spec.http_port, 8080);
        assert_eq!(spec.cache, "25%");
        assert_eq!(spec.max_sql_memory, "25%");
    }

    #[test]
    fn test_spec_serialization_field_names() {
        let spec = CrdbClusterSpec {
            nodes: 3,
            cockroach_db_version: "v24.2.2".to_string(),
            tls_enabled: true,
            node_tls_secret: "my-node-certs".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_value(&spec).expect("serialization should succeed");
        assert_eq!(json["cockroachDBVersion"], "v24.2.2");
        assert_eq!(json["nodeTLSSecret"], "my-node-certs");
        assert_eq!(json["sqlPort"], 26257);
        assert_eq!(json["maxSQLMemory"], "25%");
        assert_eq!(json["tlsEnabled"], true);
    }

    #[test]
    fn test_spec_round_trip() {
        let spec = CrdbClusterSpec {
            nodes: 4,
            image: ImageSpec {
                name: "cockroachdb/cockroach:v24.2.2".to_string(),
                ..Default::default()
            },
            data_store: DataStoreSpec {
                volume_claim: Some(VolumeClaimSpec::default()),
                empty_dir: None,
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("serialization should succeed");
        let parsed: CrdbClusterSpec =
            serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(parsed.nodes, 4);
        assert_eq!(parsed.image.name, "cockroachdb/cockroach:v24.2.2");
        let vc = parsed.data_store.volume_claim.expect("volume claim");
        assert_eq!(vc.resources.requests.storage, "10Gi");
        assert_eq!(vc.access_modes, vec!["ReadWriteOnce"]);
    }

    #[test]
    fn test_condition_type_display() {
        assert_eq!(
            ClusterConditionType::NotInitialized.to_string(),
            "NotInitialized"
        );
        assert_eq!(
            ClusterConditionType::CrdbVersionChecked.to_string(),
            "CrdbVersionChecked"
        );
        assert_eq!(
            ClusterConditionType::CertificateGenerated.to_string(),
            "CertificateGenerated"
        );
    }

    #[test]
    fn test_condition_new_stamps_time() {
        let condition =
            ClusterCondition::new(ClusterConditionType::Initialized, ConditionStatus::True);
        assert_eq!(condition.r#type, ClusterConditionType::Initialized);
        assert_eq!(condition.status, ConditionStatus::True);
        assert!(!condition.last_transition_time.is_empty());
    }

    #[test]
    fn test_condition_serializes_k8s_style() {
        let condition =
            ClusterCondition::new(ClusterConditionType::Decommission, ConditionStatus::Unknown);
        let json = serde_json::to_value(&condition).expect("serialization should succeed");
        assert_eq!(json["type"], "Decommission");
        assert_eq!(json["status"], "Unknown");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn test_action_ordering_is_fixed() {
        assert_eq!(ActionType::ORDERED[0], ActionType::VersionCheck);
        // Restarts run before Deploy so an in-flight restart is not fought
        // by the resource upserts.
        assert_eq!(ActionType::ORDERED[1], ActionType::ClusterRestart);
        assert_eq!(ActionType::ORDERED[2], ActionType::Deploy);
        assert_eq!(ActionType::ORDERED[3], ActionType::PartitionedUpdate);
        assert_eq!(ActionType::ORDERED[4], ActionType::Decommission);
        assert_eq!(ActionType::ORDERED[5], ActionType::ResizePVC);
        assert_eq!(ActionType::ORDERED[6], ActionType::PrunePVC);
    }
}
