//! StatefulSet generation for CockroachDB clusters.
//!
//! - Stable network identity via the headless discovery service
//! - Persistent storage via a PVC template (or emptyDir for test clusters)
//! - Projected TLS certificate mounts in the layout cockroach expects
//! - HTTP health probes against the cockroach /health endpoint

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    KeyToPath, LocalObjectReference, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ProjectedVolumeSource, ResourceRequirements, SecretProjection, Toleration,
    TopologySpreadConstraint, Volume, VolumeMount, VolumeProjection, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::cluster::{Cluster, CERTS_DIR, CONTAINER_IMAGE_ANNOTATION, DATA_DIR, VERSION_ANNOTATION};
use crate::controller::{Error, Result};
use crate::features::{self, Feature};
use crate::pki::tls_secret::{CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::resources::common::{
    owner_reference, selector_labels, standard_annotations, standard_labels,
};

/// Name of the database container in the pod.
pub const DB_CONTAINER_NAME: &str = "db";
/// Name of the data volume / PVC template.
pub const DATA_VOLUME_NAME: &str = "datadir";
/// Name of the certs volume.
pub const CERTS_VOLUME_NAME: &str = "certs";
/// Grace period long enough for a node to drain leases on shutdown.
const TERMINATION_GRACE_PERIOD: i64 = 300;

/// Generate the StatefulSet for a cluster. The image comes from the version
/// checker's annotations, never straight from the spec, so an unvalidated
/// image can never reach the pods.
pub fn generate_statefulset(cluster: &Cluster) -> Result<StatefulSet> {
    let cr = cluster.cr();
    let name = cluster.statefulset_name()?;
    let image = cluster
        .running_image()
        .ok_or_else(|| Error::NotReady("container image has not been validated yet".to_string()))?
        .to_string();
    let version = cluster.running_version().unwrap_or_default().to_string();

    let labels = standard_labels(cr);
    let mut annotations = standard_annotations(cr);
    annotations.insert(VERSION_ANNOTATION.to_string(), version);
    annotations.insert(CONTAINER_IMAGE_ANNOTATION.to_string(), image.clone());

    let (volumes, volume_claim_templates) = data_volumes(cluster)?;

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cr.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(cluster.discovery_service_name()?),
            replicas: Some(cluster.desired_nodes()),
            selector: LabelSelector {
                match_labels: Some(selector_labels(cr)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy::default()),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(standard_annotations(cr)),
                    ..Default::default()
                }),
                spec: Some(pod_spec(cluster, &image, volumes)?),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_spec(cluster: &Cluster, image: &str, volumes: Vec<Volume>) -> Result<PodSpec> {
    let cr = cluster.cr();

    let affinity: Option<Affinity> =
        match (&cr.spec.affinity, features::enabled(Feature::AffinityRules)) {
            (Some(value), true) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| Error::Validation(format!("invalid affinity: {e}")))?,
            ),
            _ => None,
        };

    let tolerations: Option<Vec<Toleration>> =
        match (&cr.spec.tolerations, features::enabled(Feature::TolerationRules)) {
            (Some(value), true) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| Error::Validation(format!("invalid tolerations: {e}")))?,
            ),
            _ => None,
        };

    let topology_spread_constraints: Option<Vec<TopologySpreadConstraint>> = match (
        &cr.spec.topology_spread_constraints,
        features::enabled(Feature::TopologySpreadRules),
    ) {
        (Some(value), true) => Some(serde_json::from_value(value.clone()).map_err(|e| {
            Error::Validation(format!("invalid topologySpreadConstraints: {e}"))
        })?),
        _ => None,
    };

    let image_pull_secrets = cr
        .spec
        .image
        .pull_secret
        .as_ref()
        .map(|secret| vec![LocalObjectReference { name: secret.clone() }]);

    Ok(PodSpec {
        service_account_name: Some(cluster.service_account_name()?),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
        affinity,
        tolerations,
        topology_spread_constraints,
        image_pull_secrets,
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            fs_group: Some(1000),
            ..Default::default()
        }),
        containers: vec![db_container(cluster, image)?],
        volumes: Some(volumes),
        ..Default::default()
    })
}

fn db_container(cluster: &Cluster, image: &str) -> Result<Container> {
    let cr = cluster.cr();

    let mut volume_mounts = vec![VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: DATA_DIR.to_string(),
        ..Default::default()
    }];
    if cluster.secure() {
        volume_mounts.push(VolumeMount {
            name: CERTS_VOLUME_NAME.to_string(),
            mount_path: format!("/cockroach/{CERTS_DIR}"),
            ..Default::default()
        });
    }

    let resources: Option<ResourceRequirements> = match &cr.spec.resources {
        Some(value) => Some(
            serde_json::from_value(value.clone())
                .map_err(|e| Error::Validation(format!("invalid resources: {e}")))?,
        ),
        None => None,
    };

    let probe_scheme = if cluster.secure() { "HTTPS" } else { "HTTP" };

    Ok(Container {
        name: DB_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(cr.spec.image.pull_policy.clone()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-ecx".to_string(),
            start_command(cluster)?,
        ]),
        env: Some(vec![
            EnvVar {
                name: "COCKROACH_CHANNEL".to_string(),
                value: Some("kubernetes-operator".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: cr.spec.grpc_port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("http".to_string()),
                container_port: cr.spec.http_port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("sql".to_string()),
                container_port: cr.spec.sql_port,
                ..Default::default()
            },
        ]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::String("http".to_string()),
                scheme: Some(probe_scheme.to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(5),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health?ready=1".to_string()),
                port: IntOrString::String("http".to_string()),
                scheme: Some(probe_scheme.to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            failure_threshold: Some(2),
            ..Default::default()
        }),
        resources,
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    })
}

/// Build the `cockroach start` command line.
pub fn start_command(cluster: &Cluster) -> Result<String> {
    let cr = cluster.cr();
    let name = cluster.statefulset_name()?;
    let ns = cluster.namespace()?;

    // Join addresses for up to the first three pods; a new pod only needs
    // one live peer to find the cluster.
    let join = (0..cluster.desired_nodes().min(3))
        .map(|i| format!("{name}-{i}.{name}.{ns}:{}", cr.spec.grpc_port))
        .collect::<Vec<_>>()
        .join(",");

    let mut args = vec![
        "exec /cockroach/cockroach start".to_string(),
        format!("--join={join}"),
        format!("--advertise-host=$(POD_NAME).{name}.{ns}"),
        format!("--listen-addr=:{}", cr.spec.grpc_port),
        format!("--http-port={}", cr.spec.http_port),
        format!("--sql-addr=:{}", cr.spec.sql_port),
        format!("--cache={}", cr.spec.cache),
        format!("--max-sql-memory={}", cr.spec.max_sql_memory),
    ];

    if cluster.secure() {
        args.push(format!("--certs-dir={CERTS_DIR}"));
    } else {
        args.push("--insecure".to_string());
    }

    match &cr.spec.cluster_logging {
        Some(config) => args.push(format!("--log={config}")),
        None => args.push("--logtostderr=INFO".to_string()),
    }

    args.extend(cr.spec.additional_args.iter().cloned());

    Ok(args.join(" "))
}

/// Pod volumes plus PVC templates, driven by spec.dataStore.
fn data_volumes(cluster: &Cluster) -> Result<(Vec<Volume>, Option<Vec<PersistentVolumeClaim>>)> {
    let cr = cluster.cr();
    let mut volumes = Vec::new();

    if cluster.secure() {
        volumes.push(certs_volume(cluster)?);
    }

    if let Some(claim) = &cr.spec.data_store.volume_claim {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_string(),
            Quantity(claim.resources.requests.storage.clone()),
        );

        let template = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME_NAME.to_string()),
                labels: Some(selector_labels(cr)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(claim.access_modes.clone()),
                storage_class_name: claim.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        return Ok((volumes, Some(vec![template])));
    }

    // emptyDir fallback for clusters without persistence.
    volumes.push(Volume {
        name: DATA_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    Ok((volumes, None))
}

/// Projected certs volume. Secret keys are remapped into the file names
/// cockroach expects under its certs directory, with key files locked to 0400.
fn certs_volume(cluster: &Cluster) -> Result<Volume> {
    let node_secret = cluster.node_tls_secret_name()?;
    let client_secret = cluster.client_tls_secret_name(crate::cluster::ROOT_USER)?;

    Ok(Volume {
        name: CERTS_VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o400),
            sources: Some(vec![
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: node_secret,
                        items: Some(vec![
                            KeyToPath {
                                key: CA_CERT_KEY.to_string(),
                                path: "ca.crt".to_string(),
                                ..Default::default()
                            },
                            KeyToPath {
                                key: TLS_CERT_KEY.to_string(),
                                path: "node.crt".to_string(),
                                ..Default::default()
                            },
                            KeyToPath {
                                key: TLS_KEY_KEY.to_string(),
                                path: "node.key".to_string(),
                                mode: Some(0o400),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: client_secret,
                        items: Some(vec![
                            KeyToPath {
                                key: TLS_CERT_KEY.to_string(),
                                path: "client.root.crt".to_string(),
                                ..Default::default()
                            },
                            KeyToPath {
                                key: TLS_KEY_KEY.to_string(),
                                path: "client.root.key".to_string(),
                                mode: Some(0o400),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    })
}
