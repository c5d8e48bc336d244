//! Version-check Job generation.
//!
//! Before any image reaches the StatefulSet the operator runs it once in a
//! throwaway Job that prints `cockroach version`. The job's pod logs reveal
//! the actual build tag, which is what gets recorded in status, so a
//! mislabeled image can never lie about its version.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::controller::Result;
use crate::resources::common::{owner_reference, standard_labels};

/// Container name inside the version-check pod.
pub const VCHECK_CONTAINER_NAME: &str = "crdb";

/// Finished jobs are garbage-collected after five minutes even if the
/// operator crashes before deleting them.
const JOB_TTL_SECONDS: i32 = 300;

/// Generate the version-check Job for an image. The job name is
/// deterministic so concurrent reconciles collapse onto one job.
pub fn generate_vcheck_job(cluster: &Cluster, image: &str) -> Result<Job> {
    let cr = cluster.cr();
    let labels = standard_labels(cr);

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(cluster.vcheck_job_name()?),
            namespace: cr.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: VCHECK_CONTAINER_NAME.to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some(cr.spec.image.pull_policy.clone()),
                        command: Some(vec![
                            "/bin/bash".to_string(),
                            "-c".to_string(),
                            "/cockroach/cockroach version".to_string(),
                        ]),
                        ..Default::default()
                    }],
                    image_pull_secrets: cr.spec.image.pull_secret.as_ref().map(|secret| {
                        vec![k8s_openapi::api::core::v1::LocalObjectReference {
                            name: secret.clone(),
                        }]
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Extract the build tag from `cockroach version` output.
///
/// ```text
/// Build Tag:        v24.2.2
/// Build Time:       2024/09/12 ...
/// ```
pub fn parse_build_tag(logs: &str) -> Option<String> {
    logs.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Build Tag:")
            .map(|tag| tag.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec};
    use std::sync::Arc;

    fn test_cluster() -> Cluster {
        Cluster::new(Arc::new(CrdbCluster {
            metadata: ObjectMeta {
                name: Some("crdb".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: 3,
                ..Default::default()
            },
            status: None,
        }))
    }

    #[test]
    fn test_job_shape() {
        let job =
            generate_vcheck_job(&test_cluster(), "cockroachdb/cockroach:v24.2.2").unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("crdb-vcheck"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("cockroachdb/cockroach:v24.2.2")
        );
        assert!(pod.containers[0]
            .command
            .as_ref()
            .unwrap()
            .iter()
            .any(|c| c.contains("cockroach version")));
    }

    #[test]
    fn test_parse_build_tag() {
        let logs = "\
Build Tag:        v24.2.2
Build Time:       2024/09/12 12:00:00
Distribution:     CCL
";
        assert_eq!(parse_build_tag(logs).as_deref(), Some("v24.2.2"));
    }

    #[test]
    fn test_parse_build_tag_missing() {
        assert_eq!(parse_build_tag("no version output here"), None);
        assert_eq!(parse_build_tag(""), None);
    }
}
