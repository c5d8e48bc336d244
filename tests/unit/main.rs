// Test code is allowed to panic on failure
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

//! Unit tests for cockroach-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components through the public API.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use cockroach_operator::cluster::Cluster;
use cockroach_operator::crd::{CrdbCluster, CrdbClusterSpec, ImageSpec, VolumeClaimSpec};

fn test_cluster(mutate: impl FnOnce(&mut CrdbCluster)) -> Cluster {
    let mut cr = CrdbCluster {
        metadata: ObjectMeta {
            name: Some("crdb".to_string()),
            namespace: Some("test-ns".to_string()),
            uid: Some("uid-1234".to_string()),
            ..Default::default()
        },
        spec: CrdbClusterSpec {
            nodes: 3,
            image: ImageSpec {
                name: "cockroachdb/cockroach:v24.2.2".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    };
    mutate(&mut cr);
    Cluster::new(Arc::new(cr))
}

mod crd_tests {
    use super::*;
    use cockroach_operator::crd::{
        ActionType, ClusterConditionType, ClusterStatus, ConditionStatus,
    };
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_identity() {
        let crd = CrdbCluster::crd();
        assert_eq!(crd.spec.group, "crdb.cockroachlabs.com");
        assert_eq!(crd.spec.names.plural, "crdbclusters");
        assert_eq!(crd.spec.names.kind, "CrdbCluster");
        assert!(
            crd.spec
                .names
                .short_names
                .as_ref()
                .unwrap()
                .contains(&"crdb".to_string())
        );
    }

    #[test]
    fn test_condition_type_display() {
        assert_eq!(ClusterConditionType::Initialized.to_string(), "Initialized");
        assert_eq!(
            ClusterConditionType::CrdbVersionChecked.to_string(),
            "CrdbVersionChecked"
        );
        assert_eq!(
            ClusterConditionType::ClusterRestart.to_string(),
            "ClusterRestart"
        );
    }

    #[test]
    fn test_action_order_starts_with_version_check() {
        assert_eq!(ActionType::ORDERED[0], ActionType::VersionCheck);
        assert_eq!(ActionType::ORDERED[1], ActionType::ClusterRestart);
        assert_eq!(ActionType::ORDERED[2], ActionType::Deploy);
        assert!(!ActionType::ORDERED.contains(&ActionType::GenerateCert));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ClusterStatus::default(), ClusterStatus::Starting);
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
        let spec = CrdbClusterSpec::default();
        assert_eq!(spec.grpc_port, 26258);
        assert_eq!(spec.sql_port, 26257);
        assert_eq!(spec.http_port, 8080);
        assert_eq!(spec.cache, "25%");
        assert_eq!(spec.max_sql_memory, "25%");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let mut spec = CrdbClusterSpec::default();
        spec.cockroach_db_version = "v24.2.2".to_string();
        spec.node_tls_secret = "custom-certs".to_string();
        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("cockroachDBVersion").is_some());
        assert!(value.get("nodeTLSSecret").is_some());
        assert!(value.get("sqlPort").is_some());
    }
}

mod cluster_tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        let cluster = test_cluster(|_| {});
        assert_eq!(cluster.statefulset_name().unwrap(), "crdb");
        assert_eq!(cluster.public_service_name().unwrap(), "crdb-public");
        assert_eq!(cluster.node_tls_secret_name().unwrap(), "crdb-node");
        assert_eq!(cluster.client_tls_secret_name("root").unwrap(), "crdb-root");
    }

    #[test]
    fn test_user_supplied_secret_names_win() {
        let cluster = test_cluster(|cr| {
            cr.spec.tls_enabled = true;
            cr.spec.node_tls_secret = "my-node-certs".to_string();
        });
        assert_eq!(cluster.node_tls_secret_name().unwrap(), "my-node-certs");
        assert!(!cluster.operator_managed_certs());
    }

    #[test]
    fn test_pod_fqdn_uses_discovery_service() {
        let cluster = test_cluster(|_| {});
        assert_eq!(cluster.pod_fqdn(2).unwrap(), "crdb-2.crdb.test-ns");
    }

    #[test]
    fn test_node_dns_names_include_wildcard() {
        let cluster = test_cluster(|_| {});
        let names = cluster.node_dns_names().unwrap();
        assert!(names.contains(&"localhost".to_string()));
        assert!(names.contains(&"crdb-public".to_string()));
        assert!(names.contains(&"*.crdb.test-ns.svc.cluster.local".to_string()));
    }
}

mod version_tests {
    use cockroach_operator::version;

    #[test]
    fn test_env_var_name_mapping() {
        assert_eq!(
            version::env_var_for_version("v24.2.2"),
            "RELATED_IMAGE_COCKROACH_v24_2_2"
        );
    }

    #[test]
    fn test_image_name_splitting() {
        assert_eq!(
            version::image_name_without_version("cockroachdb/cockroach:v24.2.2"),
            "cockroachdb/cockroach"
        );
        assert_eq!(
            version::image_tag("cockroachdb/cockroach:v24.2.2"),
            Some("v24.2.2")
        );
        // Registry ports must not be mistaken for tags.
        assert_eq!(
            version::image_tag("registry.local:5000/cockroach"),
            None
        );
    }

    #[test]
    fn test_train_skip_detection() {
        let from = version::parse_version("v23.1.11").unwrap();
        let hop = version::parse_version("v23.2.4").unwrap();
        let skip = version::parse_version("v24.1.5").unwrap();
        assert!(!version::skips_release_train(&from, &hop));
        assert!(version::skips_release_train(&from, &skip));
    }
}

mod feature_tests {
    use cockroach_operator::features::{Feature, parse_feature_gates};

    #[test]
    fn test_parse_valid_gates() {
        let gates = parse_feature_gates("AutoPrunePVC=true,UseDecommission=false").unwrap();
        assert_eq!(gates.get(&Feature::AutoPrunePVC), Some(&true));
        assert_eq!(gates.get(&Feature::UseDecommission), Some(&false));
    }

    #[test]
    fn test_unknown_gate_rejected() {
        assert!(parse_feature_gates("NoSuchGate=true").is_err());
        assert!(parse_feature_gates("AutoPrunePVC=maybe").is_err());
    }
}

mod resource_tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use cockroach_operator::cluster::{CONTAINER_IMAGE_ANNOTATION, VERSION_ANNOTATION};
    use cockroach_operator::resources::{ingress, pdb, services, statefulset};
    use serde_json::json;

    fn checked_cluster() -> Cluster {
        test_cluster(|cr| {
            let annotations = cr.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(
                CONTAINER_IMAGE_ANNOTATION.to_string(),
                "cockroachdb/cockroach:v24.2.2".to_string(),
            );
            annotations.insert(VERSION_ANNOTATION.to_string(), "v24.2.2".to_string());
        })
    }

    #[test]
    fn test_statefulset_requires_validated_image() {
        let cluster = test_cluster(|_| {});
        assert!(statefulset::generate_statefulset(&cluster).is_err());
    }

    #[test]
    fn test_statefulset_shape() {
        let sts = statefulset::generate_statefulset(&checked_cluster()).unwrap();
        let value = serde_json::to_value(&sts).unwrap();
        assert_json_include!(
            actual: value,
            expected: json!({
                "metadata": { "name": "crdb", "namespace": "test-ns" },
                "spec": {
                    "serviceName": "crdb",
                    "replicas": 3,
                }
            })
        );
        let containers = &sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers;
        assert_eq!(containers[0].name, "db");
        assert_eq!(
            containers[0].image.as_deref(),
            Some("cockroachdb/cockroach:v24.2.2")
        );
    }

    #[test]
    fn test_start_command_join_list_capped_at_three() {
        let cluster = test_cluster(|cr| {
            cr.spec.nodes = 5;
            let annotations = cr.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(
                CONTAINER_IMAGE_ANNOTATION.to_string(),
                "cockroachdb/cockroach:v24.2.2".to_string(),
            );
        });
        let sts = statefulset::generate_statefulset(&cluster).unwrap();
        let command = serde_json::to_string(&sts).unwrap();
        assert!(command.contains("crdb-2.crdb.test-ns"));
        assert!(!command.contains("crdb-3.crdb.test-ns"));
    }

    #[test]
    fn test_public_service_exposes_grpc_http_and_sql() {
        let svc = services::generate_public_service(&test_cluster(|_| {})).unwrap();
        let ports = svc.spec.as_ref().unwrap().ports.as_ref().unwrap();
        for name in ["grpc", "http", "sql"] {
            assert!(
                ports.iter().any(|p| p.name.as_deref() == Some(name)),
                "public service is missing the {name} port"
            );
        }
    }

    #[test]
    fn test_grpc_ingress_targets_a_port_the_public_service_defines() {
        let cluster = test_cluster(|cr| {
            cr.spec.ingress = Some(cockroach_operator::crd::IngressSpec {
                grpc: Some(cockroach_operator::crd::IngressRule {
                    host: "grpc.example.com".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        });
        let svc = services::generate_public_service(&cluster).unwrap();
        let port_names: Vec<_> = svc
            .spec
            .unwrap()
            .ports
            .unwrap()
            .into_iter()
            .filter_map(|p| p.name)
            .collect();

        let list = ingress::generate_ingresses(&cluster).unwrap();
        let backend_port = list[0].spec.as_ref().unwrap().rules.as_ref().unwrap()[0]
            .http
            .as_ref()
            .unwrap()
            .paths[0]
            .backend
            .service
            .as_ref()
            .unwrap()
            .port
            .as_ref()
            .unwrap()
            .name
            .clone()
            .unwrap();
        assert!(port_names.contains(&backend_port));
    }

    #[test]
    fn test_discovery_service_is_headless() {
        let svc = services::generate_discovery_service(&test_cluster(|_| {})).unwrap();
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_pdb_defaults_to_max_unavailable_one() {
        let pdb = pdb::generate_pod_disruption_budget(&test_cluster(|_| {})).unwrap();
        let spec = pdb.spec.as_ref().unwrap();
        assert!(spec.min_available.is_none());
        assert!(spec.max_unavailable.is_some());
    }

    #[test]
    fn test_no_ingresses_without_spec() {
        let list = ingress::generate_ingresses(&test_cluster(|_| {})).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_ui_ingress_routes_to_public_service() {
        let cluster = test_cluster(|cr| {
            cr.spec.ingress = Some(cockroach_operator::crd::IngressSpec {
                ui: Some(cockroach_operator::crd::IngressRule {
                    host: "ui.example.com".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        });
        let list = ingress::generate_ingresses(&cluster).unwrap();
        assert_eq!(list.len(), 1);
        let value = serde_json::to_value(&list[0]).unwrap();
        assert_json_include!(
            actual: value,
            expected: json!({
                "metadata": { "name": "crdb-ui" },
                "spec": {
                    "rules": [{
                        "host": "ui.example.com",
                        "http": { "paths": [{
                            "backend": { "service": { "name": "crdb-public" } }
                        }]}
                    }]
                }
            })
        );
    }
}

mod storage_tests {
    use super::*;
    use cockroach_operator::actors::resize_pvc::parse_quantity;

    #[test]
    fn test_quantity_ordering_for_resize_decisions() {
        let old = parse_quantity("10Gi").unwrap();
        let new = parse_quantity("20Gi").unwrap();
        assert!(new > old);
    }

    #[test]
    fn test_default_volume_claim_storage() {
        let claim = VolumeClaimSpec::default();
        assert_eq!(claim.resources.requests.storage, "10Gi");
    }
}

mod webhook_policy_tests {
    use super::*;
    use cockroach_operator::webhooks::policies::{ValidationContext, validate_all};

    #[test]
    fn test_valid_cluster_admitted() {
        let cluster = test_cluster(|_| {});
        let result = validate_all(&ValidationContext {
            cluster: cluster.cr(),
            old_cluster: None,
            dry_run: false,
            namespace: Some("test-ns"),
        });
        assert!(result.allowed);
    }

    #[test]
    fn test_shrinking_storage_denied() {
        let old = test_cluster(|cr| {
            let mut claim = VolumeClaimSpec::default();
            claim.resources.requests.storage = "50Gi".to_string();
            cr.spec.data_store.volume_claim = Some(claim);
        });
        let new = test_cluster(|cr| {
            let mut claim = VolumeClaimSpec::default();
            claim.resources.requests.storage = "20Gi".to_string();
            cr.spec.data_store.volume_claim = Some(claim);
        });
        let result = validate_all(&ValidationContext {
            cluster: new.cr(),
            old_cluster: Some(old.cr()),
            dry_run: false,
            namespace: Some("test-ns"),
        });
        assert!(!result.allowed);
        assert_eq!(result.reason.unwrap(), "StorageShrink");
    }
}

mod node_status_tests {
    use cockroach_operator::db::node_status::{find_node_by_host, parse_node_statuses};

    const CSV: &str = "\
id,address,sql_address,build,started_at,updated_at,locality,is_available,is_live,replicas,is_decommissioning,membership,is_draining
1,crdb-0.crdb.test-ns:26258,crdb-0.crdb.test-ns:26257,v24.2.2,2026-01-01,2026-01-02,region=a,true,true,24,false,active,false
2,crdb-1.crdb.test-ns:26258,crdb-1.crdb.test-ns:26257,v24.2.2,2026-01-01,2026-01-02,region=a,true,true,0,true,decommissioning,true
";

    #[test]
    fn test_parse_and_find() {
        let statuses = parse_node_statuses(CSV).unwrap();
        assert_eq!(statuses.len(), 2);

        let node = find_node_by_host(&statuses, "crdb-1.crdb.test-ns").unwrap();
        assert_eq!(node.node_id, 2);
        assert!(node.is_decommissioning);
        assert!(node.drained());

        let node = find_node_by_host(&statuses, "crdb-0.crdb.test-ns").unwrap();
        assert!(!node.drained());
    }
}
