//! Service generation for CockroachDB clusters.
//!
//! Creates two services:
//! - **Discovery Service**: Headless, backs the StatefulSet's stable DNS names
//! - **Public Service**: Load-balanced entry point for SQL and the admin UI

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::controller::Result;
use crate::resources::common::{
    merged, owner_reference, selector_labels, standard_annotations, standard_labels,
};

/// Generate the headless discovery Service.
///
/// The discovery service provides:
/// - DNS records for each pod (pod-0.cluster.ns.svc.cluster.local)
/// - No load balancing (direct pod access)
/// - `publishNotReadyAddresses: true` so joining nodes resolve peers that
///   are not ready yet
/// - Prometheus scrape annotations pointing at the cockroach status endpoint
pub fn generate_discovery_service(cluster: &Cluster) -> Result<Service> {
    let cr = cluster.cr();
    let name = cluster.discovery_service_name()?;
    let mut labels = standard_labels(cr);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        "discovery".to_string(),
    );

    let mut scrape = std::collections::BTreeMap::new();
    scrape.insert("prometheus.io/scrape".to_string(), "true".to_string());
    scrape.insert("prometheus.io/path".to_string(), "_status/vars".to_string());
    scrape.insert(
        "prometheus.io/port".to_string(),
        cr.spec.http_port.to_string(),
    );
    let annotations = merged(scrape, &standard_annotations(cr));

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cr.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            // Headless service (no cluster IP)
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels(cr)),
            ports: Some(service_ports(cluster, false)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generate the public Service for client connections.
pub fn generate_public_service(cluster: &Cluster) -> Result<Service> {
    let cr = cluster.cr();
    let name = cluster.public_service_name()?;
    let mut labels = standard_labels(cr);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        "public".to_string(),
    );
    let annotations = standard_annotations(cr);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cr.namespace(),
            labels: Some(labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(cr)),
            ports: Some(service_ports(cluster, true)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn named_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service_ports(cluster: &Cluster, include_sql: bool) -> Vec<ServicePort> {
    let cr = cluster.cr();
    let mut ports = vec![
        named_port("grpc", cr.spec.grpc_port),
        named_port("http", cr.spec.http_port),
    ];
    if include_sql {
        ports.push(named_port("sql", cr.spec.sql_port));
    }
    ports
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec};
    use std::sync::Arc;

    fn test_cluster(name: &str) -> Cluster {
        Cluster::new(Arc::new(CrdbCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
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
    fn test_generate_discovery_service() {
        let svc = generate_discovery_service(&test_cluster("my-cluster")).unwrap();

        assert_eq!(svc.metadata.name, Some("my-cluster".to_string()));
        assert_eq!(svc.metadata.namespace, Some("default".to_string()));

        let annotations = svc.metadata.annotations.unwrap();
        assert_eq!(annotations["prometheus.io/scrape"], "true");
        assert_eq!(annotations["prometheus.io/path"], "_status/vars");
        assert_eq!(annotations["prometheus.io/port"], "8080");

        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip, Some("None".to_string()));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));

        // Peer discovery only needs grpc and http; SQL goes through the
        // public service.
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().any(|p| p.name == Some("grpc".to_string())));
        assert!(!ports.iter().any(|p| p.name == Some("sql".to_string())));
    }

    #[test]
    fn test_generate_public_service() {
        let svc = generate_public_service(&test_cluster("my-cluster")).unwrap();

        assert_eq!(svc.metadata.name, Some("my-cluster-public".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));

        // grpc must be here: the gRPC ingress backend targets this service
        // by port name.
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().any(|p| p.name == Some("grpc".to_string())));
        assert!(ports.iter().any(|p| p.port == 26257));
    }

    #[test]
    fn test_service_type_labels() {
        let discovery = generate_discovery_service(&test_cluster("c")).unwrap();
        let public = generate_public_service(&test_cluster("c")).unwrap();
        assert_eq!(
            discovery.metadata.labels.unwrap()["app.kubernetes.io/service-type"],
            "discovery"
        );
        assert_eq!(
            public.metadata.labels.unwrap()["app.kubernetes.io/service-type"],
            "public"
        );
    }
}
