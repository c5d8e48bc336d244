//! Ingress generation for UI, SQL, and gRPC exposure.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule as K8sIngressRule,
    IngressServiceBackend, IngressSpec as K8sIngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::cluster::Cluster;
use crate::controller::Result;
use crate::crd::IngressRule;
use crate::resources::common::{merged, owner_reference, standard_labels};

/// Which endpoint an ingress routes to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngressKind {
    Ui,
    Sql,
    Grpc,
}

impl IngressKind {
    fn suffix(self) -> &'static str {
        match self {
            IngressKind::Ui => "ui",
            IngressKind::Sql => "sql",
            IngressKind::Grpc => "grpc",
        }
    }

    fn port_name(self) -> &'static str {
        match self {
            IngressKind::Ui => "http",
            IngressKind::Sql => "sql",
            IngressKind::Grpc => "grpc",
        }
    }
}

/// All ingresses requested by the spec.
pub fn generate_ingresses(cluster: &Cluster) -> Result<Vec<Ingress>> {
    let Some(ingress) = &cluster.cr().spec.ingress else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    if let Some(rule) = &ingress.ui {
        out.push(generate_ingress(cluster, IngressKind::Ui, rule)?);
    }
    if let Some(rule) = &ingress.sql {
        out.push(generate_ingress(cluster, IngressKind::Sql, rule)?);
    }
    if let Some(rule) = &ingress.grpc {
        out.push(generate_ingress(cluster, IngressKind::Grpc, rule)?);
    }
    Ok(out)
}

fn generate_ingress(cluster: &Cluster, kind: IngressKind, rule: &IngressRule) -> Result<Ingress> {
    let cr = cluster.cr();
    let name = format!("{}-{}", cluster.name()?, kind.suffix());
    let service = cluster.public_service_name()?;

    let mut annotations = BTreeMap::new();
    // SQL and gRPC are raw TLS streams; the proxy must not terminate them.
    if cluster.secure() && kind != IngressKind::Ui {
        annotations.insert(
            "nginx.ingress.kubernetes.io/ssl-passthrough".to_string(),
            "true".to_string(),
        );
    }
    let annotations = merged(annotations, &rule.annotations);

    let tls = if rule.tls.is_empty() {
        None
    } else {
        Some(
            rule.tls
                .iter()
                .map(|secret| IngressTLS {
                    hosts: Some(vec![rule.host.clone()]),
                    secret_name: Some(secret.clone()),
                })
                .collect(),
        )
    };

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cr.namespace(),
            labels: Some(standard_labels(cr)),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(K8sIngressSpec {
            ingress_class_name: rule.ingress_class_name.clone(),
            rules: Some(vec![K8sIngressRule {
                host: Some(rule.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service,
                                port: Some(ServiceBackendPort {
                                    name: Some(kind.port_name().to_string()),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec, IngressSpec};
    use std::sync::Arc;

    fn test_cluster(ingress: Option<IngressSpec>, tls: bool) -> Cluster {
        Cluster::new(Arc::new(CrdbCluster {
            metadata: ObjectMeta {
                name: Some("crdb".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: 3,
                tls_enabled: tls,
                ingress,
                ..Default::default()
            },
            status: None,
        }))
    }

    fn rule(host: &str) -> IngressRule {
        IngressRule {
            host: host.to_string(),
            ingress_class_name: Some("nginx".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_ingress_spec_means_no_ingresses() {
        let out = generate_ingresses(&test_cluster(None, true)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_ui_and_sql_ingresses() {
        let spec = IngressSpec {
            ui: Some(rule("ui.example.com")),
            sql: Some(rule("sql.example.com")),
            grpc: None,
        };
        let out = generate_ingresses(&test_cluster(Some(spec), true)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].metadata.name.as_deref(), Some("crdb-ui"));
        assert_eq!(out[1].metadata.name.as_deref(), Some("crdb-sql"));

        // UI terminates TLS at the proxy; SQL must pass through.
        let ui_annotations = out[0].metadata.annotations.as_ref().unwrap();
        assert!(!ui_annotations.contains_key("nginx.ingress.kubernetes.io/ssl-passthrough"));
        let sql_annotations = out[1].metadata.annotations.as_ref().unwrap();
        assert_eq!(
            sql_annotations["nginx.ingress.kubernetes.io/ssl-passthrough"],
            "true"
        );
    }

    #[test]
    fn test_backend_targets_public_service() {
        let spec = IngressSpec {
            ui: Some(rule("ui.example.com")),
            sql: None,
            grpc: None,
        };
        let out = generate_ingresses(&test_cluster(Some(spec), false)).unwrap();
        let rules = out[0].spec.as_ref().unwrap().rules.as_ref().unwrap();
        let backend = &rules[0].http.as_ref().unwrap().paths[0].backend;
        let service = backend.service.as_ref().unwrap();
        assert_eq!(service.name, "crdb-public");
        assert_eq!(
            service.port.as_ref().unwrap().name.as_deref(),
            Some("http")
        );
    }

    #[test]
    fn test_tls_section() {
        let mut sql_rule = rule("sql.example.com");
        sql_rule.tls = vec!["sql-tls".to_string()];
        let spec = IngressSpec {
            ui: None,
            sql: Some(sql_rule),
            grpc: None,
        };
        let out = generate_ingresses(&test_cluster(Some(spec), true)).unwrap();
        let tls = out[0].spec.as_ref().unwrap().tls.as_ref().unwrap();
        assert_eq!(tls[0].secret_name.as_deref(), Some("sql-tls"));
        assert_eq!(
            tls[0].hosts.as_ref().unwrap(),
            &vec!["sql.example.com".to_string()]
        );
    }
}
