//! Typed view of a watched Service
//!
//! Extracts everything the reconciliation core needs from a `v1/Service`:
//! identity, the port mapping annotation, declared ports and the resolved
//! destination address. The destination is resolved with a fallback chain:
//! 1. `ip-address` annotation override
//! 2. First LoadBalancer ingress IP from status

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{annotations, FINALIZER};
use crate::rules::ServiceKey;

#[derive(Debug, Error)]
pub enum ServiceViewError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid IP address in annotation {key}: {0}", key = annotations::IP_ADDRESS)]
    InvalidIpAddress(String),
}

/// A port declared in the Service spec
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredPort {
    pub name: String,
    pub port: u16,
    /// Kubernetes protocol spelling (`TCP`, `UDP`, ...)
    pub protocol: String,
}

/// Everything the operator reads from one Service
#[derive(Clone, Debug)]
pub struct ManagedService {
    pub key: ServiceKey,
    pub annotations: BTreeMap<String, String>,
    pub ports: Vec<DeclaredPort>,
    pub destination: Option<IpAddr>,
    pub deleting: bool,
    pub has_finalizer: bool,
    pub object_ref: ObjectReference,
}

impl ManagedService {
    pub fn from_service(service: &Service) -> Result<Self, ServiceViewError> {
        let namespace = service
            .metadata
            .namespace
            .clone()
            .ok_or(ServiceViewError::MissingField("metadata.namespace"))?;
        let name = service
            .metadata
            .name
            .clone()
            .ok_or(ServiceViewError::MissingField("metadata.name"))?;

        let annotations = service.annotations().clone();
        let destination = resolve_destination(service, &annotations)?;

        Ok(Self {
            key: ServiceKey::new(namespace, name),
            ports: declared_ports(service),
            destination,
            deleting: service.metadata.deletion_timestamp.is_some(),
            has_finalizer: service.finalizers().iter().any(|f| f == FINALIZER),
            object_ref: service.object_ref(&()),
            annotations,
        })
    }

    /// Raw value of the port mapping annotation
    pub fn port_mapping(&self) -> Option<&str> {
        self.annotations.get(annotations::PORTS).map(String::as_str)
    }

    /// Source restriction annotation, if set to something other than "any"
    pub fn source_restriction(&self) -> Option<String> {
        self.annotations
            .get(annotations::SOURCE)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("any"))
            .map(str::to_string)
    }

    /// Carries the mapping annotation and has somewhere to forward to
    pub fn qualifies(&self) -> bool {
        self.port_mapping().is_some() && self.destination.is_some()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Named ports from the Service spec. Unnamed ports cannot be referenced
/// from the mapping annotation and are skipped.
fn declared_ports(service: &Service) -> Vec<DeclaredPort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let name = p.name.as_ref().filter(|n| !n.is_empty())?;
                    let port = u16::try_from(p.port).ok()?;
                    Some(DeclaredPort {
                        name: name.clone(),
                        port,
                        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the forwarding destination for a Service
fn resolve_destination(
    service: &Service,
    annotations: &BTreeMap<String, String>,
) -> Result<Option<IpAddr>, ServiceViewError> {
    // Explicit override wins over status
    if let Some(ip) = annotations.get(annotations::IP_ADDRESS) {
        if !ip.is_empty() {
            return ip
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| ServiceViewError::InvalidIpAddress(ip.clone()));
        }
    }

    // Only accept an IP: some providers publish a hostname instead, which a
    // port-forward rule cannot target
    let ip = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.iter().find_map(|ing| ing.ip.as_deref()))
        .and_then(|ip| ip.parse::<IpAddr>().ok());

    Ok(ip)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub fn service_port(name: &str, port: i32, protocol: &str) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some(protocol.to_string()),
            ..Default::default()
        }
    }

    pub fn test_service(
        name: &str,
        annotations: BTreeMap<String, String>,
        ports: Vec<ServicePort>,
        lb_ip: Option<&str>,
    ) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(ports),
                ..Default::default()
            }),
            status: lb_ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
        }
    }

    /// LoadBalancer Service `default/{name}` with `http:80` and `https:443`
    pub fn web_service(name: &str, mapping: Option<&str>, lb_ip: Option<&str>) -> Service {
        let mut annots = BTreeMap::new();
        if let Some(mapping) = mapping {
            annots.insert(annotations::PORTS.to_string(), mapping.to_string());
        }
        test_service(
            name,
            annots,
            vec![service_port("http", 80, "TCP"), service_port("https", 443, "TCP")],
            lb_ip,
        )
    }

    pub fn with_finalizer(mut service: Service) -> Service {
        service.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        service
    }

    pub fn deleting(mut service: Service) -> Service {
        service.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        service
    }

    pub fn with_annotation(mut service: Service, key: &str, value: &str) -> Service {
        service
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        service
    }

    pub fn managed(service: &Service) -> ManagedService {
        ManagedService::from_service(service).expect("valid test service")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_view_extracts_identity_and_ports() {
        let svc = web_service("web", Some("http"), Some("10.0.0.5"));
        let view = managed(&svc);

        assert_eq!(view.key, ServiceKey::new("default", "web"));
        assert_eq!(view.ports.len(), 2);
        assert_eq!(view.ports[0].name, "http");
        assert_eq!(view.ports[0].port, 80);
        assert_eq!(view.destination, Some("10.0.0.5".parse().unwrap()));
        assert_eq!(view.port_mapping(), Some("http"));
        assert!(view.qualifies());
        assert!(!view.has_finalizer);
        assert!(!view.deleting);
        assert_eq!(view.object_ref.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_unnamed_ports_are_skipped() {
        let mut port = service_port("", 80, "TCP");
        port.name = None;
        let svc = test_service("web", BTreeMap::new(), vec![port], None);
        assert!(managed(&svc).ports.is_empty());
    }

    #[test]
    fn test_ip_override_takes_precedence() {
        let svc = with_annotation(
            web_service("web", Some("http"), Some("10.0.0.5")),
            annotations::IP_ADDRESS,
            "192.168.1.50",
        );
        assert_eq!(managed(&svc).destination, Some("192.168.1.50".parse().unwrap()));
    }

    #[test]
    fn test_invalid_ip_override_is_an_error() {
        let svc = with_annotation(
            web_service("web", Some("http"), None),
            annotations::IP_ADDRESS,
            "not-an-ip",
        );
        assert!(matches!(
            ManagedService::from_service(&svc),
            Err(ServiceViewError::InvalidIpAddress(_))
        ));
    }

    #[test]
    fn test_invalid_ip_message_names_the_annotation() {
        let err = ServiceViewError::InvalidIpAddress("not-an-ip".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid IP address in annotation portforward.router.io/ip-address: not-an-ip"
        );
    }

    #[test]
    fn test_pending_load_balancer_does_not_qualify() {
        let view = managed(&web_service("web", Some("http"), None));
        assert_eq!(view.destination, None);
        assert!(!view.qualifies());
    }

    #[test]
    fn test_missing_annotation_does_not_qualify() {
        let view = managed(&web_service("web", None, Some("10.0.0.5")));
        assert!(!view.qualifies());
    }

    #[test]
    fn test_finalizer_and_deletion_markers() {
        let svc = deleting(with_finalizer(web_service("web", Some("http"), Some("10.0.0.5"))));
        let view = managed(&svc);
        assert!(view.has_finalizer);
        assert!(view.deleting);
    }

    #[test]
    fn test_source_restriction() {
        let svc = web_service("web", Some("http"), Some("10.0.0.5"));
        assert_eq!(managed(&svc).source_restriction(), None);

        let svc = with_annotation(svc, annotations::SOURCE, "any");
        assert_eq!(managed(&svc).source_restriction(), None);

        let svc = with_annotation(svc, annotations::SOURCE, "203.0.113.0/24");
        assert_eq!(
            managed(&svc).source_restriction(),
            Some("203.0.113.0/24".to_string())
        );
    }
}
