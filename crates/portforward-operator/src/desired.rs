//! Desired state calculation
//!
//! Turns a Service's port mapping annotation into [`PortRule`]s. The
//! annotation is a comma-separated list of `portName` or
//! `portName:externalPort` tokens:
//!
//! - `http` forwards the declared `http` port on the same external port
//! - `http:8080` forwards the declared `http` port from external port 8080
//!
//! External ports are reserved in a [`PortRegistry`] shared by every
//! reconciliation entry point, so two Services can never claim the same
//! external port.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RuleDefaults;
use crate::rules::{PortRule, Protocol, RuleOwner, RuleSpec, ServiceKey};
use crate::service::{DeclaredPort, ManagedService};

static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?)(?::([0-9]+))?$").expect("valid regex")
});

const VALID_EXAMPLES: &str = r#""http", "http:8080", "http,https:8443""#;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DesiredStateError {
    #[error("invalid port mapping {token:?}: {reason} (valid examples: {examples})", examples = VALID_EXAMPLES)]
    Parse { token: String, reason: String },
    #[error("external port {port} for {port_name:?} is out of range (1-65535)")]
    PortOutOfRange { port_name: String, port: String },
    #[error("port {port_name:?} is not declared on the Service (available: {available})")]
    UnknownPort { port_name: String, available: String },
    #[error("external port {0} is mapped more than once")]
    DuplicatePort(u16),
    #[error("port {0:?} is mapped more than once")]
    DuplicatePortName(String),
    #[error("unsupported protocol {protocol} on port {port_name:?}")]
    UnsupportedProtocol { port_name: String, protocol: String },
    #[error("Service has no resolved destination address")]
    NoDestination,
    #[error("port already claimed: external port {port} is used by {claimed_by}")]
    PortConflict { port: u16, claimed_by: ServiceKey },
}

impl DesiredStateError {
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, DesiredStateError::PortConflict { .. })
    }
}

/// One parsed annotation token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub port_name: String,
    /// Explicit external port, `None` to reuse the declared port number
    pub external_port: Option<u16>,
}

/// Parse the port mapping annotation
pub fn parse_port_mapping(annotation: &str) -> Result<Vec<PortMapping>, DesiredStateError> {
    if annotation.trim().is_empty() {
        return Err(DesiredStateError::Parse {
            token: annotation.to_string(),
            reason: "annotation is empty".to_string(),
        });
    }

    annotation
        .split(',')
        .map(str::trim)
        .map(|token| {
            let caps = TOKEN_REGEX
                .captures(token)
                .ok_or_else(|| DesiredStateError::Parse {
                    token: token.to_string(),
                    reason: "expected portName or portName:externalPort".to_string(),
                })?;

            let port_name = caps[1].to_string();
            let external_port = match caps.get(3) {
                None => None,
                Some(raw) => {
                    let port = raw
                        .as_str()
                        .parse::<u16>()
                        .ok()
                        .filter(|p| *p >= 1)
                        .ok_or_else(|| DesiredStateError::PortOutOfRange {
                            port_name: port_name.clone(),
                            port: raw.as_str().to_string(),
                        })?;
                    Some(port)
                }
            };

            Ok(PortMapping {
                port_name,
                external_port,
            })
        })
        .collect()
}

/// Process-wide reservation of external ports
#[derive(Debug, Default)]
pub struct PortRegistry {
    claims: RwLock<HashMap<u16, ServiceKey>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `ports` for `service`.
    ///
    /// All-or-nothing: if any port is held by another Service nothing is
    /// claimed. Ports already held by `service` are kept.
    pub fn claim(&self, service: &ServiceKey, ports: &BTreeSet<u16>) -> Result<(), DesiredStateError> {
        let mut claims = self.claims.write();

        if let Some((port, holder)) = ports
            .iter()
            .find_map(|p| claims.get(p).filter(|h| *h != service).map(|h| (*p, h)))
        {
            return Err(DesiredStateError::PortConflict {
                port,
                claimed_by: holder.clone(),
            });
        }

        for port in ports {
            claims.insert(*port, service.clone());
        }
        Ok(())
    }

    /// Release ports held by `service` that are not in `keep`
    pub fn retain_only(&self, service: &ServiceKey, keep: &BTreeSet<u16>) -> usize {
        let mut claims = self.claims.write();
        let before = claims.len();
        claims.retain(|port, holder| holder != service || keep.contains(port));
        before - claims.len()
    }

    /// Release one port if `service` holds it
    pub fn release_port(&self, port: u16, service: &ServiceKey) -> bool {
        let mut claims = self.claims.write();
        if claims.get(&port) == Some(service) {
            claims.remove(&port);
            true
        } else {
            false
        }
    }

    /// Release every port held by `service`
    pub fn release_service(&self, service: &ServiceKey) -> usize {
        let released = self.retain_only(service, &BTreeSet::new());
        if released > 0 {
            info!(service = %service, released, "Released external port reservations");
        }
        released
    }

    pub fn holder(&self, port: u16) -> Option<ServiceKey> {
        self.claims.read().get(&port).cloned()
    }

    pub fn ports_of(&self, service: &ServiceKey) -> BTreeSet<u16> {
        self.claims
            .read()
            .iter()
            .filter(|(_, holder)| *holder == service)
            .map(|(port, _)| *port)
            .collect()
    }
}

/// Computes the desired rule set for one Service
pub struct DesiredStateCalculator {
    registry: Arc<PortRegistry>,
    defaults: RuleDefaults,
}

impl DesiredStateCalculator {
    pub fn new(registry: Arc<PortRegistry>, defaults: RuleDefaults) -> Self {
        Self { registry, defaults }
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Desired rules for `service`, reserving their external ports.
    ///
    /// A Service without the mapping annotation has no desired rules.
    pub fn calculate(&self, service: &ManagedService) -> Result<Vec<PortRule>, DesiredStateError> {
        let rules = self.build_rules(service)?;
        let ports: BTreeSet<u16> = rules.iter().map(|r| r.spec.external_port).collect();
        self.registry.claim(&service.key, &ports)?;
        Ok(rules)
    }

    /// Desired rules for `service` without touching the registry
    pub fn build_rules(&self, service: &ManagedService) -> Result<Vec<PortRule>, DesiredStateError> {
        let Some(annotation) = service.port_mapping() else {
            return Ok(Vec::new());
        };
        let destination = service.destination.ok_or(DesiredStateError::NoDestination)?;
        let mappings = parse_port_mapping(annotation)?;
        let source = service.source_restriction();

        let mut seen_names = HashSet::new();
        let mut seen_ports = HashSet::new();
        let mut rules = Vec::with_capacity(mappings.len());

        for mapping in mappings {
            let declared = find_declared(&service.ports, &mapping.port_name)?;

            if !seen_names.insert(mapping.port_name.clone()) {
                return Err(DesiredStateError::DuplicatePortName(mapping.port_name));
            }

            let external_port = mapping.external_port.unwrap_or(declared.port);
            if !seen_ports.insert(external_port) {
                return Err(DesiredStateError::DuplicatePort(external_port));
            }

            let protocol = declared.protocol.parse::<Protocol>().map_err(|protocol| {
                DesiredStateError::UnsupportedProtocol {
                    port_name: declared.name.clone(),
                    protocol,
                }
            })?;

            rules.push(self.rule(service, declared, external_port, protocol, destination, &source));
        }

        debug!(service = %service.key, rules = rules.len(), "Computed desired rules");
        Ok(rules)
    }

    fn rule(
        &self,
        service: &ManagedService,
        declared: &DeclaredPort,
        external_port: u16,
        protocol: Protocol,
        destination: IpAddr,
        source: &Option<String>,
    ) -> PortRule {
        let owner = RuleOwner::new(&service.key, &declared.name);
        PortRule {
            spec: RuleSpec {
                name: owner.display_name(),
                external_port,
                internal_port: declared.port,
                protocol,
                destination,
                enabled: self.defaults.enabled,
                interface: self.defaults.interface.clone(),
                source: source.clone(),
            },
            owner,
        }
    }
}

fn find_declared<'a>(
    ports: &'a [DeclaredPort],
    name: &str,
) -> Result<&'a DeclaredPort, DesiredStateError> {
    ports
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| DesiredStateError::UnknownPort {
            port_name: name.to_string(),
            available: if ports.is_empty() {
                "none".to_string()
            } else {
                ports
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        })
}
