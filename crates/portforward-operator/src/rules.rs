//! Port-forward rule data model
//!
//! Desired rules ([`PortRule`]) carry a structured [`RuleOwner`] identity
//! alongside the display name written to the router. Rules read back from
//! the router ([`RuleSnapshot`]) only have the display name, so ownership is
//! recovered by parsing that name back into its three components and
//! comparing them field by field. Two services named `api` and
//! `api-service` can therefore never claim each other's rules.
//!
//! The uniqueness key of a rule is the `(external, internal, protocol)`
//! triple ([`RuleKey`]); the router cannot change any of those fields on an
//! existing rule in place.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport protocol of a forwarded port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp_udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    /// Accepts both router spelling (`tcp`) and Kubernetes spelling (`TCP`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp_udp" | "tcp/udp" => Ok(Protocol::TcpUdp),
            other => Err(other.to_string()),
        }
    }
}

/// The `(external, internal, protocol)` triple identifying a rule slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.external_port, self.internal_port, self.protocol
        )
    }
}

/// Namespace + name of a watched Service
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Structured owner identity of a managed rule
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleOwner {
    pub namespace: String,
    pub service: String,
    pub port_name: String,
}

impl RuleOwner {
    pub fn new(service: &ServiceKey, port_name: impl Into<String>) -> Self {
        Self {
            namespace: service.namespace.clone(),
            service: service.name.clone(),
            port_name: port_name.into(),
        }
    }

    /// Name written to the router: `namespace/service:port`
    pub fn display_name(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.service, self.port_name)
    }

    /// Parse a router display name back into an owner.
    ///
    /// Returns `None` for any name not produced by [`RuleOwner::display_name`],
    /// e.g. rules created by hand on the router.
    pub fn parse(name: &str) -> Option<Self> {
        let (namespace, rest) = name.split_once('/')?;
        let (service, port_name) = rest.split_once(':')?;

        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        };
        if !valid(namespace) || !valid(service) || !valid(port_name) {
            return None;
        }

        Some(Self {
            namespace: namespace.to_string(),
            service: service.to_string(),
            port_name: port_name.to_string(),
        })
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.service)
    }

    pub fn belongs_to(&self, service: &ServiceKey) -> bool {
        self.namespace == service.namespace && self.service == service.name
    }
}

impl fmt::Display for RuleOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Router-side configuration of one port-forward rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub name: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub destination: IpAddr,
    pub enabled: bool,
    pub interface: String,
    /// Source restriction (address or CIDR); `None` means any source
    pub source: Option<String>,
}

impl RuleSpec {
    pub fn key(&self) -> RuleKey {
        RuleKey {
            external_port: self.external_port,
            internal_port: self.internal_port,
            protocol: self.protocol,
        }
    }
}

/// A rule as currently configured on the router. Read-only input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSnapshot {
    /// Router-assigned identifier
    pub id: String,
    pub spec: RuleSpec,
}

impl RuleSnapshot {
    pub fn key(&self) -> RuleKey {
        self.spec.key()
    }

    pub fn owner(&self) -> Option<RuleOwner> {
        RuleOwner::parse(&self.spec.name)
    }

    pub fn is_owned_by(&self, service: &ServiceKey) -> bool {
        self.owner().is_some_and(|o| o.belongs_to(service))
    }
}

/// A desired rule produced from a Service's annotation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRule {
    pub owner: RuleOwner,
    pub spec: RuleSpec,
}

impl PortRule {
    pub fn key(&self) -> RuleKey {
        self.spec.key()
    }

    /// Rebuild the desired form of an owned router rule.
    ///
    /// Returns `None` when the rule's name does not parse as an owner.
    pub fn from_snapshot(snapshot: &RuleSnapshot) -> Option<Self> {
        Some(Self {
            owner: snapshot.owner()?,
            spec: snapshot.spec.clone(),
        })
    }
}

/// Field-level difference between a desired rule and a router rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mismatch {
    /// The router rule is not owned by the desired rule's Service
    Ownership,
    Name,
    Ip,
    Enabled,
    Source,
    ExternalPort,
    InternalPort,
    Protocol,
}

impl Mismatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mismatch::Ownership => "ownership",
            Mismatch::Name => "name",
            Mismatch::Ip => "ip",
            Mismatch::Enabled => "enabled",
            Mismatch::Source => "source",
            Mismatch::ExternalPort => "external_port",
            Mismatch::InternalPort => "internal_port",
            Mismatch::Protocol => "protocol",
        }
    }

    /// Port and protocol cannot be changed in place on the router
    pub fn is_risky(&self) -> bool {
        matches!(
            self,
            Mismatch::ExternalPort | Mismatch::InternalPort | Mismatch::Protocol
        )
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compare a desired rule against a router rule.
///
/// Ownership is reported when the router rule does not belong to the desired
/// rule's Service. An empty result means the rule is already converged.
pub fn classify(desired: &PortRule, current: &RuleSnapshot) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    let d = &desired.spec;
    let c = &current.spec;

    if !current.is_owned_by(&desired.owner.service_key()) {
        mismatches.push(Mismatch::Ownership);
    }
    if d.name != c.name {
        mismatches.push(Mismatch::Name);
    }
    if d.destination != c.destination {
        mismatches.push(Mismatch::Ip);
    }
    if d.enabled != c.enabled {
        mismatches.push(Mismatch::Enabled);
    }
    if d.source != c.source {
        mismatches.push(Mismatch::Source);
    }
    if d.external_port != c.external_port {
        mismatches.push(Mismatch::ExternalPort);
    }
    if d.internal_port != c.internal_port {
        mismatches.push(Mismatch::InternalPort);
    }
    if d.protocol != c.protocol {
        mismatches.push(Mismatch::Protocol);
    }

    mismatches
}

/// Whether a set of mismatches requires Delete+Create instead of Update
pub fn is_risky(mismatches: &[Mismatch]) -> bool {
    mismatches.iter().any(Mismatch::is_risky)
}
