//! Router port-forward client
//!
//! Talks to a UniFi-style controller REST API:
//!
//! - `GET    {endpoint}/proxy/network/api/s/{site}/rest/portforward` - List rules
//! - `POST   {endpoint}/proxy/network/api/s/{site}/rest/portforward` - Create rule
//! - `PUT    {endpoint}/proxy/network/api/s/{site}/rest/portforward/{id}` - Update rule
//! - `DELETE {endpoint}/proxy/network/api/s/{site}/rest/portforward/{id}` - Delete rule
//!
//! Every response is wrapped in `{"meta": {"rc": "ok"|"error", "msg": ...}, "data": [...]}`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Certificate, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::rules::{Protocol, RuleSnapshot, RuleSpec};

const API_KEY_HEADER: &str = "X-API-KEY";

/// Operations the reconciliation core needs from the router
///
/// Implemented by [`RestRouterClient`] in production and mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Snapshot of every port-forward rule on the router
    async fn list_rules(&self) -> Result<Vec<RuleSnapshot>, RouterError>;

    /// Create a rule, returning it with its router-assigned ID
    async fn add_rule(&self, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError>;

    /// Overwrite the rule with `id`
    async fn update_rule(&self, id: &str, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError>;

    /// Delete the rule with `id`
    async fn remove_rule(&self, id: &str) -> Result<(), RouterError>;

    /// Returns `Ok(false)` when the router answers but refuses requests
    async fn check_readiness(&self) -> Result<bool, RouterError>;
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Router API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Rule not found: {0}")]
    NotFound(String),
    #[error("Invalid router response: {0}")]
    InvalidResponse(String),
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl RouterError {
    /// Failures worth retrying on a later pass
    pub fn is_transient(&self) -> bool {
        match self {
            RouterError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RouterError::Api { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            RouterError::NotFound(_) | RouterError::InvalidResponse(_) => true,
            RouterError::Config(_) => false,
        }
    }
}

/// Response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    meta: Meta,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    rc: String,
    #[serde(default)]
    msg: Option<String>,
}

/// Rule as serialised by the router
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRule {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_interface")]
    pfwd_interface: String,
    #[serde(default = "default_src")]
    src: String,
    dst_port: String,
    fwd: String,
    fwd_port: String,
    proto: String,
    #[serde(default)]
    log: bool,
}

fn default_interface() -> String {
    "wan".to_string()
}

fn default_src() -> String {
    "any".to_string()
}

impl From<&RuleSpec> for WireRule {
    fn from(spec: &RuleSpec) -> Self {
        Self {
            id: None,
            name: spec.name.clone(),
            enabled: spec.enabled,
            pfwd_interface: spec.interface.clone(),
            src: spec.source.clone().unwrap_or_else(default_src),
            dst_port: spec.external_port.to_string(),
            fwd: spec.destination.to_string(),
            fwd_port: spec.internal_port.to_string(),
            proto: spec.protocol.as_str().to_string(),
            log: false,
        }
    }
}

impl TryFrom<WireRule> for RuleSnapshot {
    type Error = RouterError;

    fn try_from(rule: WireRule) -> Result<Self, Self::Error> {
        let invalid = |field: &str, value: &str| {
            RouterError::InvalidResponse(format!(
                "rule {:?}: invalid {field} {value:?}",
                rule.name
            ))
        };

        let id = rule
            .id
            .clone()
            .ok_or_else(|| RouterError::InvalidResponse(format!("rule {:?} has no _id", rule.name)))?;
        let external_port = rule
            .dst_port
            .parse::<u16>()
            .map_err(|_| invalid("dst_port", &rule.dst_port))?;
        let internal_port = rule
            .fwd_port
            .parse::<u16>()
            .map_err(|_| invalid("fwd_port", &rule.fwd_port))?;
        let destination = rule
            .fwd
            .parse::<IpAddr>()
            .map_err(|_| invalid("fwd", &rule.fwd))?;
        let protocol = rule
            .proto
            .parse::<Protocol>()
            .map_err(|_| invalid("proto", &rule.proto))?;
        let source = Some(rule.src.trim())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("any"))
            .map(str::to_string);

        Ok(RuleSnapshot {
            id,
            spec: RuleSpec {
                name: rule.name,
                external_port,
                internal_port,
                protocol,
                destination,
                enabled: rule.enabled,
                interface: rule.pfwd_interface,
                source,
            },
        })
    }
}

/// Convert a listed rule, skipping shapes this operator never creates
/// (port ranges, hostnames, other protocols)
fn parse_listed(rule: WireRule) -> Option<RuleSnapshot> {
    let id = rule.id.clone().unwrap_or_default();
    let name = rule.name.clone();
    match RuleSnapshot::try_from(rule) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(id = %id, name = %name, error = %e, "Skipping unrecognised router rule");
            None
        }
    }
}

/// REST client for the router's port-forward API
#[derive(Debug)]
pub struct RestRouterClient {
    client: reqwest::Client,
    base_url: String,
}

/// Certificate handling for the router connection
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Skip certificate verification entirely
    pub insecure_skip_verify: bool,
    /// PEM bundle of extra trusted roots (e.g. the controller's self-signed CA)
    pub ca_bundle: Option<String>,
}

impl RestRouterClient {
    /// Create a client for `endpoint` (e.g. `https://192.168.1.1`)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built, the CA bundle
    /// does not parse, or the API key contains invalid header characters.
    pub fn new(
        endpoint: &str,
        site: &str,
        api_key: &str,
        timeout: Duration,
        tls: &TlsOptions,
    ) -> Result<Self, RouterError> {
        let base_url = format!(
            "{}/proxy/network/api/s/{}/rest/portforward",
            endpoint.trim_end_matches('/'),
            site
        );
        Self::new_with_base_url(base_url, api_key, timeout, tls)
    }

    /// Create a client against a full collection URL
    ///
    /// Used by tests to point the client at a mock server.
    pub fn new_with_base_url(
        base_url: impl Into<String>,
        api_key: &str,
        timeout: Duration,
        tls: &TlsOptions,
    ) -> Result<Self, RouterError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| RouterError::Config("API key contains invalid characters".to_string()))?;
        headers.insert(API_KEY_HEADER, key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder().timeout(timeout).default_headers(headers);
        if let Some(pem) = &tls.ca_bundle {
            for cert in Certificate::from_pem_bundle(pem.as_bytes())
                .map_err(|e| RouterError::Config(format!("invalid CA bundle: {e}")))?
            {
                builder = builder.add_root_certificate(cert);
            }
        }
        if tls.insecure_skip_verify {
            warn!("TLS certificate verification disabled for the router connection");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| RouterError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn rule_url(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }

    /// Decode an envelope, mapping `rc: error` and HTTP errors to [`RouterError`]
    async fn decode(response: reqwest::Response, id: Option<&str>) -> Result<Vec<WireRule>, RouterError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RouterError::NotFound(id.unwrap_or("collection").to_string()));
        }

        let body = response.text().await?;
        let envelope: Envelope<WireRule> = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                RouterError::InvalidResponse(e.to_string())
            } else {
                RouterError::Api {
                    status: status.as_u16(),
                    message: body.chars().take(200).collect(),
                }
            }
        })?;

        if envelope.meta.rc != "ok" || !status.is_success() {
            let message = envelope.meta.msg.unwrap_or_else(|| envelope.meta.rc.clone());
            if message.contains("NotFound") {
                return Err(RouterError::NotFound(id.unwrap_or("collection").to_string()));
            }
            return Err(RouterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(envelope.data)
    }

    fn single(mut data: Vec<WireRule>, what: &str) -> Result<RuleSnapshot, RouterError> {
        if data.is_empty() {
            return Err(RouterError::InvalidResponse(format!("{what} returned no rule")));
        }
        data.swap_remove(0).try_into()
    }
}

#[async_trait]
impl RouterClient for RestRouterClient {
    #[instrument(skip(self))]
    async fn list_rules(&self) -> Result<Vec<RuleSnapshot>, RouterError> {
        let response = self.client.get(&self.base_url).send().await?;
        let data = Self::decode(response, None).await?;
        let total = data.len();
        let rules: Vec<RuleSnapshot> = data.into_iter().filter_map(parse_listed).collect();

        debug!(count = rules.len(), skipped = total - rules.len(), "Listed port-forward rules");
        Ok(rules)
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, external_port = spec.external_port))]
    async fn add_rule(&self, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        let response = self
            .client
            .post(&self.base_url)
            .json(&WireRule::from(spec))
            .send()
            .await?;
        let rule = Self::single(Self::decode(response, None).await?, "create")?;

        debug!(id = %rule.id, "Added port-forward rule");
        Ok(rule)
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, external_port = spec.external_port))]
    async fn update_rule(&self, id: &str, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        let mut body = WireRule::from(spec);
        body.id = Some(id.to_string());

        let response = self.client.put(self.rule_url(id)).json(&body).send().await?;
        let data = Self::decode(response, Some(id)).await?;

        // Some controller versions answer an update with an empty data array
        let rule = if data.is_empty() {
            RuleSnapshot {
                id: id.to_string(),
                spec: spec.clone(),
            }
        } else {
            Self::single(data, "update")?
        };

        debug!(id = %rule.id, "Updated port-forward rule");
        Ok(rule)
    }

    #[instrument(skip(self))]
    async fn remove_rule(&self, id: &str) -> Result<(), RouterError> {
        let response = self.client.delete(self.rule_url(id)).send().await?;
        Self::decode(response, Some(id)).await?;

        debug!(id = %id, "Removed port-forward rule");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_readiness(&self) -> Result<bool, RouterError> {
        match self.list_rules().await {
            Ok(_) => Ok(true),
            Err(RouterError::Api { status, message }) => {
                debug!(status, reason = %message, "Router readiness check: NOT READY");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: RouterClient + ?Sized> RouterClient for Arc<T> {
    async fn list_rules(&self) -> Result<Vec<RuleSnapshot>, RouterError> {
        (**self).list_rules().await
    }

    async fn add_rule(&self, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        (**self).add_rule(spec).await
    }

    async fn update_rule(&self, id: &str, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        (**self).update_rule(id, spec).await
    }

    async fn remove_rule(&self, id: &str) -> Result<(), RouterError> {
        (**self).remove_rule(id).await
    }

    async fn check_readiness(&self) -> Result<bool, RouterError> {
        (**self).check_readiness().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures::*;

    fn wire(id: Option<&str>, proto: &str, src: &str) -> WireRule {
        WireRule {
            id: id.map(str::to_string),
            name: "default/web:http".to_string(),
            enabled: true,
            pfwd_interface: "wan".to_string(),
            src: src.to_string(),
            dst_port: "80".to_string(),
            fwd: "10.0.0.5".to_string(),
            fwd_port: "8080".to_string(),
            proto: proto.to_string(),
            log: false,
        }
    }

    #[test]
    fn test_wire_rule_from_spec_uses_string_ports() {
        let spec = spec("default/web:http", 80, 8080, Protocol::TcpUdp, "10.0.0.5");
        let json = serde_json::to_value(WireRule::from(&spec)).unwrap();

        assert_eq!(json["dst_port"], "80");
        assert_eq!(json["fwd_port"], "8080");
        assert_eq!(json["fwd"], "10.0.0.5");
        assert_eq!(json["proto"], "tcp_udp");
        assert_eq!(json["src"], "any");
        assert_eq!(json["pfwd_interface"], "wan");
        assert!(json.get("_id").is_none());
    }

    #[test]
    fn test_snapshot_from_wire_rule() {
        let snapshot = RuleSnapshot::try_from(wire(Some("abc"), "tcp", "any")).unwrap();
        assert_eq!(snapshot.id, "abc");
        assert_eq!(
            snapshot.spec,
            spec("default/web:http", 80, 8080, Protocol::Tcp, "10.0.0.5")
        );
    }

    #[test]
    fn test_snapshot_keeps_source_restriction() {
        let snapshot = RuleSnapshot::try_from(wire(Some("abc"), "udp", "203.0.113.0/24")).unwrap();
        assert_eq!(snapshot.spec.source.as_deref(), Some("203.0.113.0/24"));
        assert_eq!(snapshot.spec.protocol, Protocol::Udp);
    }

    #[test]
    fn test_snapshot_rejects_bad_fields() {
        assert!(matches!(
            RuleSnapshot::try_from(wire(None, "tcp", "any")),
            Err(RouterError::InvalidResponse(_))
        ));
        assert!(matches!(
            RuleSnapshot::try_from(wire(Some("abc"), "icmp", "any")),
            Err(RouterError::InvalidResponse(_))
        ));

        let mut bad_port = wire(Some("abc"), "tcp", "any");
        bad_port.dst_port = "80-90".to_string();
        let err = RuleSnapshot::try_from(bad_port).unwrap_err();
        assert!(err.to_string().contains("dst_port"));
    }

    #[test]
    fn test_base_url_is_built_from_endpoint_and_site() {
        let client =
            RestRouterClient::new("https://192.168.1.1/", "default", "key", Duration::from_secs(5), &TlsOptions::default())
                .unwrap();
        assert_eq!(
            client.base_url,
            "https://192.168.1.1/proxy/network/api/s/default/rest/portforward"
        );
        assert_eq!(
            client.rule_url("abc"),
            "https://192.168.1.1/proxy/network/api/s/default/rest/portforward/abc"
        );
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        let err = RestRouterClient::new(
            "https://router",
            "default",
            "bad\nkey",
            Duration::from_secs(5),
            &TlsOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }

    #[test]
    fn test_invalid_ca_bundle_is_rejected() {
        let tls = TlsOptions {
            insecure_skip_verify: false,
            ca_bundle: Some("-----BEGIN CERTIFICATE-----\nnot base64!\n-----END CERTIFICATE-----\n".to_string()),
        };
        let err = RestRouterClient::new("https://router", "default", "key", Duration::from_secs(5), &tls)
            .unwrap_err();
        assert!(matches!(err, RouterError::Config(message) if message.contains("CA bundle")));
    }

    #[test]
    fn test_listing_skips_unrecognised_rules() {
        let mut range = wire(Some("game"), "tcp", "any");
        range.dst_port = "27015-27030".to_string();

        assert!(parse_listed(range).is_none());
        assert_eq!(parse_listed(wire(Some("abc"), "tcp", "any")).unwrap().id, "abc");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RouterError::Api {
            status: 502,
            message: "bad gateway".to_string()
        }
        .is_transient());
        assert!(!RouterError::Api {
            status: 400,
            message: "api.err.InvalidPayload".to_string()
        }
        .is_transient());
        assert!(!RouterError::Config("x".to_string()).is_transient());
    }
}
