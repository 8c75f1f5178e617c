//! CRD and configuration types

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::client::TlsOptions;

/// Reference to the Kubernetes Secret holding the router API key
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Key inside the Secret's data
    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "api-key".to_string()
}

/// Router connection configuration
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Base URL of the router controller (e.g. `https://192.168.1.1`)
    pub endpoint: String,
    /// Site name on the router controller
    #[serde(default = "default_site")]
    pub site: String,
    /// Secret holding the API key
    pub api_key_secret_ref: SecretKeyReference,
    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    /// Extra trusted CA certificates (PEM) for a self-signed controller
    #[serde(default)]
    pub ca_bundle: Option<String>,
    /// Disable certificate verification; the API key is sent on every request
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl RouterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }

    pub fn tls(&self) -> TlsOptions {
        TlsOptions {
            insecure_skip_verify: self.insecure_skip_verify,
            ca_bundle: self.ca_bundle.clone(),
        }
    }
}

fn default_site() -> String {
    "default".to_string()
}

fn default_timeout() -> u32 {
    30
}

/// Periodic drift reconciliation settings
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Interval between full-fleet drift passes (seconds)
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_seconds: u32,
    /// Maximum number of drift passes allowed to run at once
    #[serde(default = "default_max_concurrent_passes")]
    pub max_concurrent_passes: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            periodic_interval_seconds: default_periodic_interval(),
            max_concurrent_passes: default_max_concurrent_passes(),
        }
    }
}

impl ReconcileConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.periodic_interval_seconds.max(1)))
    }
}

fn default_periodic_interval() -> u32 {
    300 // 5 minutes
}

fn default_max_concurrent_passes() -> u32 {
    3
}

/// Deletion cleanup behavior
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizerConfig {
    /// Cleanup attempts before the finalizer is force-removed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between cleanup attempts (seconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u32,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_seconds: default_retry_interval(),
        }
    }
}

impl FinalizerConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.retry_interval_seconds))
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u32 {
    30
}

/// Values applied to every generated rule
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefaults {
    /// Router interface the rule listens on
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Whether generated rules are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            enabled: default_enabled(),
        }
    }
}

fn default_interface() -> String {
    "wan".to_string()
}

fn default_enabled() -> bool {
    true
}

/// PortForwardConfig spec
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "portforward.router.io",
    version = "v1alpha1",
    kind = "PortForwardConfig",
    plural = "portforwardconfigs",
    shortname = "pfc",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardConfigSpec {
    /// Router connection settings
    pub router: RouterConfig,
    /// Periodic reconciliation
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Finalizer cleanup
    #[serde(default)]
    pub finalizer: FinalizerConfig,
    /// Rule defaults
    #[serde(default)]
    pub defaults: RuleDefaults,
}

/// Finalizer attached to every managed Service
pub const FINALIZER: &str = "portforward.router.io/cleanup";

/// Annotations used by the operator
pub mod annotations {
    /// Port mapping annotation: `http,https:8443`
    pub const PORTS: &str = "portforward.router.io/ports";
    /// Override destination IP address for this Service
    pub const IP_ADDRESS: &str = "portforward.router.io/ip-address";
    /// Optional source restriction applied to every rule
    pub const SOURCE: &str = "portforward.router.io/source";
    /// Last reconciliation failure (JSON)
    pub const ERROR_CONTEXT: &str = "portforward.router.io/error-context";
    /// What changed on the last successful pass (JSON)
    pub const CHANGE_CONTEXT: &str = "portforward.router.io/change-context";
    /// Finalizer cleanup progress (JSON)
    pub const CLEANUP_STATE: &str = "portforward.router.io/cleanup-state";

    /// State annotations the operator writes and clears
    pub const OPERATOR_STATE: [&str; 3] = [ERROR_CONTEXT, CHANGE_CONTEXT, CLEANUP_STATE];
}
