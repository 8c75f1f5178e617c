//! Records persisted on the Service between passes
//!
//! Both records are stored as JSON annotations. Readers must accept payloads
//! written by older versions, so every field has a default and unknown
//! fields are ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::operation::OperationSummary;
use crate::service::{DeclaredPort, ManagedService};

/// Error taxonomy surfaced to operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or ambiguous desired input; never retried
    Validation,
    /// External port claimed by another Service; not retried
    PortConflict,
    /// A router call failed and the pass was rolled back
    RouterOperation,
    /// Router failure while cleaning up a deleted Service
    Cleanup,
    /// A compensating call failed during rollback
    Rollback,
    /// Reading or patching the Service failed
    Store,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::PortConflict => "port_conflict",
            ErrorClass::RouterOperation => "router_operation",
            ErrorClass::Cleanup => "cleanup",
            ErrorClass::Rollback => "rollback",
            ErrorClass::Store => "store",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    /// Will be retried on a later pass
    #[default]
    Retrying,
    /// Waiting for the Service to change
    Rejected,
}

/// Latest reconcile failure, inspectable without log access
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub code: ErrorClass,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: ErrorStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_operations: Vec<OperationSummary>,
}

impl ErrorContext {
    /// Build the next error context, continuing the retry count of `previous`.
    ///
    /// `failures` is the number of failed passes since `previous` was
    /// written, this one included.
    pub fn next(
        previous: Option<&ErrorContext>,
        failures: u32,
        code: ErrorClass,
        message: impl Into<String>,
        status: ErrorStatus,
        failed_operations: Vec<OperationSummary>,
    ) -> Self {
        let failures = failures.max(1);
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            retry_count: previous.map_or(failures - 1, |p| p.retry_count.saturating_add(failures)),
            status,
            failed_operations,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortChangeType {
    Added,
    Removed,
    Modified,
}

/// Difference in one declared Service port between two passes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange {
    pub change_type: PortChangeType,
    pub port_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_protocol: Option<String>,
}

/// What changed on the Service since the last successful pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeContext {
    pub ip_changed: bool,
    pub old_ip: Option<String>,
    pub new_ip: Option<String>,
    pub annotation_changed: bool,
    pub old_annotation: Option<String>,
    pub new_annotation: Option<String>,
    pub spec_changed: bool,
    pub port_changes: Vec<PortChange>,
    pub service_key: String,
    /// Ports seen on the last successful pass
    pub observed_ports: Vec<DeclaredPort>,
}

impl ChangeContext {
    /// Compare `service` against the context stored by the previous pass
    pub fn compute(previous: Option<&ChangeContext>, service: &ManagedService) -> Self {
        let empty = ChangeContext::default();
        let previous = previous.unwrap_or(&empty);

        let new_ip = service.destination.map(|ip| ip.to_string());
        let new_annotation = service.port_mapping().map(str::to_string);
        let port_changes = port_changes(&previous.observed_ports, &service.ports);

        Self {
            ip_changed: previous.new_ip != new_ip,
            old_ip: previous.new_ip.clone(),
            new_ip,
            annotation_changed: previous.new_annotation != new_annotation,
            old_annotation: previous.new_annotation.clone(),
            new_annotation,
            spec_changed: !port_changes.is_empty(),
            port_changes,
            service_key: service.key.to_string(),
            observed_ports: service.ports.clone(),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.ip_changed || self.annotation_changed || self.spec_changed
    }
}

fn port_changes(old: &[DeclaredPort], new: &[DeclaredPort]) -> Vec<PortChange> {
    let old: BTreeMap<&str, &DeclaredPort> = old.iter().map(|p| (p.name.as_str(), p)).collect();
    let new: BTreeMap<&str, &DeclaredPort> = new.iter().map(|p| (p.name.as_str(), p)).collect();
    let mut changes = Vec::new();

    for (name, before) in &old {
        match new.get(name) {
            None => changes.push(PortChange {
                change_type: PortChangeType::Removed,
                port_name: name.to_string(),
                old_port: Some(before.port),
                new_port: None,
                old_protocol: Some(before.protocol.clone()),
                new_protocol: None,
            }),
            Some(after) if after.port != before.port || after.protocol != before.protocol => {
                changes.push(PortChange {
                    change_type: PortChangeType::Modified,
                    port_name: name.to_string(),
                    old_port: Some(before.port),
                    new_port: Some(after.port),
                    old_protocol: Some(before.protocol.clone()),
                    new_protocol: Some(after.protocol.clone()),
                })
            }
            Some(_) => {}
        }
    }

    for (name, after) in &new {
        if !old.contains_key(name) {
            changes.push(PortChange {
                change_type: PortChangeType::Added,
                port_name: name.to_string(),
                old_port: None,
                new_port: Some(after.port),
                old_protocol: None,
                new_protocol: Some(after.protocol.clone()),
            });
        }
    }

    changes
}

/// Decode a JSON annotation, logging and discarding unreadable payloads
pub fn decode_annotation<T: serde::de::DeserializeOwned>(key: &str, raw: Option<&str>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(annotation = %key, error = %e, "Ignoring unreadable annotation");
            None
        }
    }
}

/// Encode a record for an annotation value
pub fn encode_annotation<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}
