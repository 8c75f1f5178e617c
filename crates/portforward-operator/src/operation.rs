//! Router operations planned by a reconciliation pass
//!
//! Operations are built fresh on every pass, handed to the executor and
//! dropped afterwards; they are never persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rules::{Mismatch, PortRule, RuleSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    // Declaration order is execution order within a planned batch
    Delete,
    Update,
    Create,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// Why an operation was planned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    PortNoLongerDesired,
    PortNotYetExists,
    ConfigurationMismatchSafe,
    OwnershipTakeover,
    DriftMissing,
    DriftExtra,
    DriftWrongSafe,
    DriftWrongRisky,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::PortNoLongerDesired => "port_no_longer_desired",
            Reason::PortNotYetExists => "port_not_yet_exists",
            Reason::ConfigurationMismatchSafe => "configuration_mismatch_safe",
            Reason::OwnershipTakeover => "ownership_takeover",
            Reason::DriftMissing => "drift_missing",
            Reason::DriftExtra => "drift_extra",
            Reason::DriftWrongSafe => "drift_wrong_safe",
            Reason::DriftWrongRisky => "drift_wrong_risky",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned router mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Target configuration; for a Delete, the rule being removed
    pub rule: PortRule,
    /// Router rule being replaced or removed (pre-image for rollback)
    pub existing: Option<RuleSnapshot>,
    pub reason: Reason,
    pub mismatches: Vec<Mismatch>,
}

impl Operation {
    pub fn create(rule: PortRule, reason: Reason) -> Self {
        Self {
            kind: OperationKind::Create,
            rule,
            existing: None,
            reason,
            mismatches: Vec::new(),
        }
    }

    pub fn update(rule: PortRule, existing: RuleSnapshot, reason: Reason, mismatches: Vec<Mismatch>) -> Self {
        Self {
            kind: OperationKind::Update,
            rule,
            existing: Some(existing),
            reason,
            mismatches,
        }
    }

    pub fn delete(rule: PortRule, existing: RuleSnapshot, reason: Reason) -> Self {
        Self {
            kind: OperationKind::Delete,
            rule,
            existing: Some(existing),
            reason,
            mismatches: Vec::new(),
        }
    }

    /// Short description for logs and error messages
    pub fn describe(&self) -> String {
        format!("{} {} ({})", self.kind, self.rule.spec.name, self.rule.key())
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            kind: self.kind,
            name: self.rule.spec.name.clone(),
            external_port: self.rule.spec.external_port,
            internal_port: self.rule.spec.internal_port,
            protocol: self.rule.spec.protocol.to_string(),
            destination: self.rule.spec.destination.to_string(),
            reason: self.reason,
            existing_id: self.existing.as_ref().map(|e| e.id.clone()),
            mismatches: self.mismatches.clone(),
        }
    }
}

/// Order a batch so every Delete runs before the Creates it frees a slot for
pub fn sequence(mut operations: Vec<Operation>) -> Vec<Operation> {
    operations.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.rule.key().cmp(&b.rule.key())));
    operations
}

/// Serializable view of an operation for events and persisted context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub kind: OperationKind,
    pub name: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: String,
    pub destination: String,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<Mismatch>,
}

/// A failed operation and its error message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationFailure {
    pub operation: Operation,
    pub error: String,
}

/// Outcome of executing one batch of operations
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationResult {
    pub created: Vec<PortRule>,
    pub updated: Vec<PortRule>,
    pub deleted: Vec<PortRule>,
    /// Operations whose router call failed
    pub failures: Vec<OperationFailure>,
    /// Completed operations that were compensated after a failure
    pub rolled_back: Vec<Operation>,
    /// Compensations that themselves failed
    pub rollback_failures: Vec<OperationFailure>,
    /// Operations never attempted (fail-fast or cancellation)
    pub skipped: usize,
    pub cancelled: bool,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn applied(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}
