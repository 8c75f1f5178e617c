//! Fleet-wide drift detection
//!
//! Compares each managed Service's desired rules against one router snapshot.
//! Unlike the event path, matching runs across the whole snapshot so rules
//! occupying a desired slot without being owned show up as well.
//!
//! For every desired rule, in order:
//! 1. an owned rule with the same key that differs is Wrong (safe Update)
//! 2. a foreign rule with the same key is Wrong (ownership takeover)
//! 3. an owned rule for the same port name under another key is Wrong
//!    (risky: Delete + Create)
//! 4. otherwise the rule is Missing
//!
//! Owned rules left unmatched are Extra.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::ObjectReference;
use serde_json::json;
use tracing::debug;

use crate::delta::owned_rules;
use crate::desired::{DesiredStateCalculator, DesiredStateError};
use crate::operation::{sequence, Operation, Reason};
use crate::rules::{classify, is_risky, Mismatch, PortRule, RuleSnapshot, ServiceKey};
use crate::service::ManagedService;

/// A desired rule whose router counterpart is not as it should be
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrongRule {
    pub desired: PortRule,
    pub current: RuleSnapshot,
    pub mismatches: Vec<Mismatch>,
}

impl WrongRule {
    /// Needs Delete + Create rather than an in-place Update
    pub fn is_risky(&self) -> bool {
        is_risky(&self.mismatches)
    }

    pub fn is_takeover(&self) -> bool {
        self.mismatches.contains(&Mismatch::Ownership)
    }
}

/// Drift of one Service against one router snapshot
#[derive(Clone, Debug)]
pub struct DriftAnalysis {
    pub service: ServiceKey,
    pub object_ref: ObjectReference,
    pub desired: Vec<PortRule>,
    pub owned: Vec<RuleSnapshot>,
    pub missing: Vec<PortRule>,
    pub wrong: Vec<WrongRule>,
    pub extra: Vec<RuleSnapshot>,
}

impl DriftAnalysis {
    pub fn has_drift(&self) -> bool {
        !self.missing.is_empty() || !self.wrong.is_empty() || !self.extra.is_empty()
    }

    /// Operations that bring the router back to the desired state.
    ///
    /// Deletes (Extra rules and the first half of risky splits) are ordered
    /// before the Creates that may reuse their slots.
    pub fn correction_plan(&self) -> Vec<Operation> {
        let mut operations = Vec::new();

        for wrong in &self.wrong {
            if wrong.is_risky() {
                if let Some(old) = PortRule::from_snapshot(&wrong.current) {
                    operations.push(Operation::delete(old, wrong.current.clone(), Reason::DriftWrongRisky));
                }
                operations.push(Operation::create(wrong.desired.clone(), Reason::DriftWrongRisky));
            } else {
                let reason = if wrong.is_takeover() {
                    Reason::OwnershipTakeover
                } else {
                    Reason::DriftWrongSafe
                };
                operations.push(Operation::update(
                    wrong.desired.clone(),
                    wrong.current.clone(),
                    reason,
                    wrong.mismatches.clone(),
                ));
            }
        }

        for rule in &self.missing {
            operations.push(Operation::create(rule.clone(), Reason::DriftMissing));
        }

        for rule in &self.extra {
            if let Some(old) = PortRule::from_snapshot(rule) {
                operations.push(Operation::delete(old, rule.clone(), Reason::DriftExtra));
            }
        }

        sequence(operations)
    }

    /// Structured summary for notifications
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "service": self.service.to_string(),
            "missing": self.missing.iter().map(|r| r.spec.name.clone()).collect::<Vec<_>>(),
            "wrong": self.wrong.iter().map(|w| json!({
                "name": w.desired.spec.name,
                "rule_id": w.current.id,
                "current_name": w.current.spec.name,
                "mismatches": w.mismatches,
                "risky": w.is_risky(),
            })).collect::<Vec<_>>(),
            "extra": self.extra.iter().map(|r| json!({
                "name": r.spec.name,
                "rule_id": r.id,
            })).collect::<Vec<_>>(),
        })
    }
}

pub struct DriftDetector;

impl DriftDetector {
    /// Recompute `service`'s desired rules and compare them with `snapshot`
    pub fn analyze(
        service: &ManagedService,
        calculator: &DesiredStateCalculator,
        snapshot: &[RuleSnapshot],
    ) -> Result<DriftAnalysis, DesiredStateError> {
        let desired = calculator.calculate(service)?;
        Ok(Self::compare(&service.key, service.object_ref.clone(), desired, snapshot))
    }

    /// Compare already-computed desired rules with `snapshot`
    pub fn compare(
        service: &ServiceKey,
        object_ref: ObjectReference,
        desired: Vec<PortRule>,
        snapshot: &[RuleSnapshot],
    ) -> DriftAnalysis {
        let owned: Vec<RuleSnapshot> = owned_rules(snapshot, service).into_iter().cloned().collect();
        let mut consumed: HashSet<&str> = HashSet::new();
        let mut missing = Vec::new();
        let mut wrong = Vec::new();

        for rule in &desired {
            let key = rule.key();

            if let Some(current) = owned
                .iter()
                .find(|r| r.key() == key && !consumed.contains(r.id.as_str()))
            {
                consumed.insert(&current.id);
                let mismatches = classify(rule, current);
                if !mismatches.is_empty() {
                    wrong.push(WrongRule {
                        desired: rule.clone(),
                        current: current.clone(),
                        mismatches,
                    });
                }
                continue;
            }

            if let Some(foreign) = snapshot
                .iter()
                .find(|r| r.key() == key && !r.is_owned_by(service))
            {
                wrong.push(WrongRule {
                    desired: rule.clone(),
                    current: foreign.clone(),
                    mismatches: classify(rule, foreign),
                });
                continue;
            }

            if let Some(moved) = owned.iter().find(|r| {
                !consumed.contains(r.id.as_str()) && r.owner().as_ref() == Some(&rule.owner)
            }) {
                consumed.insert(&moved.id);
                wrong.push(WrongRule {
                    desired: rule.clone(),
                    current: moved.clone(),
                    mismatches: classify(rule, moved),
                });
                continue;
            }

            missing.push(rule.clone());
        }

        let extra: Vec<RuleSnapshot> = owned
            .iter()
            .filter(|r| !consumed.contains(r.id.as_str()))
            .cloned()
            .collect();

        let analysis = DriftAnalysis {
            service: service.clone(),
            object_ref,
            desired,
            owned,
            missing,
            wrong,
            extra,
        };
        if analysis.has_drift() {
            debug!(
                service = %service,
                missing = analysis.missing.len(),
                wrong = analysis.wrong.len(),
                extra = analysis.extra.len(),
                "Drift detected"
            );
        }
        analysis
    }
}
