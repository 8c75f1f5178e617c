//! Desired vs actual diffing for a single Service
//!
//! [`DeltaEngine`] compares the router rules a Service owns with its desired
//! rules, keyed by the `(external, internal, protocol)` triple. Matched pairs
//! share the full triple, so only safe fields (name, destination, enabled,
//! source) can differ and an in-place Update is always possible. A port or
//! protocol change shows up as one key disappearing and another appearing,
//! which naturally becomes Delete + Create.
//!
//! [`ConflictDetector`] handles the other case: a desired slot occupied by a
//! router rule this Service does not own. Those rules are taken over with
//! an Update that keeps the router-assigned ID.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::operation::{sequence, Operation, Reason};
use crate::rules::{classify, PortRule, RuleKey, RuleSnapshot, ServiceKey};

/// Router rules owned by `service`
pub fn owned_rules<'a>(snapshot: &'a [RuleSnapshot], service: &ServiceKey) -> Vec<&'a RuleSnapshot> {
    snapshot.iter().filter(|r| r.is_owned_by(service)).collect()
}

pub struct DeltaEngine;

impl DeltaEngine {
    /// Diff owned router rules against desired rules.
    ///
    /// Desired keys in `claimed` are being taken over by a conflict Update in
    /// the same pass and are not created.
    pub fn compute(
        owned: &[&RuleSnapshot],
        desired: &[PortRule],
        claimed: &HashSet<RuleKey>,
    ) -> Vec<Operation> {
        let mut operations = Vec::new();

        let mut current: BTreeMap<RuleKey, &RuleSnapshot> = BTreeMap::new();
        for rule in owned {
            if let Some(first) = current.get(&rule.key()) {
                // Two owned rules on one slot: keep the first, drop the copy
                debug!(kept = %first.id, duplicate = %rule.id, key = %rule.key(), "Duplicate owned rule");
                if let Some(op) = Self::delete(rule) {
                    operations.push(op);
                }
                continue;
            }
            current.insert(rule.key(), rule);
        }

        let wanted: BTreeMap<RuleKey, &PortRule> = desired.iter().map(|r| (r.key(), r)).collect();

        for (key, rule) in &current {
            if !wanted.contains_key(key) {
                if let Some(op) = Self::delete(rule) {
                    operations.push(op);
                }
            }
        }

        for (key, rule) in &wanted {
            match current.get(key) {
                Some(existing) => {
                    let mismatches = classify(rule, existing);
                    if !mismatches.is_empty() {
                        operations.push(Operation::update(
                            (*rule).clone(),
                            (*existing).clone(),
                            Reason::ConfigurationMismatchSafe,
                            mismatches,
                        ));
                    }
                }
                None if claimed.contains(key) => {
                    debug!(key = %key, "Slot claimed by ownership takeover, skipping create");
                }
                None => {
                    operations.push(Operation::create((*rule).clone(), Reason::PortNotYetExists));
                }
            }
        }

        operations
    }

    fn delete(rule: &RuleSnapshot) -> Option<Operation> {
        let desired = PortRule::from_snapshot(rule)?;
        Some(Operation::delete(desired, rule.clone(), Reason::PortNoLongerDesired))
    }
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Find desired slots occupied by rules `service` does not own.
    ///
    /// Slots the Service already owns a rule for are left to the DeltaEngine.
    pub fn detect(service: &ServiceKey, desired: &[PortRule], snapshot: &[RuleSnapshot]) -> Vec<Operation> {
        let owned_keys: HashSet<RuleKey> = owned_rules(snapshot, service).iter().map(|r| r.key()).collect();

        desired
            .iter()
            .filter(|rule| !owned_keys.contains(&rule.key()))
            .filter_map(|rule| {
                let foreign = snapshot
                    .iter()
                    .find(|r| r.key() == rule.key() && !r.is_owned_by(service))?;
                let mismatches = classify(rule, foreign);
                debug!(
                    service = %service,
                    rule_id = %foreign.id,
                    current_name = %foreign.spec.name,
                    mismatches = ?mismatches,
                    "Desired slot held by a foreign rule"
                );
                Some(Operation::update(
                    rule.clone(),
                    foreign.clone(),
                    Reason::OwnershipTakeover,
                    mismatches,
                ))
            })
            .collect()
    }

    /// Drop takeovers whose target rule is gone from `fresh`
    pub fn revalidate(takeovers: Vec<Operation>, fresh: &[RuleSnapshot]) -> Vec<Operation> {
        takeovers
            .into_iter()
            .filter(|op| {
                let Some(existing) = &op.existing else {
                    return false;
                };
                let still_there = fresh
                    .iter()
                    .any(|r| r.id == existing.id && r.key() == existing.key());
                if !still_there {
                    warn!(
                        rule_id = %existing.id,
                        name = %existing.spec.name,
                        "Takeover target vanished before execution, dropping"
                    );
                }
                still_there
            })
            .collect()
    }
}

/// Full operation list for one Service against one router snapshot.
///
/// `takeovers` must already be revalidated against `snapshot`.
pub fn plan_operations(
    service: &ServiceKey,
    desired: &[PortRule],
    snapshot: &[RuleSnapshot],
    takeovers: Vec<Operation>,
) -> Vec<Operation> {
    let claimed: HashSet<RuleKey> = takeovers.iter().map(|op| op.rule.key()).collect();
    let owned = owned_rules(snapshot, service);

    let mut operations = takeovers;
    operations.extend(DeltaEngine::compute(&owned, desired, &claimed));
    sequence(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use crate::rules::fixtures::*;
    use crate::rules::{Mismatch, Protocol, RuleOwner, RuleSpec};
    use proptest::prelude::*;

    fn web() -> ServiceKey {
        service_key("web")
    }

    fn compute(snapshot: &[RuleSnapshot], desired: &[PortRule]) -> Vec<Operation> {
        let owned = owned_rules(snapshot, &web());
        DeltaEngine::compute(&owned, desired, &HashSet::new())
    }

    #[test]
    fn test_create_when_missing() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let ops = compute(&[], &[rule.clone()]);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].reason, Reason::PortNotYetExists);
        assert_eq!(ops[0].rule, rule);
    }

    #[test]
    fn test_update_on_safe_mismatch() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let mut current = owned("1", &rule);
        current.spec.destination = "10.0.0.9".parse().unwrap();

        let ops = compute(&[current.clone()], &[rule]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[0].reason, Reason::ConfigurationMismatchSafe);
        assert_eq!(ops[0].existing, Some(current));
        assert_eq!(ops[0].mismatches, vec![Mismatch::Ip]);
    }

    #[test]
    fn test_delete_when_no_longer_desired() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let current = owned("1", &rule);

        let ops = compute(&[current.clone()], &[]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Delete);
        assert_eq!(ops[0].reason, Reason::PortNoLongerDesired);
        assert_eq!(ops[0].existing, Some(current));
    }

    #[test]
    fn test_no_operation_when_converged() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        assert!(compute(&[owned("1", &rule)], &[rule]).is_empty());
    }

    #[test]
    fn test_protocol_change_becomes_delete_and_create() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let mut current = owned("1", &rule);
        current.spec.protocol = Protocol::Udp;

        let ops = plan_operations(&web(), &[rule], &[current], Vec::new());
        let kinds: Vec<_> = ops.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Delete, OperationKind::Create]);
    }

    #[test]
    fn test_duplicate_owned_rules_are_collapsed() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let ops = compute(&[owned("1", &rule), owned("2", &rule)], &[rule]);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Delete);
        assert_eq!(ops[0].existing.as_ref().unwrap().id, "2");
    }

    #[test]
    fn test_foreign_rules_are_ignored_by_delta() {
        let foreign = snapshot("9", spec("manual-rule", 22, 22, Protocol::Tcp, "10.0.0.2"));
        assert!(compute(&[foreign], &[]).is_empty());
    }

    #[test]
    fn test_prefix_named_service_rules_are_not_owned() {
        // default/web-admin is a different Service; web must not delete its rules
        let other = snapshot("5", spec("default/web-admin:http", 81, 81, Protocol::Tcp, "10.0.0.2"));
        assert!(compute(&[other], &[]).is_empty());
    }

    #[test]
    fn test_conflict_takeover_of_manual_rule() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let manual = snapshot("42", spec("manual-rule", 80, 8080, Protocol::Tcp, "10.0.0.5"));

        let takeovers = ConflictDetector::detect(&web(), &[rule.clone()], &[manual.clone()]);
        assert_eq!(takeovers.len(), 1);
        assert_eq!(takeovers[0].kind, OperationKind::Update);
        assert_eq!(takeovers[0].reason, Reason::OwnershipTakeover);
        assert_eq!(takeovers[0].existing.as_ref().unwrap().id, "42");
        assert_eq!(takeovers[0].mismatches, vec![Mismatch::Ownership, Mismatch::Name]);

        // The claimed slot is not also created
        let ops = plan_operations(&web(), &[rule], &[manual], takeovers);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].reason, Reason::OwnershipTakeover);
    }

    #[test]
    fn test_conflict_ignores_slots_already_owned() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let manual = snapshot("42", spec("manual-rule", 80, 8080, Protocol::Tcp, "10.0.0.5"));
        let mine = owned("1", &rule);

        assert!(ConflictDetector::detect(&web(), &[rule], &[manual, mine]).is_empty());
    }

    #[test]
    fn test_conflict_requires_identical_triple() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let manual = snapshot("42", spec("manual-rule", 80, 9090, Protocol::Tcp, "10.0.0.5"));
        assert!(ConflictDetector::detect(&web(), &[rule], &[manual]).is_empty());
    }

    #[test]
    fn test_revalidate_drops_vanished_targets() {
        let rule = desired("web", "http", 80, 8080, "10.0.0.5");
        let manual = snapshot("42", spec("manual-rule", 80, 8080, Protocol::Tcp, "10.0.0.5"));
        let takeovers = ConflictDetector::detect(&web(), &[rule.clone()], &[manual.clone()]);

        assert_eq!(ConflictDetector::revalidate(takeovers.clone(), &[manual]).len(), 1);
        let remaining = ConflictDetector::revalidate(takeovers, &[]);
        assert!(remaining.is_empty());

        // With the takeover dropped the slot is created instead
        let ops = plan_operations(&web(), &[rule], &[], remaining);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
    }

    /// Apply operations to a model router
    fn apply(snapshot: &mut Vec<RuleSnapshot>, ops: &[Operation]) {
        for (i, op) in ops.iter().enumerate() {
            match op.kind {
                OperationKind::Create => snapshot.push(RuleSnapshot {
                    id: format!("new-{i}"),
                    spec: op.rule.spec.clone(),
                }),
                OperationKind::Update => {
                    let id = &op.existing.as_ref().unwrap().id;
                    let rule = snapshot.iter_mut().find(|r| &r.id == id).unwrap();
                    rule.spec = op.rule.spec.clone();
                }
                OperationKind::Delete => {
                    let id = &op.existing.as_ref().unwrap().id;
                    snapshot.retain(|r| &r.id != id);
                }
            }
        }
    }

    fn arb_spec(owner: RuleOwner) -> impl Strategy<Value = PortRule> {
        (
            1u16..6,
            1u16..4,
            prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)],
            0u8..3,
            any::<bool>(),
        )
            .prop_map(move |(ext, int, protocol, ip, enabled)| PortRule {
                spec: RuleSpec {
                    name: owner.display_name(),
                    external_port: ext,
                    internal_port: int,
                    protocol,
                    destination: format!("10.0.0.{ip}").parse().unwrap(),
                    enabled,
                    interface: "wan".to_string(),
                    source: None,
                },
                owner: owner.clone(),
            })
    }

    fn arb_rules(prefix: &'static str) -> impl Strategy<Value = Vec<PortRule>> {
        proptest::collection::vec(0..4usize, 0..4).prop_flat_map(move |ids| {
            ids.into_iter()
                .enumerate()
                .map(|(i, _)| arb_spec(RuleOwner::new(&service_key("web"), format!("{prefix}{i}"))))
                .collect::<Vec<_>>()
        })
    }

    fn dedup_keys(rules: Vec<PortRule>) -> Vec<PortRule> {
        let mut seen = HashSet::new();
        rules.into_iter().filter(|r| seen.insert(r.key())).collect()
    }

    proptest! {
        /// Recomputing on unchanged input gives the same plan, and a converged
        /// router gives an empty plan
        #[test]
        fn proptest_idempotence(desired in arb_rules("p"), current in arb_rules("c")) {
            let desired = dedup_keys(desired);
            let router: Vec<RuleSnapshot> = current
                .iter()
                .enumerate()
                .map(|(i, r)| snapshot(&i.to_string(), r.spec.clone()))
                .collect();

            let first = plan_operations(&web(), &desired, &router, Vec::new());
            let second = plan_operations(&web(), &desired, &router, Vec::new());
            prop_assert_eq!(first, second);

            let converged: Vec<RuleSnapshot> = desired
                .iter()
                .enumerate()
                .map(|(i, r)| snapshot(&i.to_string(), r.spec.clone()))
                .collect();
            prop_assert!(plan_operations(&web(), &desired, &converged, Vec::new()).is_empty());
        }

        /// Applying the plan and diffing again yields nothing to do
        #[test]
        fn proptest_convergence(desired in arb_rules("p"), current in arb_rules("c")) {
            let desired = dedup_keys(desired);
            let mut state: Vec<RuleSnapshot> = current
                .iter()
                .enumerate()
                .map(|(i, r)| snapshot(&format!("old-{i}"), r.spec.clone()))
                .collect();

            let ops = plan_operations(&web(), &desired, &state, Vec::new());
            apply(&mut state, &ops);

            let again = plan_operations(&web(), &desired, &state, Vec::new());
            prop_assert!(again.is_empty(), "left over: {:?}", again);
        }
    }
}
