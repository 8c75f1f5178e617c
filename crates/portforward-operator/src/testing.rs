//! In-memory router used by unit tests
//!
//! Behaves like the REST router (IDs assigned on create, updates and deletes
//! addressed by ID, `NotFound` for unknown IDs) and supports failure
//! injection by mutation index or by rule name. Also provides a publisher
//! that records notifications.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use k8s_openapi::api::core::v1::ObjectReference;

use crate::client::{RouterClient, RouterError};
use crate::events::{EventPublisher, Notification};
use crate::rules::{RuleSnapshot, RuleSpec};

#[derive(Default)]
struct State {
    rules: Vec<RuleSnapshot>,
    next_id: u64,
    mutations: usize,
    fail_mutations: HashSet<usize>,
    fail_names: HashSet<String>,
    reject_names: HashSet<String>,
    fail_list: bool,
    vanish_on_failure: Option<String>,
}

#[derive(Default)]
pub struct InMemoryRouter {
    state: Mutex<State>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(specs: impl IntoIterator<Item = RuleSpec>) -> Self {
        let router = Self::new();
        for spec in specs {
            router.seed(spec);
        }
        router
    }

    /// Insert a rule directly, bypassing failure injection
    pub fn seed(&self, spec: RuleSpec) -> RuleSnapshot {
        let mut state = self.state.lock();
        state.next_id += 1;
        let rule = RuleSnapshot {
            id: format!("r{}", state.next_id),
            spec,
        };
        state.rules.push(rule.clone());
        rule
    }

    /// Delete a rule behind the operator's back
    pub fn remove_externally(&self, id: &str) {
        self.state.lock().rules.retain(|r| r.id != id);
    }

    /// Edit a rule behind the operator's back
    pub fn edit_externally(&self, id: &str, edit: impl FnOnce(&mut RuleSpec)) {
        if let Some(rule) = self.state.lock().rules.iter_mut().find(|r| r.id == id) {
            edit(&mut rule.spec);
        }
    }

    /// Fail the `n`-th mutating call (0-based, counted from now on)
    pub fn fail_mutation(&self, n: usize) {
        let mut state = self.state.lock();
        let index = state.mutations + n;
        state.fail_mutations.insert(index);
    }

    /// Delete rule `id` at the moment the next injected failure fires,
    /// as if someone removed it by hand mid-pass
    pub fn vanish_on_failure(&self, id: &str) {
        self.state.lock().vanish_on_failure = Some(id.to_string());
    }

    /// Fail every mutation touching a rule with this name
    pub fn fail_name(&self, name: &str) {
        self.state.lock().fail_names.insert(name.to_string());
    }

    /// Answer mutations of rule `name` with a 400, as for an invalid payload
    pub fn reject_name(&self, name: &str) {
        self.state.lock().reject_names.insert(name.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_mutations.clear();
        state.fail_names.clear();
        state.reject_names.clear();
        state.fail_list = false;
        state.vanish_on_failure = None;
    }

    pub fn rules(&self) -> Vec<RuleSnapshot> {
        self.state.lock().rules.clone()
    }

    /// Rule specs sorted by key then name, ignoring router IDs
    pub fn specs(&self) -> Vec<RuleSpec> {
        let mut specs: Vec<RuleSpec> = self.rules().into_iter().map(|r| r.spec).collect();
        specs.sort_by(|a, b| a.key().cmp(&b.key()).then_with(|| a.name.cmp(&b.name)));
        specs
    }

    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }
}

fn injected(what: &str) -> RouterError {
    RouterError::Api {
        status: 500,
        message: format!("injected failure: {what}"),
    }
}

impl State {
    fn check(&mut self, name: &str, what: &str) -> Result<(), RouterError> {
        let index = self.mutations;
        self.mutations += 1;
        if self.fail_mutations.contains(&index) || self.fail_names.contains(name) {
            if let Some(id) = self.vanish_on_failure.take() {
                self.rules.retain(|r| r.id != id);
            }
            return Err(injected(what));
        }
        if self.reject_names.contains(name) {
            return Err(RouterError::Api {
                status: 400,
                message: format!("api.err.InvalidPayload: {what}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RouterClient for InMemoryRouter {
    async fn list_rules(&self) -> Result<Vec<RuleSnapshot>, RouterError> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(injected("list"));
        }
        Ok(state.rules.clone())
    }

    async fn add_rule(&self, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        let mut state = self.state.lock();
        state.check(&spec.name, "add")?;
        state.next_id += 1;
        let rule = RuleSnapshot {
            id: format!("r{}", state.next_id),
            spec: spec.clone(),
        };
        state.rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, id: &str, spec: &RuleSpec) -> Result<RuleSnapshot, RouterError> {
        let mut state = self.state.lock();
        state.check(&spec.name, "update")?;
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        rule.spec = spec.clone();
        Ok(rule.clone())
    }

    async fn remove_rule(&self, id: &str) -> Result<(), RouterError> {
        let mut state = self.state.lock();
        let name = state
            .rules
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.spec.name.clone())
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        state.check(&name, "remove")?;
        state.rules.retain(|r| r.id != id);
        Ok(())
    }

    async fn check_readiness(&self) -> Result<bool, RouterError> {
        Ok(!self.state.lock().fail_list)
    }
}

/// Publisher that keeps every notification for assertions
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Notification)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<&'static str> {
        self.published.lock().iter().map(|(_, n)| n.reason).collect()
    }

    pub fn notifications(&self) -> Vec<(String, Notification)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, object: &ObjectReference, notification: Notification) {
        let name = object.name.clone().unwrap_or_default();
        self.published.lock().push((name, notification));
    }
}
