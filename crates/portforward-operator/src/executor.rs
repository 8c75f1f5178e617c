//! Applies planned operations to the router
//!
//! Operations run strictly in the order given. The first failure stops the
//! batch and every completed operation is compensated in reverse order.
//! Compensation is driven by an explicit table ([`RollbackAction`]) resolved
//! against one fresh router listing:
//!
//! | completed op | rule present        | compensation            |
//! |--------------|---------------------|-------------------------|
//! | Create       | created ID present  | remove the created rule |
//! | Create       | created ID gone     | nothing to undo         |
//! | Update       | rule ID present     | re-apply the pre-image  |
//! | Update       | rule ID gone        | re-create the pre-image |
//! | Delete       | -                   | re-create the pre-image |
//!
//! A failed compensation stops the rollback and is reported alongside the
//! original failure.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{RouterClient, RouterError};
use crate::desired::PortRegistry;
use crate::operation::{Operation, OperationFailure, OperationKind, OperationResult};
use crate::rules::{RuleSnapshot, RuleSpec};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{operation} failed: {source}")]
    Failed {
        operation: String,
        #[source]
        source: RouterError,
        result: Box<OperationResult>,
    },
    #[error("{operation} failed: {source}; rollback failed: {rollback}")]
    RollbackFailed {
        operation: String,
        #[source]
        source: RouterError,
        rollback: String,
        result: Box<OperationResult>,
    },
    #[error("pass cancelled with {skipped} operation(s) not started")]
    Cancelled {
        skipped: usize,
        result: Box<OperationResult>,
    },
}

impl ExecutionError {
    pub fn result(&self) -> &OperationResult {
        match self {
            ExecutionError::Failed { result, .. }
            | ExecutionError::RollbackFailed { result, .. }
            | ExecutionError::Cancelled { result, .. } => result,
        }
    }

    /// The router may be left part-way through the batch
    pub fn rollback_failed(&self) -> bool {
        !self.result().rollback_failures.is_empty()
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Failed { source, .. } | ExecutionError::RollbackFailed { source, .. } => {
                source.is_transient()
            }
            ExecutionError::Cancelled { .. } => true,
        }
    }
}

/// Compensation for one completed operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RollbackAction {
    /// Remove a rule this batch created
    RemoveCreated { id: String },
    /// Overwrite an updated rule with its pre-image
    Restore { id: String, pre_image: RuleSpec },
    /// Re-create a rule that was deleted or vanished after an update
    Recreate { pre_image: RuleSpec },
    /// The created rule is already gone
    Nothing,
}

/// An operation that reached the router, with the rule it produced
#[derive(Clone, Debug)]
struct Completed {
    operation: Operation,
    /// Rule returned by the router (created/updated) or the deleted rule
    applied: RuleSnapshot,
    /// Reservation released by a successful Delete
    released_port: Option<u16>,
}

/// Resolve the compensation for `completed` against the current router rules.
///
/// `current` is `None` when the router could not be listed; rules are then
/// assumed to still be where this batch left them.
fn rollback_action(
    kind: OperationKind,
    applied: &RuleSnapshot,
    pre_image: Option<&RuleSnapshot>,
    current: Option<&[RuleSnapshot]>,
) -> RollbackAction {
    let present = |id: &str| current.map_or(true, |rules| rules.iter().any(|r| r.id == id));

    match (kind, pre_image) {
        (OperationKind::Create, _) if present(&applied.id) => RollbackAction::RemoveCreated {
            id: applied.id.clone(),
        },
        (OperationKind::Create, _) => RollbackAction::Nothing,
        (OperationKind::Update, Some(before)) if present(&before.id) => RollbackAction::Restore {
            id: before.id.clone(),
            pre_image: before.spec.clone(),
        },
        (OperationKind::Update, Some(before)) | (OperationKind::Delete, Some(before)) => {
            RollbackAction::Recreate {
                pre_image: before.spec.clone(),
            }
        }
        // Update and Delete operations always carry their pre-image
        (OperationKind::Update, None) | (OperationKind::Delete, None) => RollbackAction::Recreate {
            pre_image: applied.spec.clone(),
        },
    }
}

pub struct OperationExecutor {
    router: Arc<dyn RouterClient>,
    registry: Arc<PortRegistry>,
}

impl OperationExecutor {
    pub fn new(router: Arc<dyn RouterClient>, registry: Arc<PortRegistry>) -> Self {
        Self { router, registry }
    }

    /// Apply `operations` in order.
    ///
    /// On error the returned [`ExecutionError`] carries the partial result,
    /// including which operations were compensated.
    pub async fn execute(
        &self,
        operations: Vec<Operation>,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ExecutionError> {
        let total = operations.len();
        let mut result = OperationResult::default();
        let mut completed: Vec<Completed> = Vec::with_capacity(total);
        let still_used = targeted_ports(&operations);

        for (index, operation) in operations.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                result.skipped = total - index;
                warn!(skipped = result.skipped, "Cancellation observed, abandoning remaining operations");
                self.rollback(&completed, &mut result).await;
                let skipped = result.skipped;
                return Err(ExecutionError::Cancelled {
                    skipped,
                    result: Box::new(result),
                });
            }

            match self.apply(operation).await {
                Ok(applied) => {
                    info!(
                        operation = %operation.kind,
                        name = %operation.rule.spec.name,
                        external_port = operation.rule.spec.external_port,
                        reason = %operation.reason,
                        rule_id = %applied.id,
                        "Applied router operation"
                    );
                    match operation.kind {
                        OperationKind::Create => result.created.push(operation.rule.clone()),
                        OperationKind::Update => result.updated.push(operation.rule.clone()),
                        OperationKind::Delete => result.deleted.push(operation.rule.clone()),
                    }
                    let released_port = match operation.kind {
                        OperationKind::Delete => self.release_if_unused(operation, &still_used),
                        _ => None,
                    };
                    completed.push(Completed {
                        operation: operation.clone(),
                        applied,
                        released_port,
                    });
                }
                Err(source) => {
                    error!(
                        operation = %operation.kind,
                        name = %operation.rule.spec.name,
                        external_port = operation.rule.spec.external_port,
                        error = %source,
                        "Router operation failed, rolling back"
                    );
                    result.failures.push(OperationFailure {
                        operation: operation.clone(),
                        error: source.to_string(),
                    });
                    result.skipped = total - index - 1;
                    self.rollback(&completed, &mut result).await;

                    let description = operation.describe();
                    if let Some(failed) = result.rollback_failures.first() {
                        let rollback = format!("{}: {}", failed.operation.describe(), failed.error);
                        return Err(ExecutionError::RollbackFailed {
                            operation: description,
                            source,
                            rollback,
                            result: Box::new(result),
                        });
                    }
                    return Err(ExecutionError::Failed {
                        operation: description,
                        source,
                        result: Box::new(result),
                    });
                }
            }
        }

        Ok(result)
    }

    async fn apply(&self, operation: &Operation) -> Result<RuleSnapshot, RouterError> {
        match (operation.kind, &operation.existing) {
            (OperationKind::Create, _) => self.router.add_rule(&operation.rule.spec).await,
            (OperationKind::Update, Some(existing)) => {
                self.router.update_rule(&existing.id, &operation.rule.spec).await
            }
            (OperationKind::Delete, Some(existing)) => {
                self.router.remove_rule(&existing.id).await?;
                Ok(existing.clone())
            }
            (kind, None) => Err(RouterError::InvalidResponse(format!(
                "{kind} of {} has no target rule",
                operation.rule.spec.name
            ))),
        }
    }

    /// Compensate `completed` in reverse order, stopping at the first failure
    async fn rollback(&self, completed: &[Completed], result: &mut OperationResult) {
        if completed.is_empty() {
            return;
        }

        let current = match self.router.list_rules().await {
            Ok(rules) => Some(rules),
            Err(e) => {
                warn!(error = %e, "Could not list rules before rollback, assuming batch state");
                None
            }
        };

        for done in completed.iter().rev() {
            let action = rollback_action(
                done.operation.kind,
                &done.applied,
                done.operation.existing.as_ref(),
                current.as_deref(),
            );
            debug!(operation = %done.operation.describe(), action = ?action, "Rolling back");

            match self.compensate(action).await {
                Ok(()) => {
                    if let Some(port) = done.released_port {
                        self.reclaim(port, &done.operation);
                    }
                    result.rolled_back.push(done.operation.clone());
                }
                Err(e) => {
                    error!(
                        operation = %done.operation.describe(),
                        error = %e,
                        "Rollback failed, router left at last compensated step"
                    );
                    result.rollback_failures.push(OperationFailure {
                        operation: done.operation.clone(),
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }

        info!(compensated = result.rolled_back.len(), "Rollback complete");
    }

    async fn compensate(&self, action: RollbackAction) -> Result<(), RouterError> {
        match action {
            RollbackAction::RemoveCreated { id } => match self.router.remove_rule(&id).await {
                Err(RouterError::NotFound(_)) => Ok(()),
                other => other,
            },
            RollbackAction::Restore { id, pre_image } => {
                match self.router.update_rule(&id, &pre_image).await {
                    Ok(_) => Ok(()),
                    // Vanished after listing
                    Err(RouterError::NotFound(_)) => self.router.add_rule(&pre_image).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            RollbackAction::Recreate { pre_image } => self.router.add_rule(&pre_image).await.map(|_| ()),
            RollbackAction::Nothing => Ok(()),
        }
    }

    /// Release the reservation of a deleted rule unless another operation
    /// in the batch still targets its external port
    fn release_if_unused(&self, operation: &Operation, still_used: &BTreeSet<u16>) -> Option<u16> {
        let port = operation.rule.spec.external_port;
        if still_used.contains(&port) {
            return None;
        }
        let service = operation.rule.owner.service_key();
        if self.registry.release_port(port, &service) {
            debug!(service = %service, external_port = port, "Released port reservation");
            Some(port)
        } else {
            None
        }
    }

    /// Restore a reservation released by a Delete that was rolled back
    fn reclaim(&self, port: u16, operation: &Operation) {
        let service = operation.rule.owner.service_key();
        match self.registry.claim(&service, &BTreeSet::from([port])) {
            Ok(()) => debug!(service = %service, external_port = port, "Reclaimed port reservation"),
            Err(e) => warn!(service = %service, external_port = port, error = %e, "Could not reclaim port reservation"),
        }
    }
}

/// External ports targeted by Create or Update operations
fn targeted_ports(operations: &[Operation]) -> BTreeSet<u16> {
    operations
        .iter()
        .filter(|op| op.kind != OperationKind::Delete)
        .map(|op| op.rule.spec.external_port)
        .collect()
}
