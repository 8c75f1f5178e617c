//! Service controller
//!
//! Watches v1/Service resources and keeps the router's port-forward rules
//! converged with each Service's port mapping annotation.
//!
//! ## Lifecycle
//!
//! - A qualifying Service (mapping annotation + resolvable destination)
//!   first gets the cleanup finalizer and is requeued immediately. Each pass
//!   makes at most one kind of mutation.
//! - Once finalized, every pass recomputes desired rules, snapshots the
//!   router, plans Delta + takeover operations and executes them.
//! - A Service that stops qualifying while finalized is released: finalizer
//!   and state annotations removed, router rules left untouched.
//! - A Service being deleted goes through [`FinalizerLifecycle`].
//!
//! [`FinalizerLifecycle`]: crate::finalizer::FinalizerLifecycle

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::client::RouterError;
use crate::config::annotations;
use crate::context::{
    decode_annotation, encode_annotation, ChangeContext, ErrorClass, ErrorContext, ErrorStatus,
};
use crate::delta::{plan_operations, ConflictDetector};
use crate::desired::DesiredStateError;
use crate::events::{actions, reasons, Notification};
use crate::executor::ExecutionError;
use crate::finalizer::{CleanupError, FinalizerOutcome};
use crate::operation::{Operation, OperationKind, OperationSummary, Reason};
use crate::rules::ServiceKey;
use crate::service::{ManagedService, ServiceViewError};
use crate::store::StoreError;

use super::retry::{compute_backoff, ErrorKind};
use super::Context;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid Service: {0}")]
    InvalidService(#[from] ServiceViewError),
    #[error(transparent)]
    DesiredState(#[from] DesiredStateError),
    #[error("Failed to list router rules: {0}")]
    Router(#[from] RouterError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),
    #[error("Failed to update Service: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to encode annotation: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::InvalidService(_) => ErrorClass::Validation,
            ReconcileError::DesiredState(e) if e.is_port_conflict() => ErrorClass::PortConflict,
            ReconcileError::DesiredState(_) => ErrorClass::Validation,
            ReconcileError::Router(_) => ErrorClass::RouterOperation,
            ReconcileError::Execution(e) if e.rollback_failed() => ErrorClass::Rollback,
            ReconcileError::Execution(_) => ErrorClass::RouterOperation,
            ReconcileError::Cleanup(_) => ErrorClass::Cleanup,
            ReconcileError::Store(_) | ReconcileError::Encode(_) => ErrorClass::Store,
        }
    }

    /// Rejected input waits for the Service to change; so does a router
    /// error that retrying cannot fix (bad request, client configuration)
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Router(e) if !e.is_transient() => ErrorKind::Permanent,
            ReconcileError::Execution(e) if !e.rollback_failed() && !e.is_transient() => ErrorKind::Permanent,
            _ => match self.class() {
                ErrorClass::Validation | ErrorClass::PortConflict => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
        }
    }

    /// The router may be left part-way through a batch
    pub fn rollback_failed(&self) -> bool {
        matches!(self, ReconcileError::Execution(e) if e.rollback_failed())
    }

    fn failed_operations(&self) -> Vec<OperationSummary> {
        match self {
            ReconcileError::Execution(e) => e.result().failures.iter().map(|f| f.operation.summary()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Reconcile a single Service resource
#[instrument(skip(ctx, service), fields(
    namespace = %service.metadata.namespace.as_deref().unwrap_or("default"),
    name = %service.metadata.name.as_deref().unwrap_or("unknown"),
))]
pub(crate) async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let view = ManagedService::from_service(&service)?;

    if view.deleting {
        return handle_deletion(&view, &ctx).await;
    }

    if !view.qualifies() {
        if view.has_finalizer {
            release(&view, &ctx).await?;
        } else {
            debug!("Service not managed, skipping");
        }
        return Ok(Action::await_change());
    }

    if !view.has_finalizer {
        ctx.store.add_finalizer(&view.key).await?;
        info!("Attached finalizer");
        return Ok(Action::requeue(Duration::ZERO));
    }

    match converge(&view, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            record_failure(&view, &ctx, &e).await;
            Err(e)
        }
    }
}

async fn handle_deletion(view: &ManagedService, ctx: &Context) -> Result<Action, ReconcileError> {
    if !view.has_finalizer {
        ctx.registry.release_service(&view.key);
        return Ok(Action::await_change());
    }

    let _guard = ctx.locks.lock(&view.key).await;
    match ctx.finalizer.run(view).await? {
        FinalizerOutcome::Retry { after, .. } => Ok(Action::requeue(after)),
        FinalizerOutcome::Completed { .. } | FinalizerOutcome::ForcedAfterMaxRetries { .. } => {
            forget(&view.key, ctx);
            Ok(Action::await_change())
        }
    }
}

/// The mapping annotation (or destination) went away: stop managing the
/// Service without touching its router rules
async fn release(view: &ManagedService, ctx: &Context) -> Result<(), ReconcileError> {
    let cleared: BTreeMap<String, Option<String>> = annotations::OPERATOR_STATE
        .iter()
        .filter(|key| view.annotation(key).is_some())
        .map(|key| (key.to_string(), None))
        .collect();
    ctx.store.patch_annotations(&view.key, cleared).await?;
    ctx.store.remove_finalizer(&view.key).await?;
    ctx.registry.release_service(&view.key);
    forget(&view.key, ctx);

    info!("Service no longer qualifies, finalizer removed; router rules left in place");
    Ok(())
}

fn forget(key: &ServiceKey, ctx: &Context) {
    ctx.limiter.reset(&key.to_string());
    ctx.retry_tracker.reset(key);
}

/// One managed pass: plan against a router snapshot and execute
async fn converge(view: &ManagedService, ctx: &Context) -> Result<Action, ReconcileError> {
    let previous: Option<ChangeContext> =
        decode_annotation(annotations::CHANGE_CONTEXT, view.annotation(annotations::CHANGE_CONTEXT));
    let change = ChangeContext::compute(previous.as_ref(), view);
    if change.has_changes() {
        info!(
            ip_changed = change.ip_changed,
            annotation_changed = change.annotation_changed,
            port_changes = change.port_changes.len(),
            "Service changed since last pass"
        );
    }

    let desired = ctx.calculator.calculate(view)?;

    let _guard = ctx.locks.lock(&view.key).await;
    let mut snapshot = ctx.router.list_rules().await?;
    let mut takeovers = ConflictDetector::detect(&view.key, &desired, &snapshot);
    if !takeovers.is_empty() {
        snapshot = ctx.router.list_rules().await?;
        takeovers = ConflictDetector::revalidate(takeovers, &snapshot);
    }
    let operations = plan_operations(&view.key, &desired, &snapshot, takeovers);

    if operations.is_empty() {
        debug!(rules = desired.len(), "Router rules already converged");
    }
    ctx.executor.execute(operations.clone(), &ctx.cancel).await?;

    let keep: BTreeSet<u16> = desired.iter().map(|r| r.spec.external_port).collect();
    ctx.registry.retain_only(&view.key, &keep);
    forget(&view.key, ctx);

    for operation in &operations {
        notify_applied(view, ctx, operation).await;
    }

    let mut patch = BTreeMap::new();
    if view.annotation(annotations::ERROR_CONTEXT).is_some() {
        patch.insert(annotations::ERROR_CONTEXT.to_string(), None);
    }
    if previous.is_none() || change.has_changes() {
        patch.insert(annotations::CHANGE_CONTEXT.to_string(), Some(encode_annotation(&change)?));
    }
    if !patch.is_empty() {
        ctx.store.patch_annotations(&view.key, patch).await?;
    }

    if !operations.is_empty() {
        info!(operations = operations.len(), "Service reconciled");
    }
    Ok(Action::await_change())
}

async fn notify_applied(view: &ManagedService, ctx: &Context, operation: &Operation) {
    let reason = match (operation.kind, operation.reason) {
        (_, Reason::OwnershipTakeover) => reasons::OWNERSHIP_TAKEOVER,
        (OperationKind::Create, _) => reasons::PORT_FORWARD_CREATED,
        (OperationKind::Update, _) => reasons::PORT_FORWARD_UPDATED,
        (OperationKind::Delete, _) => reasons::PORT_FORWARD_DELETED,
    };
    let data = serde_json::to_value(operation.summary()).unwrap_or_default();
    ctx.events
        .publish(
            &view.object_ref,
            Notification::normal(reason, actions::RECONCILE, operation.describe()).with_data(data),
        )
        .await;
}

/// Surface a failed pass (rate limited) and persist its error context.
///
/// Nothing is persisted when rollback failed: the router state is unknown
/// and the previous context stays authoritative. Repeats inside the rate
/// limiter's window are not written either, since every annotation write
/// retriggers the watch; they are added to `retry_count` when the error
/// next surfaces.
async fn record_failure(view: &ManagedService, ctx: &Context, error: &ReconcileError) {
    let class = error.class();
    let message = error.to_string();
    let decision = ctx.limiter.filter_for_reconcile(&view.key.to_string(), &message);

    if error.rollback_failed() {
        error!(error = %message, "Rollback failed, router may be partially updated");
    } else if decision.surface {
        warn!(error = %message, code = class.as_str(), occurrences = decision.count, "Reconciliation failed");
    } else {
        debug!(error = %message, occurrences = decision.count, "Repeated reconciliation error suppressed");
        return;
    }

    let reason = match class {
        ErrorClass::Validation | ErrorClass::PortConflict => reasons::VALIDATION_FAILED,
        _ => reasons::OPERATION_FAILED,
    };
    let failed_operations = error.failed_operations();
    ctx.events
        .publish(
            &view.object_ref,
            Notification::warning(reason, actions::RECONCILE, &message).with_data(json!({
                "code": class,
                "failed_operations": failed_operations,
                "rollback_failed": error.rollback_failed(),
            })),
        )
        .await;

    if error.rollback_failed() {
        return;
    }

    let previous: Option<ErrorContext> =
        decode_annotation(annotations::ERROR_CONTEXT, view.annotation(annotations::ERROR_CONTEXT));
    let status = match error.kind() {
        ErrorKind::Permanent => ErrorStatus::Rejected,
        ErrorKind::Transient => ErrorStatus::Retrying,
    };
    let failures = u32::try_from(decision.since_surfaced).unwrap_or(u32::MAX);
    let context = ErrorContext::next(previous.as_ref(), failures, class, message, status, failed_operations);

    let encoded = match encode_annotation(&context) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(error = %e, "Failed to encode error context");
            return;
        }
    };
    let patch = BTreeMap::from([(annotations::ERROR_CONTEXT.to_string(), Some(encoded))]);
    if let Err(e) = ctx.store.patch_annotations(&view.key, patch).await {
        warn!(error = %e, "Failed to persist error context");
    }
}

/// Error policy for the controller with exponential backoff
fn error_policy(service: Arc<Service>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = ServiceKey::new(
        service.metadata.namespace.as_deref().unwrap_or_default(),
        service.metadata.name.as_deref().unwrap_or_default(),
    );
    let kind = error.kind();
    let attempt = ctx.retry_tracker.increment(&key);
    let floor = ctx.limiter.remaining_backoff(&key.to_string());

    debug!(
        service = %key,
        error = %error,
        attempt,
        error_kind = ?kind,
        "Reconciliation error"
    );

    compute_backoff(attempt, kind, floor)
}

/// Run the Service controller until SIGTERM/SIGINT
pub async fn run(client: Client, ctx: Arc<Context>) {
    let services: Api<Service> = Api::all(client);

    info!("Starting Service controller");

    Controller::new(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = ?e, "Service controller stream error");
            }
        })
        .await;

    info!("Service controller stopped");
}
