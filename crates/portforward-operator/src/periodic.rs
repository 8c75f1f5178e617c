//! Periodic full-fleet drift correction
//!
//! Every interval one router snapshot is compared against all managed
//! Services. A Service that shows drift is re-checked against a fresh
//! listing while holding its key lock, so a correction never races the
//! event-driven controller on the same Service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::client::{RouterClient, RouterError};
use crate::config::ReconcileConfig;
use crate::desired::DesiredStateCalculator;
use crate::drift::DriftDetector;
use crate::events::{actions, reasons, EventPublisher, Notification};
use crate::executor::{ExecutionError, OperationExecutor};
use crate::locks::KeyedLocks;
use crate::rate_limit::ErrorRateLimiter;
use crate::rules::RuleSnapshot;
use crate::service::ManagedService;
use crate::store::{ServiceStore, StoreError};

#[derive(Debug, Error)]
pub enum PassError {
    #[error("failed to list services: {0}")]
    Store(#[from] StoreError),
    #[error("failed to list router rules: {0}")]
    Router(#[from] RouterError),
}

/// Outcome counters of one drift pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub services: usize,
    pub drifted: usize,
    pub corrected: usize,
    pub failed: usize,
    /// Services not visited because the pass was cancelled
    pub skipped: usize,
    pub operations: usize,
}

pub struct PeriodicReconciler {
    router: Arc<dyn RouterClient>,
    store: Arc<dyn ServiceStore>,
    events: Arc<dyn EventPublisher>,
    calculator: Arc<DesiredStateCalculator>,
    executor: Arc<OperationExecutor>,
    locks: Arc<KeyedLocks>,
    /// Repeated failures of the same Service are reported once per backoff window
    limiter: Arc<ErrorRateLimiter>,
    interval: Duration,
    passes: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl PeriodicReconciler {
    pub fn new(
        router: Arc<dyn RouterClient>,
        store: Arc<dyn ServiceStore>,
        events: Arc<dyn EventPublisher>,
        calculator: Arc<DesiredStateCalculator>,
        executor: Arc<OperationExecutor>,
        locks: Arc<KeyedLocks>,
        limiter: Arc<ErrorRateLimiter>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            router,
            store,
            events,
            calculator,
            executor,
            locks,
            limiter,
            interval: config.periodic_interval(),
            passes: Arc::new(Semaphore::new(config.max_concurrent_passes as usize)),
            tracker: TaskTracker::new(),
        }
    }

    /// Tick until `cancel` fires, then wait for in-flight passes to drain
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            max_concurrent_passes = self.passes.available_permits(),
            "Starting periodic drift reconciliation"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.start_pass(&cancel);
                }
            }
        }

        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Waiting for drift passes to finish");
        self.tracker.wait().await;
        info!("Periodic drift reconciliation stopped");
    }

    /// Spawn a pass if a slot is free. Returns whether one was started.
    pub fn start_pass(self: &Arc<Self>, cancel: &CancellationToken) -> bool {
        let Ok(permit) = self.passes.clone().try_acquire_owned() else {
            warn!("All drift pass slots busy, skipping this tick");
            return false;
        };

        let this = Arc::clone(self);
        let cancel = cancel.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = this.run_pass(&cancel).await {
                warn!(error = %e, "Drift pass failed");
            }
        });
        true
    }

    /// One full-fleet pass
    #[instrument(skip_all)]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary, PassError> {
        let services: Vec<ManagedService> = self
            .store
            .list_services()
            .await?
            .iter()
            .filter_map(|svc| ManagedService::from_service(svc).ok())
            .filter(|svc| svc.has_finalizer && !svc.deleting && svc.qualifies())
            .collect();
        let snapshot = self.router.list_rules().await?;

        let mut summary = PassSummary {
            services: services.len(),
            ..Default::default()
        };

        for (index, service) in services.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.skipped = services.len() - index;
                break;
            }
            if let Err(e) = self.reconcile_service(service, &snapshot, cancel, &mut summary).await {
                if matches!(e, ExecutionError::Cancelled { .. }) {
                    summary.skipped = services.len() - index - 1;
                    break;
                }
            }
        }

        if summary.drifted > 0 || summary.failed > 0 || summary.skipped > 0 {
            info!(
                services = summary.services,
                drifted = summary.drifted,
                corrected = summary.corrected,
                failed = summary.failed,
                skipped = summary.skipped,
                operations = summary.operations,
                "Drift pass complete"
            );
        } else {
            debug!(services = summary.services, "Drift pass complete, no drift");
        }
        Ok(summary)
    }

    async fn reconcile_service(
        &self,
        service: &ManagedService,
        snapshot: &[RuleSnapshot],
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Result<(), ExecutionError> {
        let analysis = match DriftDetector::analyze(service, &self.calculator, snapshot) {
            Ok(analysis) => analysis,
            Err(e) => {
                if self.limiter.should_log(&limiter_key(service), &e.to_string()) {
                    warn!(service = %service.key, error = %e, "Skipping service with invalid desired state");
                } else {
                    debug!(service = %service.key, error = %e, "Skipping service with invalid desired state");
                }
                summary.failed += 1;
                return Ok(());
            }
        };
        if !analysis.has_drift() {
            return Ok(());
        }

        let _guard = self.locks.lock(&service.key).await;

        let analysis = match self.router.list_rules().await {
            Ok(fresh) => DriftDetector::compare(
                &analysis.service,
                analysis.object_ref.clone(),
                analysis.desired.clone(),
                &fresh,
            ),
            Err(e) => {
                warn!(service = %service.key, error = %e, "Could not refresh router rules, skipping correction");
                summary.failed += 1;
                return Ok(());
            }
        };
        if !analysis.has_drift() {
            debug!(service = %service.key, "Drift resolved before correction");
            return Ok(());
        }

        summary.drifted += 1;
        let plan = analysis.correction_plan();
        summary.operations += plan.len();
        self.events
            .publish(
                &analysis.object_ref,
                Notification::warning(
                    reasons::DRIFT_DETECTED,
                    actions::DRIFT_CORRECTION,
                    format!(
                        "Drift detected: {} missing, {} wrong, {} extra",
                        analysis.missing.len(),
                        analysis.wrong.len(),
                        analysis.extra.len()
                    ),
                )
                .with_data(analysis.summary()),
            )
            .await;

        match self.executor.execute(plan, cancel).await {
            Ok(result) => {
                summary.corrected += 1;
                self.limiter.reset(&limiter_key(service));
                self.events
                    .publish(
                        &analysis.object_ref,
                        Notification::normal(
                            reasons::DRIFT_CORRECTED,
                            actions::DRIFT_CORRECTION,
                            format!("Drift corrected with {} operation(s)", result.applied()),
                        )
                        .with_data(json!({
                            "created": result.created.len(),
                            "updated": result.updated.len(),
                            "deleted": result.deleted.len(),
                        })),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                summary.failed += 1;
                if !self.limiter.should_log(&limiter_key(service), &e.to_string()) {
                    debug!(service = %service.key, error = %e, "Repeated drift correction failure suppressed");
                    return Err(e);
                }
                warn!(service = %service.key, error = %e, "Drift correction failed");
                let failed: Vec<_> = e.result().failures.iter().map(|f| f.operation.summary()).collect();
                self.events
                    .publish(
                        &analysis.object_ref,
                        Notification::warning(
                            reasons::OPERATION_FAILED,
                            actions::DRIFT_CORRECTION,
                            format!("Drift correction failed: {e}"),
                        )
                        .with_data(json!({
                            "failed_operations": failed,
                            "rolled_back": e.result().rolled_back.len(),
                            "rollback_failed": e.rollback_failed(),
                        })),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

/// Kept apart from the controller's entry for the same Service
fn limiter_key(service: &ManagedService) -> String {
    format!("drift:{}", service.key)
}
