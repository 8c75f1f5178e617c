//! Kubernetes controller for watched Services

pub mod retry;
pub mod service;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::RouterClient;
use crate::config::PortForwardConfigSpec;
use crate::desired::{DesiredStateCalculator, PortRegistry};
use crate::events::EventPublisher;
use crate::executor::OperationExecutor;
use crate::finalizer::FinalizerLifecycle;
use crate::locks::KeyedLocks;
use crate::periodic::PeriodicReconciler;
use crate::rate_limit::ErrorRateLimiter;
use crate::store::ServiceStore;

use self::retry::RetryTracker;

/// Shared state for the event-driven controller and the periodic loop
pub struct Context {
    /// Router port-forward API
    pub router: Arc<dyn RouterClient>,
    /// Finalizer and annotation writes on Services
    pub store: Arc<dyn ServiceStore>,
    pub events: Arc<dyn EventPublisher>,
    /// Process-wide external port reservations
    pub registry: Arc<PortRegistry>,
    pub calculator: Arc<DesiredStateCalculator>,
    pub executor: Arc<OperationExecutor>,
    pub finalizer: FinalizerLifecycle,
    pub limiter: Arc<ErrorRateLimiter>,
    /// Held from router snapshot through execution, per Service
    pub locks: Arc<KeyedLocks>,
    pub retry_tracker: RetryTracker,
    /// Fires on shutdown; in-flight passes stop between operations
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(
        router: Arc<dyn RouterClient>,
        store: Arc<dyn ServiceStore>,
        events: Arc<dyn EventPublisher>,
        config: &PortForwardConfigSpec,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(PortRegistry::new());
        Self {
            calculator: Arc::new(DesiredStateCalculator::new(registry.clone(), config.defaults.clone())),
            executor: Arc::new(OperationExecutor::new(router.clone(), registry.clone())),
            finalizer: FinalizerLifecycle::new(
                router.clone(),
                store.clone(),
                events.clone(),
                registry.clone(),
                config.finalizer.clone(),
            ),
            limiter: Arc::new(ErrorRateLimiter::new()),
            locks: Arc::new(KeyedLocks::new()),
            retry_tracker: RetryTracker::new(),
            router,
            store,
            events,
            registry,
            cancel,
        }
    }

    /// Drift loop sharing this context's registry, executor, locks and limiter
    pub fn periodic(&self, config: &PortForwardConfigSpec) -> PeriodicReconciler {
        PeriodicReconciler::new(
            self.router.clone(),
            self.store.clone(),
            self.events.clone(),
            self.calculator.clone(),
            self.executor.clone(),
            self.locks.clone(),
            self.limiter.clone(),
            &config.reconcile,
        )
    }
}
