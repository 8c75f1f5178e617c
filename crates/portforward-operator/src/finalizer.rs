//! Deletion cleanup for managed Services
//!
//! While a Service carrying the finalizer is being deleted, every router
//! rule it owns is removed. Progress is stored on the Service itself in a
//! versioned [`CleanupState`] annotation, so the attempt budget survives
//! operator restarts. Once the budget is spent the finalizer is removed
//! anyway: a broken router must never block Service deletion forever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::client::{RouterClient, RouterError};
use crate::config::{annotations, FinalizerConfig};
use crate::delta::owned_rules;
use crate::desired::PortRegistry;
use crate::events::{actions, reasons, EventPublisher, Notification};
use crate::service::ManagedService;
use crate::store::{ServiceStore, StoreError};

/// Current cleanup-state payload version
pub const CLEANUP_STATE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    FailedMaxRetries,
}

/// Durable cleanup progress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupState {
    pub version: u32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub status: CleanupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl Default for CleanupState {
    fn default() -> Self {
        Self {
            version: CLEANUP_STATE_VERSION,
            attempts: 0,
            status: CleanupStatus::Pending,
            last_error: None,
            last_attempt: None,
        }
    }
}

impl CleanupState {
    /// Decode the annotation payload.
    ///
    /// Missing, unreadable or newer-version payloads yield a fresh state.
    pub fn decode(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        match serde_json::from_str::<CleanupState>(raw) {
            Ok(state) if state.version <= CLEANUP_STATE_VERSION => state,
            Ok(state) => {
                warn!(version = state.version, "Unsupported cleanup state version, starting fresh");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "Unreadable cleanup state, starting fresh");
                Self::default()
            }
        }
    }

    /// Wait left before retrying after a failed attempt
    pub fn retry_wait(&self, interval: Duration, now: DateTime<Utc>) -> Option<Duration> {
        self.last_error.as_ref()?;
        let last = self.last_attempt?;
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
        interval.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&CleanupState {
            version: CLEANUP_STATE_VERSION,
            ..self.clone()
        })
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Failed to persist cleanup state: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to encode cleanup state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of one cleanup attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// All owned rules are gone and the finalizer was removed
    Completed { removed: usize },
    /// Cleanup failed; try again after `after`
    Retry {
        after: Duration,
        attempts: u32,
        error: String,
    },
    /// Attempt budget exhausted, finalizer removed without cleanup
    ForcedAfterMaxRetries { attempts: u32 },
}

pub struct FinalizerLifecycle {
    router: Arc<dyn RouterClient>,
    store: Arc<dyn ServiceStore>,
    events: Arc<dyn EventPublisher>,
    registry: Arc<PortRegistry>,
    config: FinalizerConfig,
}

impl FinalizerLifecycle {
    pub fn new(
        router: Arc<dyn RouterClient>,
        store: Arc<dyn ServiceStore>,
        events: Arc<dyn EventPublisher>,
        registry: Arc<PortRegistry>,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            router,
            store,
            events,
            registry,
            config,
        }
    }

    /// Run one cleanup attempt for a Service marked for deletion
    #[instrument(skip(self, service), fields(service = %service.key))]
    pub async fn run(&self, service: &ManagedService) -> Result<FinalizerOutcome, CleanupError> {
        let mut state = CleanupState::decode(service.annotation(annotations::CLEANUP_STATE));

        // Persisting progress retriggers the watch; hold off until the interval
        if let Some(after) = state.retry_wait(self.config.retry_interval(), Utc::now()) {
            debug!(attempts = state.attempts, wait_secs = after.as_secs(), "Cleanup retry not due yet");
            return Ok(FinalizerOutcome::Retry {
                after,
                attempts: state.attempts,
                error: state.last_error.unwrap_or_default(),
            });
        }

        if state.attempts >= self.config.max_retries {
            return self.force_release(service, state).await;
        }

        state.attempts += 1;
        state.status = CleanupStatus::InProgress;
        state.last_attempt = Some(Utc::now());
        self.persist(service, &state).await?;

        match self.remove_owned_rules(service).await {
            Ok(removed) => {
                self.complete(service, removed).await?;
                Ok(FinalizerOutcome::Completed { removed })
            }
            Err(error) => {
                warn!(attempts = state.attempts, error = %error, "Cleanup attempt failed");
                state.last_error = Some(error.clone());
                self.persist(service, &state).await?;
                Ok(FinalizerOutcome::Retry {
                    after: self.config.retry_interval(),
                    attempts: state.attempts,
                    error,
                })
            }
        }
    }

    /// Remove every rule owned by `service`, returning how many were removed.
    ///
    /// Rules that vanish before their removal count as removed.
    async fn remove_owned_rules(&self, service: &ManagedService) -> Result<usize, String> {
        let snapshot = self
            .router
            .list_rules()
            .await
            .map_err(|e| format!("listing router rules: {e}"))?;

        let mut removed = 0;
        let mut failures = Vec::new();
        for rule in owned_rules(&snapshot, &service.key) {
            match self.router.remove_rule(&rule.id).await {
                Ok(()) | Err(RouterError::NotFound(_)) => {
                    info!(rule_id = %rule.id, name = %rule.spec.name, "Removed port-forward rule");
                    removed += 1;
                }
                Err(e) => failures.push(format!("{}: {e}", rule.spec.name)),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(format!(
                "{} of {} rule(s) not removed: {}",
                failures.len(),
                removed + failures.len(),
                failures.join("; ")
            ))
        }
    }

    async fn complete(&self, service: &ManagedService, removed: usize) -> Result<(), CleanupError> {
        let cleared: BTreeMap<String, Option<String>> = annotations::OPERATOR_STATE
            .iter()
            .map(|k| (k.to_string(), None))
            .collect();
        self.store.patch_annotations(&service.key, cleared).await?;
        self.store.remove_finalizer(&service.key).await?;
        self.registry.release_service(&service.key);

        info!(removed, "Cleanup complete, finalizer removed");
        self.events
            .publish(
                &service.object_ref,
                Notification::normal(
                    reasons::CLEANUP_COMPLETE,
                    actions::CLEANUP,
                    format!("Removed {removed} port-forward rule(s)"),
                )
                .with_data(serde_json::json!({ "removed": removed })),
            )
            .await;
        Ok(())
    }

    async fn force_release(
        &self,
        service: &ManagedService,
        mut state: CleanupState,
    ) -> Result<FinalizerOutcome, CleanupError> {
        warn!(
            attempts = state.attempts,
            max_retries = self.config.max_retries,
            last_error = ?state.last_error,
            "Cleanup retries exhausted, removing finalizer without cleanup"
        );

        self.events
            .publish(
                &service.object_ref,
                Notification::warning(
                    reasons::CLEANUP_FAILED_MAX_RETRIES,
                    actions::CLEANUP,
                    format!(
                        "Cleanup failed after {} attempt(s); router rules may need manual removal: {}",
                        state.attempts,
                        state.last_error.as_deref().unwrap_or("unknown error")
                    ),
                )
                .with_data(serde_json::json!({
                    "attempts": state.attempts,
                    "last_error": state.last_error,
                })),
            )
            .await;

        state.status = CleanupStatus::FailedMaxRetries;
        self.persist(service, &state).await?;
        self.store.remove_finalizer(&service.key).await?;
        self.registry.release_service(&service.key);

        Ok(FinalizerOutcome::ForcedAfterMaxRetries {
            attempts: state.attempts,
        })
    }

    async fn persist(&self, service: &ManagedService, state: &CleanupState) -> Result<(), CleanupError> {
        let patch = BTreeMap::from([(annotations::CLEANUP_STATE.to_string(), Some(state.encode()?))]);
        self.store.patch_annotations(&service.key, patch).await?;
        Ok(())
    }
}
