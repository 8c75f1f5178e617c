//! Kubernetes Event notifications
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation. Every notification also carries structured data, which
//! is written to the log alongside the event.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use serde_json::Value;
use tracing::{info, warn};

/// Kubernetes caps Event notes at 1KiB
const MAX_NOTE_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationType {
    Normal,
    Warning,
}

/// One outbound notification about a Service
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub type_: NotificationType,
    pub reason: &'static str,
    pub action: &'static str,
    pub message: String,
    pub data: Value,
}

impl Notification {
    pub fn normal(reason: &'static str, action: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_: NotificationType::Normal,
            reason,
            action,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_: NotificationType::Warning,
            ..Self::normal(reason, action, message)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `notification` on `object`. Never fails.
    async fn publish(&self, object: &ObjectReference, notification: Notification);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_NOTE_LEN {
        return message.to_string();
    }
    let mut end = MAX_NOTE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, object: &ObjectReference, notification: Notification) {
        let name = object.name.as_deref().unwrap_or_default();
        let namespace = object.namespace.as_deref().unwrap_or_default();
        match notification.type_ {
            NotificationType::Normal => info!(
                namespace,
                service = name,
                reason = notification.reason,
                data = %notification.data,
                "{}",
                notification.message
            ),
            NotificationType::Warning => warn!(
                namespace,
                service = name,
                reason = notification.reason,
                data = %notification.data,
                "{}",
                notification.message
            ),
        }

        let event = Event {
            type_: match notification.type_ {
                NotificationType::Normal => EventType::Normal,
                NotificationType::Warning => EventType::Warning,
            },
            reason: notification.reason.to_string(),
            note: Some(truncate(&notification.message)),
            action: notification.action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                reason = notification.reason,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    pub const PORT_FORWARD_CREATED: &str = "PortForwardCreated";
    pub const PORT_FORWARD_UPDATED: &str = "PortForwardUpdated";
    pub const PORT_FORWARD_DELETED: &str = "PortForwardDeleted";
    /// A manually created rule was adopted
    pub const OWNERSHIP_TAKEOVER: &str = "OwnershipTakeover";
    pub const OPERATION_FAILED: &str = "OperationFailed";
    pub const DRIFT_DETECTED: &str = "DriftDetected";
    pub const DRIFT_CORRECTED: &str = "DriftCorrected";
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
    /// Finalizer removed without a successful cleanup
    pub const CLEANUP_FAILED_MAX_RETRIES: &str = "CleanupFailedMaxRetries";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const DRIFT_CORRECTION: &str = "DriftCorrection";
    pub const CLEANUP: &str = "Cleanup";
}
