//! Access to the watched Services
//!
//! The reconciler only needs a handful of writes on the Service itself:
//! finalizer add/remove and JSON annotations holding its persisted state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use thiserror::Error;
use tracing::debug;

use crate::config::FINALIZER;
use crate::rules::ServiceKey;

const FIELD_MANAGER: &str = "portforward-operator";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Failed to encode patch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Every Service in the cluster
    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;

    /// Attach the cleanup finalizer (no-op if present)
    async fn add_finalizer(&self, key: &ServiceKey) -> Result<(), StoreError>;

    /// Detach the cleanup finalizer (no-op if absent or the Service is gone)
    async fn remove_finalizer(&self, key: &ServiceKey) -> Result<(), StoreError>;

    /// Merge-patch annotations; `None` removes the key
    async fn patch_annotations(
        &self,
        key: &ServiceKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), StoreError>;
}

/// [`ServiceStore`] backed by the Kubernetes API
pub struct KubeServiceStore {
    client: Client,
}

impl KubeServiceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ServiceKey) -> Api<Service> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn patch_finalizers(&self, key: &ServiceKey, finalizers: Vec<String>) -> Result<(), StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(key)
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceStore for KubeServiceStore {
    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let api: Api<Service> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn add_finalizer(&self, key: &ServiceKey) -> Result<(), StoreError> {
        let service = self.api(key).get(&key.name).await?;
        let mut finalizers = service.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }

        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(key, finalizers).await?;
        debug!(service = %key, "Added finalizer");
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ServiceKey) -> Result<(), StoreError> {
        let service = match self.api(key).get(&key.name).await {
            Ok(service) => service,
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let current = service.metadata.finalizers.unwrap_or_default();
        if !current.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }

        let finalizers: Vec<String> = current.into_iter().filter(|f| f != FINALIZER).collect();
        self.patch_finalizers(key, finalizers).await?;
        debug!(service = %key, "Removed finalizer");
        Ok(())
    }

    async fn patch_annotations(
        &self,
        key: &ServiceKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<(), StoreError> {
        if annotations.is_empty() {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });
        self.api(key)
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
