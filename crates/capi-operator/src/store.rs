//! Kind-erased access to every provider CR
//!
//! The side controllers (secret propagation, operator-deployment cleanup)
//! act on all seven kinds at once. They go through [`ProviderStore`] so they
//! can be tested without an API server.

use std::sync::Arc;

use async_trait::async_trait;
use capi_operator_common::crd::ProviderObject;
use capi_operator_common::Error;
use capi_operator_provider::registry::registered_types;
use capi_operator_provider::ClusterOps;

#[cfg(test)]
use mockall::automock;

/// Provider CR operations shared by the side controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Every provider of every registered kind
    async fn list_all(&self) -> Result<Vec<ProviderObject>, Error>;

    /// Set an annotation on a provider
    async fn set_annotation(
        &self,
        provider: &ProviderObject,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Request deletion of a provider
    async fn delete_provider(&self, provider: &ProviderObject) -> Result<(), Error>;
}

/// [`ProviderStore`] backed by the reconciler's cluster operations
pub struct ClusterProviderStore {
    ops: Arc<dyn ClusterOps>,
}

impl ClusterProviderStore {
    /// Wrap cluster operations
    pub fn new(ops: Arc<dyn ClusterOps>) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl ProviderStore for ClusterProviderStore {
    async fn list_all(&self) -> Result<Vec<ProviderObject>, Error> {
        let mut all = Vec::new();
        for provider_type in registered_types() {
            all.extend(self.ops.list_providers(provider_type).await?);
        }
        Ok(all)
    }

    async fn set_annotation(
        &self,
        provider: &ProviderObject,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        self.ops.set_annotation(provider, key, value).await
    }

    async fn delete_provider(&self, provider: &ProviderObject) -> Result<(), Error> {
        self.ops.delete_provider(provider).await
    }
}
