use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{ClientError, ResourceClient, WatchStream};
use crate::cancel::RunContext;
use crate::resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};
use crate::retry::retry;

/// Client wrapper that retries every call on malformed responses
///
/// Any other error is returned at once. The wrapper is bound to a context;
/// calls stop retrying when that context is done.
pub struct RetryingClient<C: ?Sized> {
    inner: Arc<C>,
    ctx: RunContext,
}

impl<C: ?Sized> Clone for RetryingClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<C: ResourceClient + ?Sized + 'static> RetryingClient<C> {
    #[must_use]
    pub fn new(inner: Arc<C>, ctx: RunContext) -> Self {
        Self { inner, ctx }
    }
}

#[async_trait]
impl<C: ResourceClient + ?Sized + 'static> ResourceClient for RetryingClient<C> {
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument, ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let key = key.clone();
                async move { inner.get(&key).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }

    async fn list(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceDocument>, ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let type_id = type_id.clone();
                let namespace = namespace.map(str::to_string);
                let selector = selector.clone();
                async move { inner.list(&type_id, namespace.as_deref(), &selector).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }

    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let doc = doc.clone();
                async move { inner.create(&doc).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }

    async fn patch(
        &self,
        target: &ResourceDocument,
        patch: &Value,
    ) -> Result<ResourceDocument, ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let target = target.clone();
                let patch = patch.clone();
                async move { inner.patch(&target, &patch).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let key = key.clone();
                async move { inner.delete(&key).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }

    async fn watch(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
    ) -> Result<WatchStream, ClientError> {
        let result = retry(
            &self.ctx,
            || {
                let inner = self.inner.clone();
                let type_id = type_id.clone();
                let namespace = namespace.map(str::to_string);
                async move { inner.watch(&type_id, namespace.as_deref()).await }
            },
            &[ClientError::is_malformed_response],
        )
        .await;
        result.map_err(ClientError::from)
    }
}
