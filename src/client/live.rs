//! Live API server client over kube's dynamic API

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource};
use kube::runtime::watcher;
use kube::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ClientError, ResourceClient, WatchEvent, WatchStream};
use crate::registry::{Discovery, Scope, TypeRegistry};
use crate::resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};

/// [`ResourceClient`] backed by a kube [`Client`]
///
/// API resources (plural and scope) are resolved through discovery the first
/// time a type is used and cached for the life of the client.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    registry: Arc<TypeRegistry>,
    resources: Arc<RwLock<HashMap<TypeId, (ApiResource, ApiCapabilities)>>>,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient").finish_non_exhaustive()
    }
}

impl KubeClient {
    #[must_use]
    pub fn new(client: Client, registry: Arc<TypeRegistry>) -> Self {
        Self {
            client,
            registry,
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn resolve(&self, type_id: &TypeId) -> Result<(ApiResource, ApiCapabilities), ClientError> {
        if let Some(found) = self.resources.read().await.get(type_id) {
            return Ok(found.clone());
        }

        let gvk = GroupVersionKind::gvk(&type_id.group, &type_id.version, &type_id.kind);
        let resolved = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClientError::Discovery(type_id.to_string(), e.to_string()))?;

        debug!(kind = %type_id, plural = %resolved.0.plural, "Resolved API resource");
        self.resources
            .write()
            .await
            .insert(type_id.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, caps) = self.resolve(type_id).await?;
        let api = match (caps.scope, namespace) {
            (kube::discovery::Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

/// Map a kube error onto the engine's classification
fn classify(err: kube::Error, what: &str) -> ClientError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClientError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(what.to_string()),
        kube::Error::Api(ae) if ae.code == 403 => {
            ClientError::Api(format!("{what}: permission denied (check RBAC): {}", ae.message))
        }
        kube::Error::SerdeError(e) => ClientError::MalformedResponse(format!("{what}: {e}")),
        other => {
            let raw = other.to_string();
            if raw.contains("connection refused") {
                ClientError::Connect(format!("{what}: cannot connect to Kubernetes API"))
            } else {
                ClientError::Api(format!("{what}: {raw}"))
            }
        }
    }
}

fn to_document(obj: DynamicObject, type_id: &TypeId) -> Result<ResourceDocument, ClientError> {
    let value = serde_json::to_value(obj)
        .map_err(|e| ClientError::MalformedResponse(format!("failed to serialize: {e}")))?;
    let mut doc = ResourceDocument::from_value(value)
        .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
    doc.ensure_type(type_id);
    Ok(doc)
}

fn to_dynamic(doc: &ResourceDocument) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(doc.to_value())
        .map_err(|e| ClientError::Invalid(format!("invalid object format: {e}")))
}

fn require_name(doc: &ResourceDocument) -> Result<ObjectKey, ClientError> {
    doc.key()
        .ok_or_else(|| ClientError::Invalid("object must have metadata.name".to_string()))
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument, ClientError> {
        let api = self.api(&key.type_id, key.namespace.as_deref()).await?;
        let obj = api
            .get(&key.name)
            .await
            .map_err(|e| classify(e, &key.to_string()))?;
        to_document(obj, &key.type_id)
    }

    async fn list(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceDocument>, ClientError> {
        let api = self.api(type_id, namespace).await?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| classify(e, &format!("list {}", type_id.kind)))?;
        list.items
            .into_iter()
            .map(|obj| to_document(obj, type_id))
            .collect()
    }

    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClientError> {
        let key = require_name(doc)?;
        let api = self.api(&key.type_id, key.namespace.as_deref()).await?;
        let obj = api
            .create(&PostParams::default(), &to_dynamic(doc)?)
            .await
            .map_err(|e| classify(e, &key.to_string()))?;

        info!(resource = %key, "Created resource");
        to_document(obj, &key.type_id)
    }

    async fn patch(
        &self,
        target: &ResourceDocument,
        patch: &Value,
    ) -> Result<ResourceDocument, ClientError> {
        let key = require_name(target)?;
        let api = self.api(&key.type_id, key.namespace.as_deref()).await?;

        let mut body = patch.clone();
        if let (Some(version), Value::Object(map)) = (target.resource_version(), &mut body) {
            let meta = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(meta) = meta {
                meta.insert(
                    "resourceVersion".to_string(),
                    Value::String(version.to_string()),
                );
            }
        }

        let obj = api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| classify(e, &key.to_string()))?;

        info!(resource = %key, "Updated resource");
        to_document(obj, &key.type_id)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let api = self.api(&key.type_id, key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, &key.to_string()))?;

        info!(resource = %key, "Deleted resource");
        Ok(())
    }

    async fn watch(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
    ) -> Result<WatchStream, ClientError> {
        let api = self.api(type_id, namespace).await?;
        let type_id = type_id.clone();

        let stream = watcher(api, watcher::Config::default())
            .map_err(|e| ClientError::Api(format!("watch failed: {e}")))
            .filter_map(move |event| {
                let type_id = type_id.clone();
                async move {
                    match event {
                        Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                            Some(to_document(obj, &type_id).map(WatchEvent::Applied))
                        }
                        Ok(watcher::Event::Delete(obj)) => {
                            Some(to_document(obj, &type_id).map(WatchEvent::Deleted))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    }
                }
            });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl Discovery for KubeClient {
    async fn is_namespaced(&self, type_id: &TypeId) -> Result<bool, ClientError> {
        match self.resolve(type_id).await {
            Ok((_, caps)) => Ok(caps.scope == kube::discovery::Scope::Namespaced),
            Err(err) => match self.registry.scope(type_id) {
                Some(scope) => {
                    debug!(kind = %type_id, error = %err, "Discovery failed, using registry");
                    Ok(scope == Scope::Namespaced)
                }
                None => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_status_codes() {
        assert!(classify(api_error(404, "NotFound"), "Pod ns/p").is_not_found());
        assert!(classify(api_error(409, "AlreadyExists"), "Pod ns/p").is_already_exists());
        assert!(classify(api_error(409, "Conflict"), "Pod ns/p").is_conflict());
    }

    #[test]
    fn test_classify_forbidden_mentions_rbac() {
        let err = classify(api_error(403, "Forbidden"), "Pod ns/p");
        assert!(err.to_string().contains("RBAC"));
    }

    #[test]
    fn test_classify_serde_is_malformed() {
        let serde_err = serde_json::from_str::<Value>("{not json").unwrap_err();
        let err = classify(kube::Error::SerdeError(serde_err), "Pod ns/p");
        assert!(err.is_malformed_response());
    }

    #[test]
    fn test_to_dynamic_keeps_content() {
        let doc = ResourceDocument::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns-1" },
            "data": { "k": "v" }
        }))
        .unwrap();
        let obj = to_dynamic(&doc).unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("cm"));
        assert_eq!(obj.data["data"]["k"], "v");
    }
}
