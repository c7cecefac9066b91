//! In-memory cluster store
//!
//! Behaves like an API server for the parts the engine relies on: resource
//! versions bumped on every write, fenced merge patches, label-filtered lists,
//! namespace deletion cascading to the objects inside it, and a watch feed.
//! Faults can be queued per operation to exercise retry and conflict paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ClientError, ResourceClient, WatchEvent, WatchStream};
use crate::registry::{Discovery, Scope, TypeRegistry};
use crate::resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};

/// Client operations, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<ObjectKey, ResourceDocument>,
    version: u64,
    faults: HashMap<Op, VecDeque<ClientError>>,
    calls: HashMap<Op, usize>,
}

/// In-memory [`ResourceClient`]
pub struct MemoryClient {
    store: Mutex<Store>,
    registry: Arc<TypeRegistry>,
    events: broadcast::Sender<WatchEvent>,
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("objects", &self.lock().objects.len())
            .finish()
    }
}

impl MemoryClient {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store: Mutex::new(Store::default()),
            registry,
            events,
        }
    }

    /// Store backed by the built-in type registry
    #[must_use]
    pub fn with_builtin_types() -> Self {
        Self::new(Arc::new(TypeRegistry::builtin()))
    }

    /// Make the next `op` call fail with `err`; queued faults fire in order
    pub fn inject(&self, op: Op, err: ClientError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Number of `op` calls seen so far, including failed ones
    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every stored object, in key order
    pub fn objects(&self) -> Vec<ResourceDocument> {
        self.lock().objects.values().cloned().collect()
    }

    /// Write an object directly, bypassing create semantics
    ///
    /// Simulates another actor (a controller) changing state.
    pub fn put(&self, doc: ResourceDocument) -> Result<ResourceDocument, ClientError> {
        let key = self.storage_key(&doc)?;
        let mut store = self.lock();
        let stored = stamp(&mut store, doc);
        store.objects.insert(key, stored.clone());
        drop(store);
        let _ = self.events.send(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Count the call and pop a queued fault, if any
    fn enter(&self, op: Op) -> Result<(), ClientError> {
        let mut store = self.lock();
        *store.calls.entry(op).or_default() += 1;
        match store.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(op = ?op, error = %err, "Injected fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn scope(&self, type_id: &TypeId) -> Scope {
        self.registry.scope(type_id).unwrap_or(Scope::Namespaced)
    }

    /// Normalize a key: cluster-scoped objects are stored without namespace
    fn normalize(&self, key: &ObjectKey) -> ObjectKey {
        let mut key = key.clone();
        if self.scope(&key.type_id) == Scope::Cluster {
            key.namespace = None;
        }
        key.type_id.version = String::new();
        key
    }

    fn storage_key(&self, doc: &ResourceDocument) -> Result<ObjectKey, ClientError> {
        let key = doc
            .key()
            .ok_or_else(|| ClientError::Invalid(format!("{} has no name", doc.id())))?;
        if key.type_id.is_empty() {
            return Err(ClientError::Invalid(format!(
                "{} has no apiVersion/kind",
                key.name
            )));
        }
        if self.scope(&key.type_id) == Scope::Namespaced && key.namespace.is_none() {
            return Err(ClientError::Invalid(format!("{key} requires a namespace")));
        }
        Ok(self.normalize(&key))
    }
}

fn stamp(store: &mut Store, mut doc: ResourceDocument) -> ResourceDocument {
    store.version += 1;
    doc.set_resource_version(Some(&store.version.to_string()));
    doc
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument, ClientError> {
        self.enter(Op::Get)?;
        let stored = self.normalize(key);
        self.lock()
            .objects
            .get(&stored)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn list(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceDocument>, ClientError> {
        self.enter(Op::List)?;
        let cluster_scoped = self.scope(type_id) == Scope::Cluster;
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| key.type_id.same_kind(type_id))
            .filter(|(key, _)| {
                cluster_scoped || namespace.is_none() || key.namespace.as_deref() == namespace
            })
            .filter(|(_, doc)| selector.matches(&doc.labels()))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClientError> {
        self.enter(Op::Create)?;
        let key = self.storage_key(doc)?;
        let mut store = self.lock();
        if store.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(doc.id()));
        }
        let mut doc = doc.clone();
        doc.metadata_mut().insert(
            "uid".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        let stored = stamp(&mut store, doc);
        store.objects.insert(key, stored.clone());
        drop(store);

        let _ = self.events.send(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn patch(
        &self,
        target: &ResourceDocument,
        patch: &Value,
    ) -> Result<ResourceDocument, ClientError> {
        self.enter(Op::Patch)?;
        let key = self.storage_key(target)?;
        let mut store = self.lock();
        let current = store
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(target.id()))?;

        if let Some(fence) = target.resource_version() {
            if current.resource_version() != Some(fence) {
                return Err(ClientError::Conflict(target.id()));
            }
        }

        let mut merged = current.into_value();
        json_patch::merge(&mut merged, patch);
        let merged = ResourceDocument::from_value(merged)
            .map_err(|e| ClientError::Invalid(e.to_string()))?;
        let stored = stamp(&mut store, merged);
        store.objects.insert(key, stored.clone());
        drop(store);

        let _ = self.events.send(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.enter(Op::Delete)?;
        let stored = self.normalize(key);
        let mut store = self.lock();
        let removed = store
            .objects
            .remove(&stored)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;

        let mut gone = vec![removed];
        if key.type_id.same_kind(&TypeId::namespace()) {
            let inside: Vec<ObjectKey> = store
                .objects
                .keys()
                .filter(|k| k.namespace.as_deref() == Some(key.name.as_str()))
                .cloned()
                .collect();
            for k in inside {
                if let Some(doc) = store.objects.remove(&k) {
                    gone.push(doc);
                }
            }
        }
        drop(store);

        for doc in gone {
            let _ = self.events.send(WatchEvent::Deleted(doc));
        }
        Ok(())
    }

    async fn watch(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
    ) -> Result<WatchStream, ClientError> {
        let rx = self.events.subscribe();
        let type_id = type_id.clone();
        let namespace = namespace.map(str::to_string);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped = skipped, "Watch consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| {
            let doc = match event {
                WatchEvent::Applied(doc) | WatchEvent::Deleted(doc) => doc,
            };
            let wanted = doc.type_id().same_kind(&type_id)
                && (namespace.is_none() || doc.namespace() == namespace.as_deref());
            futures::future::ready(wanted)
        })
        .map(Ok);

        Ok(stream.boxed())
    }
}

#[async_trait]
impl Discovery for MemoryClient {
    async fn is_namespaced(&self, type_id: &TypeId) -> Result<bool, ClientError> {
        self.registry.is_namespaced(type_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistry::builder()
            .with_builtin()
            .namespaced("example.com", "Widget")
            .build_shared()
    }

    fn widget(name: &str, ns: &str, labels: Value) -> ResourceDocument {
        ResourceDocument::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": name, "namespace": ns, "labels": labels },
            "spec": { "replicas": 1 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_get_roundtrip_assigns_version() {
        let client = MemoryClient::new(registry());
        let created = client.create(&widget("w1", "ns-1", json!({}))).await.unwrap();

        assert!(created.resource_version().is_some());
        let fetched = client.get(&created.key().unwrap()).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let client = MemoryClient::new(registry());
        let w = widget("w1", "ns-1", json!({}));
        client.create(&w).await.unwrap();
        let err = client.create(&w).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_fence_conflicts() {
        let client = MemoryClient::new(registry());
        let created = client.create(&widget("w1", "ns-1", json!({}))).await.unwrap();

        // another writer moves the object on
        client
            .patch(&created.without_resource_version(), &json!({"spec": {"replicas": 2}}))
            .await
            .unwrap();

        let err = client
            .patch(&created, &json!({"spec": {"replicas": 5}}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let client = MemoryClient::new(registry());
        client.create(&widget("a", "ns-1", json!({"team": "a"}))).await.unwrap();
        client.create(&widget("b", "ns-1", json!({"team": "b"}))).await.unwrap();
        client.create(&widget("c", "ns-2", json!({"team": "a"}))).await.unwrap();

        let widget_type = TypeId::new("example.com", "v1", "Widget");
        let selector = LabelSelector::parse("team=a").unwrap();

        let in_ns = client.list(&widget_type, Some("ns-1"), &selector).await.unwrap();
        assert_eq!(in_ns.len(), 1);
        assert_eq!(in_ns[0].name(), Some("a"));

        let everywhere = client.list(&widget_type, None, &selector).await.unwrap();
        assert_eq!(everywhere.len(), 2);
    }

    #[tokio::test]
    async fn test_namespace_delete_cascades() {
        let client = MemoryClient::new(registry());
        let ns = ResourceDocument::new(&TypeId::namespace(), "ns-1");
        client.create(&ns).await.unwrap();
        client.create(&widget("w1", "ns-1", json!({}))).await.unwrap();

        client.delete(&ns.key().unwrap()).await.unwrap();
        assert!(client.objects().is_empty());
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let client = MemoryClient::new(registry());
        client.inject(Op::Get, ClientError::MalformedResponse("garbled".into()));
        let key = ObjectKey::new(TypeId::new("example.com", "v1", "Widget"), Some("ns-1"), "w1");

        assert!(client.get(&key).await.unwrap_err().is_malformed_response());
        assert!(client.get(&key).await.unwrap_err().is_not_found());
        assert_eq!(client.calls(Op::Get), 2);
    }

    #[tokio::test]
    async fn test_watch_sees_applied_and_deleted() {
        let client = MemoryClient::new(registry());
        let widget_type = TypeId::new("example.com", "v1", "Widget");
        let mut events = client.watch(&widget_type, Some("ns-1")).await.unwrap();

        let created = client.create(&widget("w1", "ns-1", json!({}))).await.unwrap();
        client.create(&widget("other", "ns-2", json!({}))).await.unwrap();
        client.delete(&created.key().unwrap()).await.unwrap();

        match events.next().await {
            Some(Ok(WatchEvent::Applied(doc))) => assert_eq!(doc.name(), Some("w1")),
            other => panic!("expected applied event, got {other:?}"),
        }
        match events.next().await {
            Some(Ok(WatchEvent::Deleted(doc))) => assert_eq!(doc.name(), Some("w1")),
            other => panic!("expected deleted event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_namespaced_type_requires_namespace() {
        let client = MemoryClient::new(registry());
        let doc = ResourceDocument::new(&TypeId::new("example.com", "v1", "Widget"), "w1");
        let err = client.create(&doc).await.unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));
    }
}
