//! Type registry and scope discovery
//!
//! The registry is an immutable table built once at start-up and handed to
//! whatever needs to know whether a type lives inside a namespace. Live
//! clusters answer the same question through API discovery (see
//! [`crate::client::KubeClient`]) and fall back to the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ClientError;
use crate::resource::TypeId;

/// Where objects of a type live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Resolves whether a type is namespace-scoped
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn is_namespaced(&self, type_id: &TypeId) -> Result<bool, ClientError>;
}

/// Immutable group/kind → scope table
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    scopes: HashMap<(String, String), Scope>,
}

/// Builder for [`TypeRegistry`]
#[derive(Debug, Clone, Default)]
pub struct TypeRegistryBuilder {
    scopes: HashMap<(String, String), Scope>,
}

impl TypeRegistryBuilder {
    #[must_use]
    pub fn namespaced(mut self, group: &str, kind: &str) -> Self {
        self.scopes
            .insert((group.to_string(), kind.to_string()), Scope::Namespaced);
        self
    }

    #[must_use]
    pub fn cluster(mut self, group: &str, kind: &str) -> Self {
        self.scopes
            .insert((group.to_string(), kind.to_string()), Scope::Cluster);
        self
    }

    /// Start from the built-in Kubernetes types
    #[must_use]
    pub fn with_builtin(mut self) -> Self {
        self.scopes.extend(TypeRegistry::builtin().scopes);
        self
    }

    #[must_use]
    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            scopes: self.scopes,
        }
    }

    #[must_use]
    pub fn build_shared(self) -> Arc<TypeRegistry> {
        Arc::new(self.build())
    }
}

const NAMESPACED: &[(&str, &str)] = &[
    ("", "ConfigMap"),
    ("", "Endpoints"),
    ("", "Event"),
    ("", "LimitRange"),
    ("", "PersistentVolumeClaim"),
    ("", "Pod"),
    ("", "ReplicationController"),
    ("", "ResourceQuota"),
    ("", "Secret"),
    ("", "Service"),
    ("", "ServiceAccount"),
    ("apps", "DaemonSet"),
    ("apps", "Deployment"),
    ("apps", "ReplicaSet"),
    ("apps", "StatefulSet"),
    ("batch", "CronJob"),
    ("batch", "Job"),
    ("autoscaling", "HorizontalPodAutoscaler"),
    ("coordination.k8s.io", "Lease"),
    ("networking.k8s.io", "Ingress"),
    ("networking.k8s.io", "NetworkPolicy"),
    ("policy", "PodDisruptionBudget"),
    ("rbac.authorization.k8s.io", "Role"),
    ("rbac.authorization.k8s.io", "RoleBinding"),
];

const CLUSTER: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("networking.k8s.io", "IngressClass"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("storage.k8s.io", "StorageClass"),
];

impl TypeRegistry {
    #[must_use]
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Core Kubernetes types with their scopes
    #[must_use]
    pub fn builtin() -> Self {
        let mut scopes = HashMap::new();
        for (group, kind) in NAMESPACED {
            scopes.insert((group.to_string(), kind.to_string()), Scope::Namespaced);
        }
        for (group, kind) in CLUSTER {
            scopes.insert((group.to_string(), kind.to_string()), Scope::Cluster);
        }
        Self { scopes }
    }

    pub fn scope(&self, type_id: &TypeId) -> Option<Scope> {
        self.scopes
            .get(&(type_id.group.clone(), type_id.kind.clone()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[async_trait]
impl Discovery for TypeRegistry {
    async fn is_namespaced(&self, type_id: &TypeId) -> Result<bool, ClientError> {
        match self.scope(type_id) {
            Some(scope) => Ok(scope == Scope::Namespaced),
            None => Err(ClientError::Discovery(
                type_id.to_string(),
                "type is not registered".to_string(),
            )),
        }
    }
}
