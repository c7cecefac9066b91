//! Cluster client capability
//!
//! The engine talks to a cluster only through [`ResourceClient`]. Variants:
//!
//! - [`KubeClient`]: a live API server through kube's dynamic API
//! - [`MemoryClient`]: an in-memory store with resource-version fencing,
//!   used by tests and dry runs
//! - [`RetryingClient`]: wraps any client so every call goes through the
//!   retry loop, tolerating malformed responses
//!
//! Which variant a run uses is decided by the [`ClusterConnector`] it is given.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::cancel::CancelError;
use crate::resource::{LabelSelector, ObjectKey, ResourceDocument, TypeId};
use crate::retry::RetryError;

mod connector;
mod live;
mod memory;
mod retrying;

pub use live::KubeClient;
pub use connector::{Cluster, ClusterConnector, KubeConnector, MemoryConnector};
pub use memory::{MemoryClient, Op};
pub use retrying::RetryingClient;

/// Shared handle to a client variant
pub type SharedClient = Arc<dyn ResourceClient>;

/// Errors from client operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict on {0}: the object has been modified")]
    Conflict(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("failed to discover {0}: {1}")]
    Discovery(String, String),

    #[error("failed to connect to cluster: {0}")]
    Connect(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Context(#[from] CancelError),

    #[error("{0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    pub fn is_malformed_response(&self) -> bool {
        matches!(self, ClientError::MalformedResponse(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, ClientError::Context(CancelError::DeadlineExceeded))
    }
}

impl From<RetryError<ClientError>> for ClientError {
    fn from(err: RetryError<ClientError>) -> Self {
        match err {
            RetryError::Operation(e) => e,
            RetryError::Context(c) => ClientError::Context(c),
            RetryError::Aborted(reason) => ClientError::Aborted(reason),
        }
    }
}

/// Change observed by [`ResourceClient::watch`]
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(ResourceDocument),
    Deleted(ResourceDocument),
}

/// Stream of watch events
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// CRUD and watch over untyped resources
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch one object by identity
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument, ClientError>;

    /// List objects of a type, optionally within one namespace, filtered by labels
    async fn list(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ResourceDocument>, ClientError>;

    /// Create an object; fails with `AlreadyExists` if it is present
    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClientError>;

    /// Merge-patch `target` with `patch`
    ///
    /// When `target` carries a resource version the write is fenced on it and
    /// fails with `Conflict` if the stored object has moved on.
    async fn patch(
        &self,
        target: &ResourceDocument,
        patch: &serde_json::Value,
    ) -> Result<ResourceDocument, ClientError>;

    /// Delete an object by identity
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;

    /// Stream changes to objects of a type
    async fn watch(
        &self,
        type_id: &TypeId,
        namespace: Option<&str>,
    ) -> Result<WatchStream, ClientError>;
}
