//! Kubeconfig → client resolution
//!
//! A case may address more than one cluster: every step can name its own
//! kubeconfig. Connectors cache one client per kubeconfig path; the empty
//! path means the run's default cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{debug, info};

use super::{ClientError, KubeClient, MemoryClient, SharedClient};
use crate::registry::{Discovery, TypeRegistry};

/// A connected cluster: CRUD client plus scope discovery
#[derive(Clone)]
pub struct Cluster {
    pub client: SharedClient,
    pub discovery: Arc<dyn Discovery>,
    /// Kubeconfig path this cluster was reached through, empty for the default
    pub kubeconfig: String,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

/// Resolves a kubeconfig path to a connected cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster behind `kubeconfig`
    ///
    /// With `force_new` any cached client for the path is replaced.
    async fn connect(&self, kubeconfig: &str, force_new: bool) -> Result<Cluster, ClientError>;
}

/// Connector for real clusters
pub struct KubeConnector {
    registry: Arc<TypeRegistry>,
    default_kubeconfig: Option<String>,
    cache: tokio::sync::Mutex<HashMap<String, Cluster>>,
}

impl KubeConnector {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            default_kubeconfig: None,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Use this kubeconfig instead of the ambient one for the default cluster
    #[must_use]
    pub fn default_kubeconfig(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.default_kubeconfig = (!path.is_empty()).then_some(path);
        self
    }

    async fn build(&self, path: &str) -> Result<kube::Client, ClientError> {
        let effective = if path.is_empty() {
            self.default_kubeconfig.as_deref()
        } else {
            Some(path)
        };

        match effective {
            None => kube::Client::try_default()
                .await
                .map_err(|e| ClientError::Connect(e.to_string())),
            Some(file) => {
                let kubeconfig = Kubeconfig::read_from(file)
                    .map_err(|e| ClientError::Connect(format!("{file}: {e}")))?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ClientError::Connect(format!("{file}: {e}")))?;
                kube::Client::try_from(config)
                    .map_err(|e| ClientError::Connect(format!("{file}: {e}")))
            }
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &str, force_new: bool) -> Result<Cluster, ClientError> {
        let mut cache = self.cache.lock().await;
        if !force_new {
            if let Some(cluster) = cache.get(kubeconfig) {
                return Ok(cluster.clone());
            }
        }

        let client = KubeClient::new(self.build(kubeconfig).await?, self.registry.clone());
        let client = Arc::new(client);
        let cluster = Cluster {
            client: client.clone(),
            discovery: client,
            kubeconfig: kubeconfig.to_string(),
        };

        info!(
            kubeconfig = %display_path(kubeconfig),
            force_new = force_new,
            "Connected to cluster"
        );
        cache.insert(kubeconfig.to_string(), cluster.clone());
        Ok(cluster)
    }
}

/// Connector handing out in-memory clusters, one per kubeconfig path
pub struct MemoryConnector {
    registry: Arc<TypeRegistry>,
    clusters: Mutex<HashMap<String, Arc<MemoryClient>>>,
    unreachable: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            clusters: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        }
    }

    /// In-memory store behind `kubeconfig`, created on first use
    pub fn cluster(&self, kubeconfig: &str) -> Arc<MemoryClient> {
        let mut clusters = self
            .clusters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        clusters
            .entry(kubeconfig.to_string())
            .or_insert_with(|| Arc::new(MemoryClient::new(self.registry.clone())))
            .clone()
    }

    /// Make connecting to `kubeconfig` fail
    pub fn unreachable(&self, kubeconfig: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(kubeconfig.to_string());
    }

    /// Number of connect calls so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for MemoryConnector {
    async fn connect(&self, kubeconfig: &str, force_new: bool) -> Result<Cluster, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|p| p == kubeconfig);
        if refused {
            return Err(ClientError::Connect(format!(
                "{}: connection refused",
                display_path(kubeconfig)
            )));
        }

        debug!(kubeconfig = %display_path(kubeconfig), force_new = force_new, "Connected to in-memory cluster");
        let client = self.cluster(kubeconfig);
        Ok(Cluster {
            client: client.clone(),
            discovery: client,
            kubeconfig: kubeconfig.to_string(),
        })
    }
}

fn display_path(kubeconfig: &str) -> &str {
    if kubeconfig.is_empty() {
        "<default>"
    } else {
        kubeconfig
    }
}
