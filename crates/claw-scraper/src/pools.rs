//! Inference pool definitions and the directory that serves them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Namespace assumed when a pool does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Phase reported for pools whose resource carries no status yet.
pub const DEFAULT_PHASE: &str = "Pending";

/// A logical inference pool: a set of serving replicas of one model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pool {
    /// Pool name; also the value pods are labelled with.
    pub name: String,
    /// Namespace the pool's pods run in. Empty means `default`.
    pub namespace: String,
    /// GPU model, e.g. `A100`.
    pub gpu_type: String,
    /// GPUs per replica.
    pub gpu_count: u32,
    /// Declared replica count.
    pub replicas: u32,
    /// Served model.
    pub model_name: String,
    /// Served model version.
    pub model_version: String,
    /// Serving runtime, e.g. `vllm`.
    pub serving_backend: String,
    /// Autoscaling floor.
    pub min_replicas: u32,
    /// Autoscaling ceiling.
    pub max_replicas: u32,
    /// Lifecycle phase as reported by the cluster.
    pub phase: String,
}

impl Pool {
    /// Creates a pool with just a name and namespace.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the namespace to query, substituting `default` when empty.
    #[must_use]
    pub fn effective_namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Label selectors tried in order when discovering the pool's pods.
    #[must_use]
    pub fn pod_selectors(&self) -> [String; 3] {
        [
            format!("app={}", self.name),
            format!("app.kubernetes.io/instance={}", self.name),
            format!("app.kubernetes.io/name={}", self.name),
        ]
    }
}

/// Read side: the pools the scraper should visit each cycle.
pub trait PoolDirectory: Send + Sync {
    /// Lists every known pool.
    fn list_pools(&self) -> impl Future<Output = Result<Vec<Pool>>> + Send;
}

/// Write side: where the pool sync records what it finds.
pub trait PoolStore: Send + Sync {
    /// Inserts or replaces a pool, keyed by namespace and name.
    fn upsert_pool(&self, pool: Pool) -> impl Future<Output = Result<()>> + Send;
}

/// Pool directory held in memory, seeded from configuration and kept
/// current by the pool sync.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPoolDirectory {
    pools: Arc<RwLock<BTreeMap<(String, String), Pool>>>,
}

impl InMemoryPoolDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding the given pools.
    #[must_use]
    pub fn with_pools(pools: impl IntoIterator<Item = Pool>) -> Self {
        let directory = Self::new();
        for pool in pools {
            directory.insert(pool);
        }
        directory
    }

    /// Inserts or replaces a pool.
    pub fn insert(&self, pool: Pool) {
        let key = (pool.effective_namespace().to_string(), pool.name.clone());
        self.pools.write().insert(key, pool);
    }

    /// Removes a pool, returning it if it existed.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Pool> {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        self.pools
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Returns the pools ordered by namespace then name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Pool> {
        self.pools.read().values().cloned().collect()
    }

    /// Returns the number of pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Returns true if there are no pools.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

impl PoolDirectory for InMemoryPoolDirectory {
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.snapshot())
    }
}

impl PoolStore for InMemoryPoolDirectory {
    async fn upsert_pool(&self, pool: Pool) -> Result<()> {
        self.insert(pool);
        Ok(())
    }
}
