//! Cluster access: the registry of reachable clusters and the per-cluster
//! handle used to list pods and inference stack resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScraperError};

/// Pod phase that marks a pod as serving.
pub const RUNNING_PHASE: &str = "Running";

/// The subset of a pod the scraper needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Lifecycle phase, e.g. `Running`.
    pub phase: String,
    /// Pod IP; empty until assigned.
    pub ip: String,
    /// Node the pod is scheduled on; empty until bound.
    pub node_name: String,
}

impl PodInfo {
    /// Creates a running pod.
    #[must_use]
    pub fn running(
        name: impl Into<String>,
        namespace: impl Into<String>,
        ip: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            phase: RUNNING_PHASE.to_string(),
            ip: ip.into(),
            node_name: node_name.into(),
        }
    }

    /// Only running pods with an address can be scraped.
    #[must_use]
    pub fn is_scrapable(&self) -> bool {
        self.phase == RUNNING_PHASE && !self.ip.is_empty()
    }
}

/// A connection to one cluster's API.
pub trait ClusterHandle: Send + Sync {
    /// Cluster name, used in keys and rows.
    fn name(&self) -> &str;

    /// Lists pods matching a label selector. `None` lists all namespaces.
    fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<PodInfo>>> + Send;

    /// Lists `InferenceStack` resources in all namespaces as raw objects.
    fn list_inference_stacks(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>>> + Send;
}

/// Supplies the clusters currently reachable. The set may change between
/// calls and may be empty.
pub trait ClusterRegistry: Send + Sync {
    /// Handle type this registry hands out.
    type Cluster: ClusterHandle + 'static;

    /// Returns the clusters to visit this cycle.
    fn list_clusters(&self) -> Vec<Arc<Self::Cluster>>;
}

/// A registry over a fixed set of clusters, replaceable at runtime.
#[derive(Debug)]
pub struct StaticClusterRegistry<C> {
    clusters: RwLock<Vec<Arc<C>>>,
}

impl<C> Default for StaticClusterRegistry<C> {
    fn default() -> Self {
        Self {
            clusters: RwLock::new(Vec::new()),
        }
    }
}

impl<C: ClusterHandle> StaticClusterRegistry<C> {
    /// Creates a registry holding the given clusters.
    #[must_use]
    pub fn new(clusters: impl IntoIterator<Item = C>) -> Self {
        Self {
            clusters: RwLock::new(clusters.into_iter().map(Arc::new).collect()),
        }
    }

    /// Adds a cluster, replacing one with the same name.
    pub fn register(&self, cluster: C) {
        let mut clusters = self.clusters.write();
        clusters.retain(|c| c.name() != cluster.name());
        clusters.push(Arc::new(cluster));
    }

    /// Removes a cluster by name. Returns true if it was present.
    pub fn deregister(&self, name: &str) -> bool {
        let mut clusters = self.clusters.write();
        let before = clusters.len();
        clusters.retain(|c| c.name() != name);
        clusters.len() != before
    }
}

impl<C: ClusterHandle + 'static> ClusterRegistry for StaticClusterRegistry<C> {
    type Cluster = C;

    fn list_clusters(&self) -> Vec<Arc<C>> {
        self.clusters.read().clone()
    }
}

#[derive(Debug, Clone)]
struct LabelledPod {
    labels: BTreeMap<String, String>,
    pod: PodInfo,
}

/// A cluster held entirely in memory.
///
/// Pods carry labels and are matched against equality selectors
/// (`key=value[,key=value]`). Selectors can be made to fail for testing
/// error paths.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    name: String,
    pods: RwLock<Vec<LabelledPod>>,
    stacks: RwLock<Vec<serde_json::Value>>,
    failing_selectors: RwLock<HashSet<String>>,
    slow_selectors: RwLock<HashMap<String, Duration>>,
    unreachable: RwLock<bool>,
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a pod with the given labels.
    pub fn add_pod(&self, pod: PodInfo, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.pods.write().push(LabelledPod { labels, pod });
    }

    /// Removes all pods with the given name.
    pub fn remove_pod(&self, name: &str) {
        self.pods.write().retain(|p| p.pod.name != name);
    }

    /// Adds a raw `InferenceStack` object.
    pub fn add_inference_stack(&self, stack: serde_json::Value) {
        self.stacks.write().push(stack);
    }

    /// Makes listing with `selector` fail.
    pub fn fail_selector(&self, selector: impl Into<String>) {
        self.failing_selectors.write().insert(selector.into());
    }

    /// Makes listing with `selector` take `delay` before answering.
    pub fn delay_selector(&self, selector: impl Into<String>, delay: Duration) {
        self.slow_selectors.write().insert(selector.into(), delay);
    }

    /// Makes every call fail as if the API server were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.write() = unreachable;
    }

    fn check_reachable(&self) -> Result<()> {
        if *self.unreachable.read() {
            return Err(ScraperError::Cluster {
                cluster: self.name.clone(),
                reason: "api server unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl ClusterHandle for InMemoryCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
        _timeout: Duration,
    ) -> Result<Vec<PodInfo>> {
        self.check_reachable()?;
        let delay = self.slow_selectors.read().get(selector).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_selectors.read().contains(selector) {
            return Err(ScraperError::Cluster {
                cluster: self.name.clone(),
                reason: format!("list pods with selector {selector} failed"),
            });
        }

        let pods = self
            .pods
            .read()
            .iter()
            .filter(|p| namespace.is_none_or(|ns| p.pod.namespace == ns))
            .filter(|p| selector_matches(selector, &p.labels))
            .map(|p| p.pod.clone())
            .collect();
        Ok(pods)
    }

    async fn list_inference_stacks(&self, _timeout: Duration) -> Result<Vec<serde_json::Value>> {
        self.check_reachable()?;
        Ok(self.stacks.read().clone())
    }
}

/// Matches an equality-based label selector against a label set.
/// An empty selector matches everything.
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).is_some_and(|v| v == value.trim()),
            None => labels.contains_key(term),
        })
}
