//! Kubernetes API access through `kube`.
//!
//! Connection settings come from a kubeconfig file or context when one is
//! configured, otherwise from `Config::infer`, which reads `$KUBECONFIG` or
//! falls back to the in-cluster service account and its CA bundle.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cluster::{ClusterHandle, PodInfo};
use crate::config::ClusterConfig;
use crate::error::{Result, ScraperError};

/// Group, version and names of the `InferenceStack` custom resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceStackResource {
    /// API group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Resource kind.
    pub kind: String,
    /// Plural resource name used in API paths.
    pub plural: String,
}

impl Default for InferenceStackResource {
    fn default() -> Self {
        Self {
            group: "ngf-console.f5.com".to_string(),
            version: "v1alpha1".to_string(),
            kind: "InferenceStack".to_string(),
            plural: "inferencestacks".to_string(),
        }
    }
}

impl InferenceStackResource {
    /// Resolves to the dynamic API resource used for listing.
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Extracts the fields the scraper needs from a pod object.
#[must_use]
pub fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
    }
}

/// Flattens a dynamic object into plain JSON (`metadata`, `spec`, `status`
/// at the top level).
fn object_value(object: &DynamicObject) -> serde_json::Result<Value> {
    serde_json::to_value(object)
}

async fn load_config(config: &ClusterConfig) -> std::result::Result<Config, String> {
    let options = KubeConfigOptions {
        context: config.context.clone(),
        ..KubeConfigOptions::default()
    };
    match (&config.kubeconfig, &config.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| format!("read kubeconfig {}: {e}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| format!("load kubeconfig {}: {e}", path.display()))
        }
        (None, Some(context)) => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| format!("load context {context}: {e}")),
        (None, None) => Config::infer()
            .await
            .map_err(|e| format!("infer cluster config: {e}")),
    }
}

/// A cluster reached through its API server.
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
    inference_stacks: ApiResource,
}

impl fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeCluster")
            .field("name", &self.name)
            .field("inference_stacks", &self.inference_stacks.plural)
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Connects to the cluster described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ScraperError::Cluster`] if the kubeconfig or in-cluster
    /// environment cannot be loaded, or the client cannot be built.
    pub async fn connect(config: &ClusterConfig, stacks: &InferenceStackResource) -> Result<Self> {
        let cluster_error = |reason: String| ScraperError::Cluster {
            cluster: config.name.clone(),
            reason,
        };
        let kube_config = load_config(config).await.map_err(cluster_error)?;
        let client = Client::try_from(kube_config)
            .map_err(|e| cluster_error(format!("build client: {e}")))?;
        debug!(cluster = %config.name, source = %config.source(), "connected cluster client");
        Ok(Self::with_client(config.name.clone(), client, stacks))
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(name: impl Into<String>, client: Client, stacks: &InferenceStackResource) -> Self {
        Self {
            name: name.into(),
            client,
            inference_stacks: stacks.api_resource(),
        }
    }

    fn cluster_error(&self, reason: impl Into<String>) -> ScraperError {
        ScraperError::Cluster {
            cluster: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl ClusterHandle for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
        timeout: Duration,
    ) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(selector);
        let list = tokio::time::timeout(timeout, api.list(&params))
            .await
            .map_err(|_| self.cluster_error("pod list timed out"))?
            .map_err(|e| self.cluster_error(format!("list pods: {e}")))?;

        let pods: Vec<PodInfo> = list.items.iter().map(pod_info).collect();
        debug!(cluster = %self.name, selector, pods = pods.len(), "listed pods");
        Ok(pods)
    }

    async fn list_inference_stacks(&self, timeout: Duration) -> Result<Vec<Value>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.inference_stacks);
        let list = tokio::time::timeout(timeout, api.list(&ListParams::default()))
            .await
            .map_err(|_| self.cluster_error("inference stack list timed out"))?
            .map_err(|e| self.cluster_error(format!("list {}: {e}", self.inference_stacks.plural)))?;

        list.items
            .iter()
            .map(object_value)
            .collect::<serde_json::Result<Vec<_>>>()
            .map_err(|e| self.cluster_error(format!("decode inference stacks: {e}")))
    }
}
