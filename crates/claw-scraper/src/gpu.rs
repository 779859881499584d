//! GPU telemetry correlation.
//!
//! Serving pods do not report GPU utilization themselves. Each GPU node runs
//! a telemetry exporter pod; the correlator maps node names to exporter
//! addresses once per cluster pass and pulls one exporter payload per node
//! that hosts a scraped pod.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use claw_inference::GpuTelemetry;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cluster::{ClusterHandle, PodInfo};
use crate::fetch::{metrics_url, MetricsFetcher};

/// Node name to GPU exporter address, rebuilt wholesale per cluster pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuNodeMap {
    exporters: HashMap<String, String>,
}

impl GpuNodeMap {
    /// Builds the map from exporter pods. Pods that are not running, have no
    /// IP or are not bound to a node are ignored.
    #[must_use]
    pub fn from_pods(pods: &[PodInfo]) -> Self {
        let exporters = pods
            .iter()
            .filter(|pod| pod.is_scrapable() && !pod.node_name.is_empty())
            .map(|pod| (pod.node_name.clone(), pod.ip.clone()))
            .collect();
        Self { exporters }
    }

    /// Returns the exporter address on `node`, if one is known.
    #[must_use]
    pub fn exporter_for(&self, node: &str) -> Option<&str> {
        self.exporters.get(node).map(String::as_str)
    }

    /// Returns the number of nodes with an exporter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    /// Returns true if no exporter was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

/// Discovers GPU exporters and fetches their telemetry.
#[derive(Debug, Clone)]
pub struct GpuCorrelator {
    selector: String,
    port: u16,
    discovery_timeout: Duration,
    body_limit: usize,
}

impl GpuCorrelator {
    /// Creates a correlator.
    #[must_use]
    pub fn new(
        selector: impl Into<String>,
        port: u16,
        discovery_timeout: Duration,
        body_limit: usize,
    ) -> Self {
        Self {
            selector: selector.into(),
            port,
            discovery_timeout,
            body_limit,
        }
    }

    /// Lists exporter pods across all namespaces of a cluster.
    ///
    /// A failed listing yields an empty map; GPU fields then stay unset.
    pub async fn discover<C: ClusterHandle>(&self, cluster: &C) -> GpuNodeMap {
        let listing = tokio::time::timeout(
            self.discovery_timeout,
            cluster.list_pods(None, &self.selector, self.discovery_timeout),
        )
        .await;

        match listing {
            Ok(Ok(pods)) => {
                let map = GpuNodeMap::from_pods(&pods);
                debug!(cluster = %cluster.name(), exporters = map.len(), "GPU exporters discovered");
                map
            }
            Ok(Err(e)) => {
                warn!(cluster = %cluster.name(), error = %e, "GPU exporter discovery failed");
                GpuNodeMap::default()
            }
            Err(_) => {
                warn!(cluster = %cluster.name(), "GPU exporter discovery timed out");
                GpuNodeMap::default()
            }
        }
    }

    /// Fetches telemetry for each distinct node, at most once per node.
    ///
    /// Nodes without an exporter, or whose exporter cannot be read, are
    /// absent from the result.
    pub async fn fetch_for_nodes<'a, F: MetricsFetcher>(
        &self,
        fetcher: &F,
        map: &GpuNodeMap,
        nodes: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, GpuTelemetry> {
        let targets: BTreeSet<(&str, &str)> = nodes
            .into_iter()
            .filter_map(|node| map.exporter_for(node).map(|ip| (node, ip)))
            .collect();

        let fetches = targets.into_iter().map(|(node, ip)| async move {
            let url = metrics_url(ip, self.port);
            match fetcher.fetch(&url, self.body_limit).await {
                Ok(body) => Some((node.to_string(), GpuTelemetry::decode(&body))),
                Err(e) => {
                    debug!(node, url = %url, error = %e, "GPU exporter fetch failed");
                    None
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }
}
