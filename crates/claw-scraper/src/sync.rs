//! Pool sync: keeps the pool directory in step with the `InferenceStack`
//! resources declared in each cluster.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHandle, ClusterRegistry};
use crate::pools::{Pool, PoolStore, DEFAULT_PHASE};

/// Pool sync tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Time between syncs.
    pub interval: Duration,
    /// Per-cluster list timeout.
    pub timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Clusters visited.
    pub clusters: usize,
    /// Pools written to the store.
    pub upserted: usize,
    /// Clusters that could not be listed plus pools the store rejected.
    pub failures: usize,
}

/// Decodes a pool from a raw `InferenceStack` object.
///
/// Returns `None` when the object has no name. Missing fields fall back to
/// empty or zero; a missing phase reads as `Pending`.
#[must_use]
pub fn pool_from_inference_stack(object: &Value) -> Option<Pool> {
    let name = str_at(object, &["metadata", "name"]);
    if name.is_empty() {
        return None;
    }

    let spec = &object["spec"];
    let pool = &spec["pool"];
    let phase = str_at(object, &["status", "phase"]);

    Some(Pool {
        name,
        namespace: str_at(object, &["metadata", "namespace"]),
        gpu_type: str_at(pool, &["gpuType"]),
        gpu_count: u32_at(pool, "gpuCount"),
        replicas: u32_at(pool, "replicas"),
        model_name: str_at(spec, &["modelName"]),
        model_version: str_at(spec, &["modelVersion"]),
        serving_backend: str_at(spec, &["servingBackend"]),
        min_replicas: u32_at(pool, "minReplicas"),
        max_replicas: u32_at(pool, "maxReplicas"),
        phase: if phase.is_empty() {
            DEFAULT_PHASE.to_string()
        } else {
            phase
        },
    })
}

fn str_at(object: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(object, |value, key| value.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u32_at(object: &Value, key: &str) -> u32 {
    object
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

/// Periodically lists `InferenceStack` resources in every cluster and
/// upserts them into a pool store.
#[derive(Debug)]
pub struct PoolSync<R, P> {
    clusters: Arc<R>,
    store: Arc<P>,
    settings: SyncSettings,
}

impl<R, P> PoolSync<R, P>
where
    R: ClusterRegistry,
    P: PoolStore,
{
    /// Creates a sync loop.
    #[must_use]
    pub const fn new(clusters: Arc<R>, store: Arc<P>, settings: SyncSettings) -> Self {
        Self {
            clusters,
            store,
            settings,
        }
    }

    /// Syncs immediately, then on every tick until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.settings.interval, "inference pool sync loop starting");

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sync_all().await;
                    debug!(
                        clusters = report.clusters,
                        upserted = report.upserted,
                        failures = report.failures,
                        "pool sync complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("inference pool sync loop stopped");
    }

    /// Syncs every cluster concurrently.
    pub async fn sync_all(&self) -> SyncReport {
        let clusters = self.clusters.list_clusters();
        if clusters.is_empty() {
            return SyncReport::default();
        }

        let results = join_all(clusters.iter().map(|cluster| self.sync_cluster(cluster.as_ref()))).await;

        results.into_iter().fold(
            SyncReport {
                clusters: clusters.len(),
                ..SyncReport::default()
            },
            |mut report, (upserted, failures)| {
                report.upserted += upserted;
                report.failures += failures;
                report
            },
        )
    }

    /// Syncs one cluster. Returns (pools upserted, failures).
    async fn sync_cluster<C: ClusterHandle>(&self, cluster: &C) -> (usize, usize) {
        let timeout = self.settings.timeout;
        let listing = tokio::time::timeout(timeout, cluster.list_inference_stacks(timeout)).await;
        let stacks = match listing {
            Ok(Ok(stacks)) => stacks,
            Ok(Err(e)) => {
                warn!(cluster = %cluster.name(), error = %e, "failed to list InferenceStacks");
                return (0, 1);
            }
            Err(_) => {
                warn!(cluster = %cluster.name(), "listing InferenceStacks timed out");
                return (0, 1);
            }
        };

        let mut upserted = 0;
        let mut failures = 0;
        for pool in stacks.iter().filter_map(pool_from_inference_stack) {
            let name = pool.name.clone();
            match self.store.upsert_pool(pool).await {
                Ok(()) => upserted += 1,
                Err(e) => {
                    warn!(cluster = %cluster.name(), pool = %name, error = %e, "failed to upsert pool");
                    failures += 1;
                }
            }
        }

        debug!(cluster = %cluster.name(), pools = stacks.len(), "sync completed");
        (upserted, failures)
    }
}
