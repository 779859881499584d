//! The scrape orchestrator.
//!
//! Each cycle walks every (cluster, pool) pair: it discovers the pool's pods,
//! pulls GPU telemetry for the nodes they run on, scrapes and decodes each
//! pod, reconciles its counters, writes one row per pod and finally one
//! rollup per pool. Failures are contained to the smallest unit they affect;
//! nothing escapes a cycle except a failed pool listing, and the next tick is
//! the retry.
//!
//! Shutdown is honored at pod granularity: waits (discovery, fetches) are
//! raced against the signal, but once a pod's counters have been reconciled
//! its row is always written, and a pool whose pods were written always gets
//! its rollup.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_inference::{
    CounterDeltas, CounterKey, CounterReconciler, GpuTelemetry, PodIdentity, PodMetricDecoder,
    PodRow, PoolRollup, RollupAccumulator, ScrapedPod, DEFAULT_STALENESS,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHandle, ClusterRegistry, PodInfo};
use crate::config::DEFAULT_GPU_EXPORTER_SELECTOR;
use crate::error::Result;
use crate::fetch::{metrics_url, MetricsFetcher, DEFAULT_BODY_LIMIT};
use crate::gpu::{GpuCorrelator, GpuNodeMap};
use crate::pools::{Pool, PoolDirectory};
use crate::sink::MetricsSink;

/// Source of wall-clock time for timestamps and counter intervals.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    /// Sets the clock.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Tuning for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSettings {
    /// Time between cycles.
    pub interval: Duration,
    /// Counter state not refreshed within this window is dropped.
    pub staleness: Duration,
    /// Per-pod fetch timeout.
    pub pod_timeout: Duration,
    /// Bound on discovering one pool's pods.
    pub discovery_timeout: Duration,
    /// Bound on discovering a cluster's GPU exporters.
    pub gpu_discovery_timeout: Duration,
    /// Serving runtime metrics port.
    pub metrics_port: u16,
    /// GPU exporter port.
    pub gpu_exporter_port: u16,
    /// GPU exporter label selector.
    pub gpu_exporter_selector: String,
    /// Body cap per fetch.
    pub max_body_bytes: usize,
    /// Pods of one pool scraped concurrently.
    pub max_concurrent_pod_scrapes: usize,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            staleness: DEFAULT_STALENESS,
            pod_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(5),
            gpu_discovery_timeout: Duration::from_secs(10),
            metrics_port: 8000,
            gpu_exporter_port: 9400,
            gpu_exporter_selector: DEFAULT_GPU_EXPORTER_SELECTOR.to_string(),
            max_body_bytes: DEFAULT_BODY_LIMIT,
            max_concurrent_pod_scrapes: 8,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Pools listed.
    pub pools: usize,
    /// Clusters visited.
    pub clusters: usize,
    /// Running pods with an address found across all pools.
    pub pods_discovered: usize,
    /// Pods successfully scraped and decoded.
    pub pods_scraped: usize,
    /// Pods whose fetch failed.
    pub pods_failed: usize,
    /// Pods not scraped because shutdown was signalled.
    pub pods_cancelled: usize,
    /// Rows or rollups the sink rejected.
    pub sink_failures: usize,
    /// Rollups produced, whether or not the sink accepted them.
    pub rollups: Vec<PoolRollup>,
    /// Counter entries evicted by the staleness sweep.
    pub evicted: usize,
    /// Shutdown stopped the cycle before every pool was visited.
    pub interrupted: bool,
}

enum PodOutcome {
    Scraped { pod: ScrapedPod, persisted: bool },
    Failed,
    Cancelled,
}

/// Resolves once shutdown is signalled. Never resolves if the sender is
/// dropped without signalling.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn stopping(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

/// Awaits `work` unless shutdown is signalled first, in which case `work` is
/// dropped and `None` returned.
async fn unless_stopping<T>(
    shutdown: Option<&watch::Receiver<bool>>,
    work: impl Future<Output = T>,
) -> Option<T> {
    match shutdown {
        Some(rx) => tokio::select! {
            biased;
            () = shutdown_requested(rx.clone()) => None,
            value = work => Some(value),
        },
        None => Some(work.await),
    }
}

/// Periodically scrapes every pool in every cluster.
#[derive(Debug)]
pub struct MetricsScraper<D, R, F, S> {
    pools: Arc<D>,
    clusters: Arc<R>,
    fetcher: Arc<F>,
    sink: Arc<S>,
    reconciler: CounterReconciler,
    decoder: PodMetricDecoder,
    correlator: GpuCorrelator,
    settings: ScrapeSettings,
    clock: Arc<dyn Clock>,
}

impl<D, R, F, S> MetricsScraper<D, R, F, S>
where
    D: PoolDirectory,
    R: ClusterRegistry,
    F: MetricsFetcher,
    S: MetricsSink,
{
    /// Creates an orchestrator over its collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the staleness window is invalid.
    pub fn new(
        pools: Arc<D>,
        clusters: Arc<R>,
        fetcher: Arc<F>,
        sink: Arc<S>,
        settings: ScrapeSettings,
    ) -> Result<Self> {
        let reconciler = CounterReconciler::with_staleness(settings.staleness)?;
        let correlator = GpuCorrelator::new(
            settings.gpu_exporter_selector.clone(),
            settings.gpu_exporter_port,
            settings.gpu_discovery_timeout,
            settings.max_body_bytes,
        );
        Ok(Self {
            pools,
            clusters,
            fetcher,
            sink,
            reconciler,
            decoder: PodMetricDecoder::default(),
            correlator,
            settings,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the metric decoder.
    #[must_use]
    pub fn with_decoder(mut self, decoder: PodMetricDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Returns the settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ScrapeSettings {
        &self.settings
    }

    /// Returns the counter reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &CounterReconciler {
        &self.reconciler
    }

    /// Scrapes immediately, then on every tick until shutdown is signalled.
    ///
    /// A cycle in progress when shutdown arrives stops at the next pod
    /// boundary.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.settings.interval, "metrics scraper starting");

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.scrape_cycle_until(&shutdown).await {
                        Ok(report) if report.interrupted => {
                            info!(
                                pods = report.pods_scraped,
                                cancelled = report.pods_cancelled,
                                "scrape cycle interrupted by shutdown"
                            );
                            break;
                        }
                        Ok(report) => debug!(
                            pods = report.pods_scraped,
                            failed = report.pods_failed,
                            rollups = report.rollups.len(),
                            evicted = report.evicted,
                            "scrape cycle complete"
                        ),
                        Err(e) => warn!(error = %e, "scrape cycle aborted"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("metrics scraper stopped");
    }

    /// Runs one cycle that winds down early if shutdown is signalled.
    ///
    /// Pending discovery and fetches are abandoned and pods not yet fetched
    /// are skipped, but a pod whose counters were reconciled is always
    /// written, as is the rollup of a pool already in progress. The report
    /// is marked `interrupted` and the staleness sweep is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool directory cannot be read.
    pub async fn scrape_cycle_until(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        self.cycle(Some(shutdown)).await
    }

    /// Runs one full cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool directory cannot be read.
    pub async fn scrape_cycle(&self) -> Result<CycleReport> {
        self.cycle(None).await
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleReport> {
        let pools = self.pools.list_pools().await.inspect_err(|e| {
            warn!(error = %e, "failed to list pools");
        })?;

        let mut report = CycleReport {
            pools: pools.len(),
            ..CycleReport::default()
        };
        if pools.is_empty() {
            debug!("no pools to scrape");
            return Ok(report);
        }

        let clusters = self.clusters.list_clusters();
        report.clusters = clusters.len();
        if clusters.is_empty() {
            debug!("no clusters available");
            return Ok(report);
        }

        for cluster in &clusters {
            if stopping(shutdown) {
                report.interrupted = true;
                return Ok(report);
            }
            let Some(gpu_map) =
                unless_stopping(shutdown, self.correlator.discover(cluster.as_ref())).await
            else {
                report.interrupted = true;
                return Ok(report);
            };
            for pool in &pools {
                if stopping(shutdown) {
                    report.interrupted = true;
                    return Ok(report);
                }
                self.scrape_pool(cluster.as_ref(), pool, &gpu_map, shutdown, &mut report)
                    .await;
            }
        }

        report.evicted = self.reconciler.evict_stale_at(self.clock.now());
        Ok(report)
    }

    async fn scrape_pool<C: ClusterHandle>(
        &self,
        cluster: &C,
        pool: &Pool,
        gpu_map: &GpuNodeMap,
        shutdown: Option<&watch::Receiver<bool>>,
        report: &mut CycleReport,
    ) {
        let Some(pods) = unless_stopping(shutdown, self.discover_pods(cluster, pool)).await else {
            return;
        };
        let pods: Vec<PodInfo> = pods.into_iter().filter(PodInfo::is_scrapable).collect();
        if pods.is_empty() {
            return;
        }
        report.pods_discovered += pods.len();

        let telemetry = unless_stopping(
            shutdown,
            self.correlator.fetch_for_nodes(
                self.fetcher.as_ref(),
                gpu_map,
                pods.iter().map(|pod| pod.node_name.as_str()),
            ),
        )
        .await
        .unwrap_or_default();

        let timestamp = self.clock.now();
        let outcomes: Vec<PodOutcome> = stream::iter(&pods)
            .map(|pod| self.scrape_pod(cluster.name(), pool, pod, &telemetry, timestamp, shutdown))
            .buffer_unordered(self.settings.max_concurrent_pod_scrapes.max(1))
            .collect()
            .await;

        let mut rollup = RollupAccumulator::new();
        for outcome in &outcomes {
            match outcome {
                PodOutcome::Scraped { pod, persisted } => {
                    rollup.add(pod);
                    report.pods_scraped += 1;
                    if !persisted {
                        report.sink_failures += 1;
                    }
                }
                PodOutcome::Failed => report.pods_failed += 1,
                PodOutcome::Cancelled => report.pods_cancelled += 1,
            }
        }

        let Some(rollup) = rollup.finish(timestamp, cluster.name(), &pool.name) else {
            return;
        };
        match self.sink.insert_pool_rollup(&rollup).await {
            Ok(()) => debug!(
                cluster = %cluster.name(),
                pool = %pool.name,
                pods = rollup.pod_count,
                "wrote pool metrics"
            ),
            Err(e) => {
                warn!(cluster = %cluster.name(), pool = %pool.name, error = %e, "failed to insert pool rollup");
                report.sink_failures += 1;
            }
        }
        report.rollups.push(rollup);
    }

    /// Tries each selector in order and returns the first non-empty match.
    async fn discover_pods<C: ClusterHandle>(&self, cluster: &C, pool: &Pool) -> Vec<PodInfo> {
        let namespace = pool.effective_namespace();
        let timeout = self.settings.discovery_timeout;

        let discovery = async {
            for selector in pool.pod_selectors() {
                match cluster.list_pods(Some(namespace), &selector, timeout).await {
                    Ok(pods) if !pods.is_empty() => return pods,
                    Ok(_) => {}
                    Err(e) => debug!(
                        cluster = %cluster.name(),
                        pool = %pool.name,
                        selector = %selector,
                        error = %e,
                        "pod listing failed"
                    ),
                }
            }
            Vec::new()
        };

        tokio::time::timeout(timeout, discovery)
            .await
            .unwrap_or_else(|_| {
                warn!(cluster = %cluster.name(), pool = %pool.name, "pod discovery timed out");
                Vec::new()
            })
    }

    async fn scrape_pod(
        &self,
        cluster_name: &str,
        pool: &Pool,
        pod: &PodInfo,
        telemetry: &HashMap<String, GpuTelemetry>,
        timestamp: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> PodOutcome {
        if stopping(shutdown) {
            return PodOutcome::Cancelled;
        }

        let url = metrics_url(&pod.ip, self.settings.metrics_port);
        let fetch = tokio::time::timeout(
            self.settings.pod_timeout,
            self.fetcher.fetch(&url, self.settings.max_body_bytes),
        );
        // Nothing below the fetch may be abandoned.
        let Some(fetched) = unless_stopping(shutdown, fetch).await else {
            debug!(pod = %pod.name, "metrics fetch cancelled by shutdown");
            return PodOutcome::Cancelled;
        };
        let body = match fetched {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                debug!(pod = %pod.name, ip = %pod.ip, error = %e, "failed to fetch metrics");
                return PodOutcome::Failed;
            }
            Err(_) => {
                debug!(pod = %pod.name, ip = %pod.ip, "metrics fetch timed out");
                return PodOutcome::Failed;
            }
        };

        let identity = PodIdentity::new(
            cluster_name,
            pool.effective_namespace(),
            &pod.name,
            &pod.node_name,
        );
        let mut sample = self.decoder.decode(&body, identity);
        if let Some(gpu) = telemetry.get(&pod.node_name) {
            gpu.apply_to(&mut sample);
        }

        let deltas = match CounterKey::for_pod(&sample.identity) {
            Ok(key) => self
                .reconciler
                .observe_at(&key, sample.counters, self.clock.now()),
            Err(e) => {
                debug!(pod = %pod.name, error = %e, "skipping counter reconciliation");
                CounterDeltas::default()
            }
        };

        let scraped = ScrapedPod::new(sample, deltas);
        let row = PodRow::new(timestamp, &pool.name, &pool.gpu_type, &scraped);
        let persisted = match self.sink.insert_pod_row(&row).await {
            Ok(()) => true,
            Err(e) => {
                warn!(pod = %pod.name, error = %e, "failed to insert pod metrics");
                false
            }
        };

        PodOutcome::Scraped {
            pod: scraped,
            persisted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, StaticClusterRegistry};
    use crate::fetch::StaticFetcher;
    use crate::pools::InMemoryPoolDirectory;
    use crate::sink::MemorySink;
    use chrono::TimeZone;

    type TestScraper =
        MetricsScraper<InMemoryPoolDirectory, StaticClusterRegistry<InMemoryCluster>, StaticFetcher, MemorySink>;

    struct Harness {
        pools: Arc<InMemoryPoolDirectory>,
        registry: Arc<StaticClusterRegistry<InMemoryCluster>>,
        fetcher: Arc<StaticFetcher>,
        sink: Arc<MemorySink>,
        clock: Arc<ManualClock>,
        scraper: TestScraper,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).single().expect("valid time")
    }

    fn harness(cluster: InMemoryCluster, pools: Vec<Pool>) -> Harness {
        let pools = Arc::new(InMemoryPoolDirectory::with_pools(pools));
        let registry = Arc::new(StaticClusterRegistry::new([cluster]));
        let fetcher = Arc::new(StaticFetcher::new());
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scraper = MetricsScraper::new(
            Arc::clone(&pools),
            Arc::clone(&registry),
            Arc::clone(&fetcher),
            Arc::clone(&sink),
            ScrapeSettings::default(),
        )
        .expect("scraper")
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        Harness {
            pools,
            registry,
            fetcher,
            sink,
            clock,
            scraper,
        }
    }

    fn pool(name: &str) -> Pool {
        Pool {
            gpu_type: "A100".to_string(),
            ..Pool::new(name, "serving")
        }
    }

    fn tokens(total: u64) -> String {
        format!("vllm:generation_tokens_total {total}\nvllm:num_requests_waiting 2\n")
    }

    #[tokio::test]
    async fn no_pools_ends_cycle() {
        let h = harness(InMemoryCluster::new("prod"), Vec::new());
        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report, CycleReport::default());
        assert_eq!(h.fetcher.total_requests(), 0);
    }

    #[tokio::test]
    async fn no_clusters_ends_cycle() {
        let h = harness(InMemoryCluster::new("prod"), vec![pool("llama")]);
        assert!(h.registry.deregister("prod"));
        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pools, 1);
        assert_eq!(report.clusters, 0);
        assert!(h.sink.pod_rows().is_empty());
    }

    #[tokio::test]
    async fn selectors_tried_in_order() {
        let cluster = InMemoryCluster::new("prod");
        cluster.fail_selector("app=llama");
        cluster.add_pod(
            PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"),
            &[("app.kubernetes.io/name", "llama")],
        );
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pods_scraped, 1);
        assert_eq!(h.sink.pod_rows().len(), 1);
        assert_eq!(h.sink.pod_rows()[0].pod_name, "llama-0");
    }

    #[tokio::test]
    async fn only_running_pods_with_ip_are_scraped() {
        let cluster = InMemoryCluster::new("prod");
        let mut pending = PodInfo::running("llama-1", "serving", "10.0.0.2", "node-a");
        pending.phase = "Pending".to_string();
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(pending, &[("app", "llama")]);
        cluster.add_pod(PodInfo::running("llama-2", "serving", "", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_body("http://10.0.0.2:8000/metrics", tokens(100));

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pods_discovered, 1);
        assert_eq!(h.fetcher.requests("http://10.0.0.2:8000/metrics"), 0);
    }

    #[tokio::test]
    async fn failed_pod_is_skipped_and_no_rollup_without_samples() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_status("http://10.0.0.1:8000/metrics", 503);

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pods_failed, 1);
        assert!(report.rollups.is_empty());
        assert!(h.sink.rollups().is_empty());
        assert!(h.scraper.reconciler().is_empty());
    }

    #[tokio::test]
    async fn default_namespace_used_for_empty() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "default", "10.0.0.1", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![Pool::new("llama", "")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));

        h.scraper.scrape_cycle().await.expect("cycle");
        let key = CounterKey::new("prod", "default", "llama-0").expect("key");
        assert!(h.scraper.reconciler().contains(&key));
    }

    #[tokio::test]
    async fn gpu_telemetry_enriches_rows() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(PodInfo::running("llama-1", "serving", "10.0.0.2", "node-a"), &[("app", "llama")]);
        cluster.add_pod(
            PodInfo::running("dcgm-a", "gpu-operator", "10.9.0.1", "node-a"),
            &[("app.kubernetes.io/name", "dcgm-exporter")],
        );
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_body("http://10.0.0.2:8000/metrics", tokens(100));
        h.fetcher.set_body(
            "http://10.9.0.1:9400/metrics",
            "DCGM_FI_DEV_GPU_UTIL 91\nDCGM_FI_DEV_FB_USED 1000\nDCGM_FI_DEV_FB_FREE 500\nDCGM_FI_DEV_GPU_TEMP 70\n",
        );

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(h.fetcher.requests("http://10.9.0.1:9400/metrics"), 1);

        let rows = h.sink.pod_rows();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!((row.gpu_util_pct - 91.0).abs() < f64::EPSILON);
            assert_eq!(row.gpu_mem_used_mb, 1000);
            assert_eq!(row.gpu_mem_total_mb, 1500);
            assert_eq!(row.gpu_temperature_c, 70);
            assert_eq!(row.gpu_type, "A100");
        }
        assert!((report.rollups[0].gpu_util_pct - 91.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_cycle() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.sink.set_failing(true);

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pods_scraped, 1);
        assert_eq!(report.sink_failures, 2);
        assert_eq!(report.rollups.len(), 1);
    }

    #[tokio::test]
    async fn stale_state_is_swept() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(h.scraper.reconciler().len(), 1);

        for cluster in h.registry.list_clusters() {
            cluster.remove_pod("llama-0");
        }
        h.clock.advance(chrono::Duration::minutes(11));
        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.evicted, 1);
        assert!(h.scraper.reconciler().is_empty());
    }

    #[tokio::test]
    async fn pools_added_later_are_picked_up() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("mistral-0", "serving", "10.0.0.5", "node-a"), &[("app", "mistral")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.5:8000/metrics", tokens(100));

        assert_eq!(h.scraper.scrape_cycle().await.expect("cycle").pods_scraped, 0);
        h.pools.insert(pool("mistral"));
        assert_eq!(h.scraper.scrape_cycle().await.expect("cycle").pods_scraped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pod_times_out_alone() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(PodInfo::running("llama-1", "serving", "10.0.0.2", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_body("http://10.0.0.2:8000/metrics", tokens(100));
        h.fetcher.delay_url("http://10.0.0.2:8000/metrics", Duration::from_secs(30));

        let started = tokio::time::Instant::now();
        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert!(started.elapsed() < Duration::from_secs(6));

        assert_eq!(report.pods_discovered, 2);
        assert_eq!(report.pods_scraped, 1);
        assert_eq!(report.pods_failed, 1);
        assert_eq!(report.rollups.len(), 1);
        assert_eq!(report.rollups[0].pod_count, 1);
        let rows = h.sink.pod_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pod_name, "llama-0");
        let slow = CounterKey::new("prod", "serving", "llama-1").expect("key");
        assert!(!h.scraper.reconciler().contains(&slow));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_discovery_timeout_skips_only_that_pool() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(PodInfo::running("mistral-0", "serving", "10.0.0.5", "node-a"), &[("app", "mistral")]);
        cluster.delay_selector("app=llama", Duration::from_secs(30));
        let h = harness(cluster, vec![pool("llama"), pool("mistral")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_body("http://10.0.0.5:8000/metrics", tokens(100));

        let started = tokio::time::Instant::now();
        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert!(started.elapsed() < Duration::from_secs(6));

        assert_eq!(report.pods_discovered, 1);
        assert_eq!(h.fetcher.requests("http://10.0.0.1:8000/metrics"), 0);
        assert_eq!(report.rollups.len(), 1);
        assert_eq!(report.rollups[0].pool_name, "mistral");
    }

    #[tokio::test(start_paused = true)]
    async fn gpu_discovery_timeout_still_scrapes_pods() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(
            PodInfo::running("dcgm-a", "gpu-operator", "10.9.0.1", "node-a"),
            &[("app.kubernetes.io/name", "dcgm-exporter")],
        );
        cluster.delay_selector(DEFAULT_GPU_EXPORTER_SELECTOR, Duration::from_secs(60));
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_body("http://10.9.0.1:9400/metrics", "DCGM_FI_DEV_GPU_UTIL 91\n");

        let report = h.scraper.scrape_cycle().await.expect("cycle");
        assert_eq!(report.pods_scraped, 1);
        assert_eq!(h.fetcher.requests("http://10.9.0.1:9400/metrics"), 0);
        assert!(h.sink.pod_rows()[0].gpu_util_pct.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_fetch() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        let h = harness(cluster, vec![pool("llama")]);
        h.fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        h.fetcher.set_delay(Some(Duration::from_secs(60)));

        let (tx, rx) = watch::channel(false);
        let cycle = h.scraper.scrape_cycle_until(&rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        };
        let (result, ()) = tokio::join!(cycle, stop);
        let report = result.expect("cycle");

        assert!(report.interrupted);
        assert_eq!(report.pods_cancelled, 1);
        assert_eq!(report.pods_failed, 0);
        assert!(report.rollups.is_empty());
        assert!(h.sink.pod_rows().is_empty());
        assert!(h.scraper.reconciler().is_empty());
    }

    /// Sink whose pod inserts take a while.
    #[derive(Debug, Default)]
    struct SlowSink {
        inner: MemorySink,
        delay: Duration,
    }

    impl MetricsSink for SlowSink {
        async fn insert_pod_row(&self, row: &PodRow) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert_pod_row(row).await
        }

        async fn insert_pool_rollup(&self, rollup: &PoolRollup) -> Result<()> {
            self.inner.insert_pool_rollup(rollup).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_reconciled_pod_finish() {
        let cluster = InMemoryCluster::new("prod");
        cluster.add_pod(PodInfo::running("llama-0", "serving", "10.0.0.1", "node-a"), &[("app", "llama")]);
        cluster.add_pod(PodInfo::running("mistral-0", "serving", "10.0.0.5", "node-a"), &[("app", "mistral")]);
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.set_body("http://10.0.0.1:8000/metrics", tokens(100));
        fetcher.set_body("http://10.0.0.5:8000/metrics", tokens(100));
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(200),
            ..SlowSink::default()
        });
        let scraper = MetricsScraper::new(
            Arc::new(InMemoryPoolDirectory::with_pools([pool("llama"), pool("mistral")])),
            Arc::new(StaticClusterRegistry::new([cluster])),
            Arc::clone(&fetcher),
            Arc::clone(&sink),
            ScrapeSettings::default(),
        )
        .expect("scraper")
        .with_clock(Arc::new(ManualClock::new(t0())));

        let (tx, rx) = watch::channel(false);
        let cycle = scraper.scrape_cycle_until(&rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        };
        let (result, ()) = tokio::join!(cycle, stop);
        let report = result.expect("cycle");

        assert!(report.interrupted);
        assert_eq!(report.pods_scraped, 1);
        let key = CounterKey::new("prod", "serving", "llama-0").expect("key");
        assert!(scraper.reconciler().contains(&key));
        let rows = sink.inner.pod_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pod_name, "llama-0");
        assert_eq!(sink.inner.rollups().len(), 1);
        assert_eq!(fetcher.requests("http://10.0.0.5:8000/metrics"), 0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let h = harness(InMemoryCluster::new("prod"), vec![pool("llama")]);
        let (tx, rx) = watch::channel(false);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(h.scraper.run(rx), stop);
        })
        .await
        .expect("run loop should stop");
    }

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(t0());
        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(clock.now(), t0() + chrono::Duration::seconds(10));
        clock.set(t0());
        assert_eq!(clock.now(), t0());
    }
}
