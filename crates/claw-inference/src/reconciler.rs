//! Reconciliation of cumulative counters into per-interval deltas.
//!
//! Serving runtimes export monotonic counters that reset to zero whenever the
//! process restarts. The [`CounterReconciler`] remembers the previous reading
//! of every pod and turns each new reading into a token delta, a throughput
//! rate and an average first-token latency for the interval. A reset or a
//! first observation always yields zero deltas rather than a negative or
//! inflated figure.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::decoder::{CounterSnapshot, PodIdentity};
use crate::error::{InferenceError, Result};

/// Default staleness window after which an unseen pod's state is dropped.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10 * 60);

/// Key identifying one pod's counter stream: `cluster/namespace/pod`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey(String);

impl CounterKey {
    /// Builds a key from its three components.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::InvalidCounterKey`] if any component is
    /// empty or contains `/`.
    pub fn new(cluster: &str, namespace: &str, pod: &str) -> Result<Self> {
        for (part, value) in [("cluster", cluster), ("namespace", namespace), ("pod", pod)] {
            if value.is_empty() {
                return Err(InferenceError::InvalidCounterKey {
                    reason: format!("{part} name is empty"),
                });
            }
            if value.contains('/') {
                return Err(InferenceError::InvalidCounterKey {
                    reason: format!("{part} name '{value}' contains '/'"),
                });
            }
        }
        Ok(Self(format!("{cluster}/{namespace}/{pod}")))
    }

    /// Builds the key for a pod identity.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::InvalidCounterKey`] if the identity has an
    /// empty or malformed component.
    pub fn for_pod(identity: &PodIdentity) -> Result<Self> {
        Self::new(&identity.cluster, &identity.namespace, &identity.pod)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What changed for one pod since its previous observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterDeltas {
    /// Tokens generated during the interval.
    pub tokens: u64,
    /// Tokens per second over the interval.
    pub tokens_per_sec: f64,
    /// Mean first-token latency of requests completed in the interval, ms.
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    prev: CounterSnapshot,
    last_seen: DateTime<Utc>,
}

/// Per-pod counter memory shared by every scrape of a cycle.
///
/// All reads and writes go through a single mutex, so observations of
/// different pods may run concurrently.
#[derive(Debug)]
pub struct CounterReconciler {
    state: Mutex<HashMap<CounterKey, CounterState>>,
    staleness: chrono::Duration,
    staleness_std: Duration,
}

impl Default for CounterReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterReconciler {
    /// Creates a reconciler with the default ten minute staleness window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            staleness: chrono::Duration::minutes(10),
            staleness_std: DEFAULT_STALENESS,
        }
    }

    /// Creates a reconciler with a custom staleness window.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::InvalidWindow`] if the window is zero or
    /// does not fit a timestamp offset.
    pub fn with_staleness(window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(InferenceError::InvalidWindow {
                reason: "window must be non-zero".to_string(),
            });
        }
        let staleness =
            chrono::Duration::from_std(window).map_err(|e| InferenceError::InvalidWindow {
                reason: e.to_string(),
            })?;
        Ok(Self {
            state: Mutex::new(HashMap::new()),
            staleness,
            staleness_std: window,
        })
    }

    /// Returns the staleness window.
    #[must_use]
    pub const fn staleness(&self) -> Duration {
        self.staleness_std
    }

    /// Records a reading taken now and returns the deltas since the last one.
    pub fn observe(&self, key: &CounterKey, current: CounterSnapshot) -> CounterDeltas {
        self.observe_at(key, current, Utc::now())
    }

    /// Records a reading taken at `now` and returns the deltas since the
    /// last one. The stored reading is replaced unconditionally.
    pub fn observe_at(
        &self,
        key: &CounterKey,
        current: CounterSnapshot,
        now: DateTime<Utc>,
    ) -> CounterDeltas {
        let previous = self.state.lock().insert(
            key.clone(),
            CounterState {
                prev: current,
                last_seen: now,
            },
        );

        let Some(previous) = previous else {
            trace!(key = %key, "first observation");
            return CounterDeltas::default();
        };

        let elapsed = (now - previous.last_seen)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let deltas = compute_deltas(&previous.prev, &current, elapsed);

        if deltas.tokens == 0 && current.tokens_total < previous.prev.tokens_total {
            debug!(
                key = %key,
                previous = previous.prev.tokens_total,
                current = current.tokens_total,
                "counter reset detected"
            );
        }
        deltas
    }

    /// Drops state for pods not observed within the staleness window.
    ///
    /// Returns the number of entries removed.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(Utc::now())
    }

    /// Drops state whose last observation is strictly older than
    /// `now - staleness`.
    pub fn evict_stale_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.staleness;
        let mut state = self.state.lock();
        let before = state.len();
        state.retain(|_, entry| entry.last_seen >= cutoff);
        let evicted = before - state.len();
        drop(state);

        if evicted > 0 {
            debug!(evicted, "evicted stale counter state");
        }
        evicted
    }

    /// Returns true if state exists for the key.
    #[must_use]
    pub fn contains(&self, key: &CounterKey) -> bool {
        self.state.lock().contains_key(key)
    }

    /// Returns the number of tracked pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Returns true if no pod is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}

fn compute_deltas(prev: &CounterSnapshot, cur: &CounterSnapshot, elapsed_secs: f64) -> CounterDeltas {
    let tokens = if prev.tokens_total > 0.0 && cur.tokens_total >= prev.tokens_total {
        (cur.tokens_total - prev.tokens_total) as u64
    } else {
        0
    };

    let tokens_per_sec = if tokens > 0 && elapsed_secs > 0.0 {
        tokens as f64 / elapsed_secs
    } else {
        0.0
    };

    let sum_delta = cur.latency_sum_seconds - prev.latency_sum_seconds;
    let count_delta = cur.latency_count - prev.latency_count;
    let avg_latency_ms = if prev.latency_count > 0.0 && count_delta > 0.0 && sum_delta > 0.0 {
        sum_delta / count_delta * 1000.0
    } else {
        0.0
    };

    CounterDeltas {
        tokens,
        tokens_per_sec,
        avg_latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(pod: &str) -> CounterKey {
        CounterKey::new("prod", "inference", pod).expect("valid key")
    }

    fn snapshot(tokens: f64, sum: f64, count: f64) -> CounterSnapshot {
        CounterSnapshot {
            tokens_total: tokens,
            latency_sum_seconds: sum,
            latency_count: count,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn counter_key_format() {
        let k = key("llama-0");
        assert_eq!(k.as_str(), "prod/inference/llama-0");
        assert_eq!(k.to_string(), "prod/inference/llama-0");

        let identity = PodIdentity::new("prod", "inference", "llama-0", "node-a");
        assert_eq!(CounterKey::for_pod(&identity).expect("valid"), k);
    }

    #[test]
    fn counter_key_rejects_bad_components() {
        assert!(matches!(
            CounterKey::new("", "ns", "pod"),
            Err(InferenceError::InvalidCounterKey { .. })
        ));
        assert!(CounterKey::new("c", "", "pod").is_err());
        assert!(CounterKey::new("c", "ns", "").is_err());
        assert!(CounterKey::new("c", "a/b", "pod").is_err());
    }

    #[test]
    fn first_observation_is_zero() {
        let reconciler = CounterReconciler::new();
        let deltas = reconciler.observe_at(&key("p"), snapshot(1000.0, 5.0, 100.0), t0());
        assert_eq!(deltas, CounterDeltas::default());
        assert!(reconciler.contains(&key("p")));
        assert_eq!(reconciler.len(), 1);
    }

    #[test]
    fn rate_over_interval() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(1000.0, 0.0, 0.0), t0());
        let deltas = reconciler.observe_at(
            &k,
            snapshot(1500.0, 0.0, 0.0),
            t0() + chrono::Duration::seconds(5),
        );

        assert_eq!(deltas.tokens, 500);
        assert!((deltas.tokens_per_sec - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_first_token_latency() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(0.0, 10.0, 100.0), t0());
        let deltas = reconciler.observe_at(
            &k,
            snapshot(0.0, 15.0, 200.0),
            t0() + chrono::Duration::seconds(15),
        );
        assert!((deltas.avg_latency_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn latency_requires_previous_count() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(0.0, 0.0, 0.0), t0());
        let deltas = reconciler.observe_at(
            &k,
            snapshot(0.0, 3.0, 10.0),
            t0() + chrono::Duration::seconds(15),
        );
        assert!(deltas.avg_latency_ms.abs() < f64::EPSILON);
    }

    #[test]
    fn reset_yields_zero_then_recovers() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        let step = chrono::Duration::seconds(15);

        reconciler.observe_at(&k, snapshot(10_000.0, 0.0, 0.0), t0());
        let reset = reconciler.observe_at(&k, snapshot(100.0, 0.0, 0.0), t0() + step);
        assert_eq!(reset.tokens, 0);
        assert!(reset.tokens_per_sec.abs() < f64::EPSILON);

        let recovered = reconciler.observe_at(&k, snapshot(200.0, 0.0, 0.0), t0() + step * 2);
        assert_eq!(recovered.tokens, 100);
    }

    #[test]
    fn unchanged_counter_is_zero() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(500.0, 1.0, 10.0), t0());
        let deltas = reconciler.observe_at(
            &k,
            snapshot(500.0, 1.0, 10.0),
            t0() + chrono::Duration::seconds(15),
        );
        assert_eq!(deltas, CounterDeltas::default());
    }

    #[test]
    fn zero_elapsed_gives_no_rate() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(100.0, 0.0, 0.0), t0());
        let deltas = reconciler.observe_at(&k, snapshot(200.0, 0.0, 0.0), t0());
        assert_eq!(deltas.tokens, 100);
        assert!(deltas.tokens_per_sec.abs() < f64::EPSILON);
    }

    #[test]
    fn keys_are_independent() {
        let reconciler = CounterReconciler::new();
        reconciler.observe_at(&key("a"), snapshot(100.0, 0.0, 0.0), t0());
        let deltas = reconciler.observe_at(
            &key("b"),
            snapshot(900.0, 0.0, 0.0),
            t0() + chrono::Duration::seconds(5),
        );
        assert_eq!(deltas.tokens, 0);
        assert_eq!(reconciler.len(), 2);
    }

    #[test]
    fn eviction_boundary() {
        let reconciler = CounterReconciler::new();
        let window = chrono::Duration::minutes(10);
        let ms = chrono::Duration::milliseconds(1);

        reconciler.observe_at(&key("exact"), CounterSnapshot::default(), t0());
        reconciler.observe_at(&key("newer"), CounterSnapshot::default(), t0() + ms);
        reconciler.observe_at(&key("older"), CounterSnapshot::default(), t0() - ms);

        let evicted = reconciler.evict_stale_at(t0() + window);

        assert_eq!(evicted, 1);
        assert!(reconciler.contains(&key("exact")));
        assert!(reconciler.contains(&key("newer")));
        assert!(!reconciler.contains(&key("older")));
    }

    #[test]
    fn evicted_pod_starts_fresh() {
        let reconciler = CounterReconciler::new();
        let k = key("p");
        reconciler.observe_at(&k, snapshot(1000.0, 0.0, 0.0), t0());
        let later = t0() + chrono::Duration::minutes(11);
        assert_eq!(reconciler.evict_stale_at(later), 1);
        assert!(reconciler.is_empty());

        let deltas = reconciler.observe_at(&k, snapshot(5000.0, 0.0, 0.0), later);
        assert_eq!(deltas.tokens, 0);
    }

    #[test]
    fn custom_staleness() {
        let reconciler =
            CounterReconciler::with_staleness(Duration::from_secs(60)).expect("valid window");
        assert_eq!(reconciler.staleness(), Duration::from_secs(60));
        reconciler.observe_at(&key("p"), CounterSnapshot::default(), t0());
        assert_eq!(reconciler.evict_stale_at(t0() + chrono::Duration::seconds(61)), 1);
    }

    #[test]
    fn zero_staleness_rejected() {
        assert!(matches!(
            CounterReconciler::with_staleness(Duration::ZERO),
            Err(InferenceError::InvalidWindow { .. })
        ));
        assert_eq!(CounterReconciler::default().staleness(), DEFAULT_STALENESS);
    }

    #[test]
    fn concurrent_observations() {
        let reconciler = std::sync::Arc::new(CounterReconciler::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reconciler = std::sync::Arc::clone(&reconciler);
                std::thread::spawn(move || {
                    let k = key(&format!("pod-{i}"));
                    reconciler.observe_at(&k, snapshot(100.0, 0.0, 0.0), t0());
                    reconciler.observe_at(
                        &k,
                        snapshot(200.0, 0.0, 0.0),
                        t0() + chrono::Duration::seconds(10),
                    )
                })
            })
            .collect();

        for handle in handles {
            let deltas = handle.join().expect("thread");
            assert_eq!(deltas.tokens, 100);
        }
        assert_eq!(reconciler.len(), 8);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn deltas_never_negative(
                prev in 0.0f64..1.0e9,
                cur in 0.0f64..1.0e9,
                prev_sum in 0.0f64..1.0e6,
                cur_sum in 0.0f64..1.0e6,
                prev_count in 0.0f64..1.0e6,
                cur_count in 0.0f64..1.0e6,
                secs in 0i64..3600,
            ) {
                let reconciler = CounterReconciler::new();
                let k = key("p");
                reconciler.observe_at(&k, snapshot(prev, prev_sum, prev_count), t0());
                let deltas = reconciler.observe_at(
                    &k,
                    snapshot(cur, cur_sum, cur_count),
                    t0() + chrono::Duration::seconds(secs),
                );

                prop_assert!(deltas.tokens_per_sec >= 0.0);
                prop_assert!(deltas.avg_latency_ms >= 0.0);
                if cur < prev {
                    prop_assert_eq!(deltas.tokens, 0);
                }
            }

            #[test]
            fn monotonic_delta_matches_difference(prev in 1u64..1_000_000, step in 0u64..1_000_000, secs in 1i64..600) {
                let reconciler = CounterReconciler::new();
                let k = key("p");
                reconciler.observe_at(&k, snapshot(prev as f64, 0.0, 0.0), t0());
                let deltas = reconciler.observe_at(
                    &k,
                    snapshot((prev + step) as f64, 0.0, 0.0),
                    t0() + chrono::Duration::seconds(secs),
                );
                prop_assert_eq!(deltas.tokens, step);
                let expected = step as f64 / secs as f64;
                prop_assert!((deltas.tokens_per_sec - expected).abs() < 1e-9);
            }
        }
    }
}
