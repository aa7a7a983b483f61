// =============================================================================
// Single-Flight Cache: TTL cache with coalesced, time-bounded recomputation
// =============================================================================
//
// get_or_compute(key, ttl, compute):
//
//   1. fresh entry            -> returned immediately (hit)
//   2. key already in flight  -> wait on the leader's completion channel
//   3. otherwise              -> become leader: register the key, run
//                                `compute` in its own task under a timeout,
//                                store on success, publish the outcome
//
// Invariants:
//   - at most one computation per key is running at any time;
//   - the in-flight entry is removed on every leader exit path (success,
//     error, timeout, panic) by `FlightGuard`;
//   - the entry is stored before the outcome is published, so a caller that
//     arrives after the leader finished always hits.
//
// The computation is spawned, so a leader whose caller went away still runs
// to completion (or timeout).  The timeout is the only cancellation.
//
// All shared state (entries, in-flight registry, counters) sits behind one
// mutex that is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::stats::{CacheCounters, CacheStats};
use crate::error::AnalysisError;

/// Default time budget for one computation.
pub const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome seen by every caller of one computation window.
#[derive(Debug)]
pub enum CacheResponse<V> {
    Ready(Arc<V>),
    /// The computation exceeded its time budget; nothing was cached.
    Computing,
    /// The computation failed; nothing was cached, the next caller retries.
    Failed(AnalysisError),
}

impl<V> Clone for CacheResponse<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(v) => Self::Ready(Arc::clone(v)),
            Self::Computing => Self::Computing,
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

impl<V> CacheResponse<V> {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Computing => "computing",
            Self::Failed(_) => "failed",
        }
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// `{ "status": ..., "data": ... }`; placeholders carry an empty `data` list.
impl<V: Serialize> Serialize for CacheResponse<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let empty: &[u8] = &[];
        let len = if matches!(self, Self::Failed(_)) { 3 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("status", self.status())?;
        match self {
            Self::Ready(v) => map.serialize_entry("data", v.as_ref())?,
            Self::Computing => map.serialize_entry("data", empty)?,
            Self::Failed(e) => {
                map.serialize_entry("data", empty)?;
                map.serialize_entry("error", &e.to_string())?;
            }
        }
        map.end()
    }
}

struct CacheEntry<V> {
    value: Arc<V>,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

type Completion<V> = Option<CacheResponse<V>>;

/// What a caller does after the registry check.
enum Role<V> {
    Hit(Arc<V>),
    Follower(watch::Receiver<Completion<V>>),
    Leader(watch::Sender<Completion<V>>),
}

struct InFlight<V> {
    started_at: Instant,
    done: watch::Receiver<Completion<V>>,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    counters: CacheCounters,
}

impl<V> CacheState<V> {
    /// Fresh value for `key`; an expired entry is evicted on the way.
    fn lookup(&mut self, key: &str, now: Instant) -> Option<Arc<V>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(Arc::clone(&entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
            self.counters.evictions += 1;
        }
        None
    }
}

/// Get-or-compute cache with per-key request coalescing.
///
/// Cloning is cheap and every clone shares the same entries.
pub struct SingleFlightCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
    compute_timeout: Duration,
}

impl<V> Clone for SingleFlightCache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            compute_timeout: self.compute_timeout,
        }
    }
}

impl<V> SingleFlightCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(compute_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                counters: CacheCounters::default(),
            })),
            compute_timeout,
        }
    }

    pub fn compute_timeout(&self) -> Duration {
        self.compute_timeout
    }

    /// Return the cached value for `key`, or compute it exactly once across
    /// all concurrent callers. Never fails: errors and timeouts come back
    /// as `Failed` / `Computing`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> CacheResponse<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let role = {
            let mut state = self.state.lock();
            let now = Instant::now();

            if let Some(value) = state.lookup(key, now) {
                state.counters.hits += 1;
                Role::Hit(value)
            } else {
                state.counters.misses += 1;
                let follower = state.in_flight.get(key).map(|f| f.done.clone());
                match follower {
                    Some(done) => {
                        state.counters.coalesced += 1;
                        Role::Follower(done)
                    }
                    None => {
                        let (tx, done) = watch::channel(None);
                        state.in_flight.insert(
                            key.to_string(),
                            InFlight {
                                started_at: now,
                                done,
                            },
                        );
                        Role::Leader(tx)
                    }
                }
            }
        };

        let leader_tx = match role {
            Role::Hit(value) => {
                debug!(key, "cache hit");
                return CacheResponse::Ready(value);
            }
            Role::Follower(done) => {
                debug!(key, "computation in flight, waiting for leader");
                return wait_for_completion(key, done).await;
            }
            Role::Leader(tx) => tx,
        };

        let done = leader_tx.subscribe();
        let guard = FlightGuard {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            ttl,
            tx: Some(leader_tx),
        };

        let timeout = self.compute_timeout;

        debug!(key, ?timeout, "cache miss, computing");
        tokio::spawn(async move {
            let started = Instant::now();
            // Built inside the task: a panic while building is caught by the
            // runtime and reported through the guard like any other panic.
            let future = compute();
            match tokio::time::timeout(timeout, future).await {
                Ok(Ok(value)) => {
                    debug!(key = %guard.key, elapsed = ?started.elapsed(), "computation finished");
                    guard.finish(Ok(value));
                }
                Ok(Err(e)) => {
                    let err = AnalysisError::TransientComputation {
                        key: guard.key.clone(),
                        message: format!("{e:#}"),
                    };
                    warn!(error = %err, "computation failed, result not cached");
                    guard.finish(Err(err));
                }
                Err(_) => {
                    let err = AnalysisError::ComputationTimeout {
                        key: guard.key.clone(),
                        timeout,
                    };
                    warn!(error = %err, "computation timed out, returning placeholder");
                    guard.finish(Err(err));
                }
            }
        });

        wait_for_completion(key, done).await
    }

    /// Drop every expired entry. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - state.entries.len();
        state.counters.evictions += evicted as u64;
        evicted
    }

    /// Remove one entry. An in-flight computation for the key is unaffected.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.counters.evictions += 1;
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        let cleared = state.entries.len();
        state.entries.clear();
        state.counters.evictions += cleared as u64;
        info!(cleared, "cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        state
            .counters
            .snapshot(state.entries.len(), state.in_flight.len())
    }

    /// How long the computation for `key` has been running, if any.
    pub fn in_flight_age(&self, key: &str) -> Option<Duration> {
        self.state
            .lock()
            .in_flight
            .get(key)
            .map(|f| f.started_at.elapsed())
    }

    /// Periodically evict expired entries until the handle is aborted.
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = cache.cleanup_expired();
                if evicted > 0 {
                    debug!(evicted, "expired cache entries removed");
                }
            }
        })
    }
}

impl<V> Default for SingleFlightCache<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_COMPUTE_TIMEOUT)
    }
}

async fn wait_for_completion<V>(
    key: &str,
    mut done: watch::Receiver<Completion<V>>,
) -> CacheResponse<V> {
    let outcome = done
        .wait_for(Option::is_some)
        .await
        .map(|completion| (*completion).clone());

    match outcome {
        Ok(Some(response)) => response,
        _ => CacheResponse::Failed(AnalysisError::TransientComputation {
            key: key.to_string(),
            message: "computation abandoned without an outcome".to_string(),
        }),
    }
}

/// Owns a leader's in-flight registration. Dropping it without `finish`
/// (panic, early return) still clears the registry and wakes followers.
struct FlightGuard<V> {
    state: Arc<Mutex<CacheState<V>>>,
    key: String,
    ttl: Duration,
    tx: Option<watch::Sender<Completion<V>>>,
}

impl<V> FlightGuard<V> {
    fn finish(mut self, outcome: Result<V, AnalysisError>) {
        let response = {
            let mut state = self.state.lock();
            let response = match outcome {
                Ok(value) => {
                    let value = Arc::new(value);
                    state.entries.insert(
                        self.key.clone(),
                        CacheEntry {
                            value: Arc::clone(&value),
                            created_at: Instant::now(),
                            ttl: self.ttl,
                        },
                    );
                    state.counters.sets += 1;
                    CacheResponse::Ready(value)
                }
                Err(e @ AnalysisError::ComputationTimeout { .. }) => {
                    state.counters.timeouts += 1;
                    debug!(error = %e, "placeholder published");
                    CacheResponse::Computing
                }
                Err(e) => {
                    state.counters.failures += 1;
                    CacheResponse::Failed(e)
                }
            };
            state.in_flight.remove(&self.key);
            response
        };

        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(response));
        }
    }
}

impl<V> Drop for FlightGuard<V> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&self.key);
            state.counters.failures += 1;
        }
        warn!(key = %self.key, "computation aborted before completing");
        tx.send_replace(Some(CacheResponse::Failed(
            AnalysisError::TransientComputation {
                key: self.key.clone(),
                message: "computation panicked".to_string(),
            },
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::future::join_all;
    use tokio::time::sleep;

    const TTL: Duration = Duration::from_secs(30);

    fn counting(
        counter: &Arc<AtomicUsize>,
        delay: Duration,
        value: u32,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<u32>> + Send>> {
        let counter = Arc::clone(counter);
        move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Ok(value)
            })
        }
    }

    async fn exploding() -> anyhow::Result<u32> {
        panic!("indicator blew up")
    }

    fn exploding_builder() -> std::future::Ready<anyhow::Result<u32>> {
        panic!("indicator setup blew up")
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let cache = SingleFlightCache::<u32>::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let calls = (0..50).map(|_| {
            let cache = cache.clone();
            let compute = counting(&counter, Duration::from_millis(200), 7);
            async move { cache.get_or_compute("confluence:BTCUSDT", TTL, compute).await }
        });
        let responses = join_all(calls).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let first = responses[0].value().unwrap().clone();
        for r in &responses {
            assert!(Arc::ptr_eq(r.value().unwrap(), &first));
        }
        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.coalesced, 49);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_bounds_reuse() {
        let cache = SingleFlightCache::<u32>::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(5);

        let a = cache
            .get_or_compute("k", ttl, counting(&counter, Duration::ZERO, 1))
            .await;
        let b = cache
            .get_or_compute("k", ttl, counting(&counter, Duration::ZERO, 2))
            .await;
        assert_eq!(**a.value().unwrap(), 1);
        assert_eq!(**b.value().unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let c = cache
            .get_or_compute("k", ttl, counting(&counter, Duration::ZERO, 3))
            .await;
        assert_eq!(**c.value().unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_placeholder_without_caching() {
        let cache = SingleFlightCache::<u32>::new(Duration::from_secs(10));
        let counter = Arc::new(AtomicUsize::new(0));

        let slow = cache
            .get_or_compute("k", TTL, counting(&counter, Duration::from_secs(20), 1))
            .await;
        assert!(matches!(slow, CacheResponse::Computing));
        let json = serde_json::to_value(&slow).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "computing", "data": [] }));

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.timeouts, 1);

        let next = cache
            .get_or_compute("k", TTL, counting(&counter, Duration::from_secs(1), 2))
            .await;
        assert_eq!(**next.value().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn followers_see_the_same_timeout() {
        let cache = SingleFlightCache::<u32>::new(Duration::from_secs(10));
        let counter = Arc::new(AtomicUsize::new(0));

        let calls = (0..5).map(|_| {
            let cache = cache.clone();
            let compute = counting(&counter, Duration::from_secs(60), 1);
            async move { cache.get_or_compute("k", TTL, compute).await }
        });
        for r in join_all(calls).await {
            assert_eq!(r.status(), "computing");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_cached() {
        let cache = SingleFlightCache::<u32>::default();

        let failed = cache
            .get_or_compute("k", TTL, || async { Err(anyhow::anyhow!("feed down")) })
            .await;
        match &failed {
            CacheResponse::Failed(AnalysisError::TransientComputation { message, .. }) => {
                assert!(message.contains("feed down"));
            }
            other => panic!("unexpected response: {}", other.status()),
        }
        assert_eq!(cache.stats().in_flight, 0);

        let retried = cache.get_or_compute("k", TTL, || async { Ok(9) }).await;
        assert_eq!(**retried.value().unwrap(), 9);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_computation_clears_in_flight() {
        let cache = SingleFlightCache::<u32>::default();

        let r = cache.get_or_compute("k", TTL, exploding).await;
        assert_eq!(r.status(), "failed");
        assert_eq!(cache.stats().in_flight, 0);

        let r = cache.get_or_compute("k", TTL, || async { Ok(1) }).await;
        assert!(r.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn panic_while_building_the_computation_is_contained() {
        let cache = SingleFlightCache::<u32>::default();

        let r = cache.get_or_compute("k", TTL, exploding_builder).await;
        assert_eq!(r.status(), "failed");
        let stats = cache.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.failures, 1);

        let r = cache.get_or_compute("k", TTL, || async { Ok(2) }).await;
        assert_eq!(**r.value().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_leader_still_populates_cache() {
        let cache = SingleFlightCache::<u32>::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let leader = {
            let cache = cache.clone();
            let compute = counting(&counter, Duration::from_secs(1), 5);
            tokio::spawn(async move { cache.get_or_compute("k", TTL, compute).await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(cache.in_flight_age("k").is_some());
        leader.abort();

        sleep(Duration::from_secs(2)).await;
        let r = cache
            .get_or_compute("k", TTL, counting(&counter, Duration::ZERO, 6))
            .await;
        assert_eq!(**r.value().unwrap(), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_expired_entries() {
        let cache = SingleFlightCache::<u32>::default();
        cache
            .get_or_compute("short", Duration::from_secs(1), || async { Ok(1) })
            .await;
        cache
            .get_or_compute("long", Duration::from_secs(100), || async { Ok(2) })
            .await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.cleanup_expired(), 1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.evictions, 1);

        assert!(cache.invalidate("long"));
        assert!(!cache.invalidate("long"));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_counts_removed_entries_as_evictions() {
        let cache = SingleFlightCache::<u32>::default();
        for key in ["a", "b", "c"] {
            cache.get_or_compute(key, TTL, || async { Ok(1) }).await;
        }

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_cleanup_runs() {
        let cache = SingleFlightCache::<u32>::default();
        cache
            .get_or_compute("k", Duration::from_secs(1), || async { Ok(1) })
            .await;
        let handle = cache.spawn_cleanup(Duration::from_secs(60));

        sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.stats().entries, 0);
        handle.abort();
    }

    #[test]
    fn ready_serialises_with_data() {
        let r = CacheResponse::Ready(Arc::new(vec![1, 2]));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "ready", "data": [1, 2] }));
    }
}
