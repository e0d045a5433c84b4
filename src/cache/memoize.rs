//! Read-through memoization with stampede protection

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{CacheStore, Generations, Namespace};
use crate::config::RetryConfig;
use crate::error::{Error, Result};

type Flight<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;
type Registry<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

fn lock<K, V>(registry: &Registry<K, V>) -> MutexGuard<'_, HashMap<K, Flight<V>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a finished flight from the registry, also when the task panics
/// or is torn down with the runtime.
struct Landing<K: Eq + Hash, V> {
    registry: Registry<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for Landing<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.registry).remove(&key);
        }
    }
}

/// Single-flight deduplication: concurrent callers with the same key share
/// one execution and all receive its result or its failure.
///
/// The work runs in its own tokio task, so dropping any caller (the first
/// one included) neither cancels it nor strands the others.
pub struct SingleFlight<K, V> {
    flights: Registry<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }

    /// Run the future built by `make` unless an execution for `key` is
    /// already running, in which case wait for that one instead. `make` is
    /// only called by the caller that starts the execution.
    pub async fn coalesce<M, F>(&self, key: K, make: M) -> Result<V>
    where
        M: FnOnce() -> F + Send,
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let flight = {
            let mut flights = lock(&self.flights);
            match flights.get(&key) {
                Some(existing) => {
                    debug!(key = ?key, "Joining in-flight computation");
                    existing.clone()
                }
                None => {
                    let work = make();
                    let landing = Landing {
                        registry: Arc::clone(&self.flights),
                        key: Some(key.clone()),
                    };
                    // The task cannot land before the flight is registered:
                    // removal takes the lock held here.
                    let handle = tokio::spawn(async move {
                        let _landing = landing;
                        work.await.map_err(Arc::new)
                    });
                    let flight: Flight<V> = async move {
                        match handle.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(Arc::new(Error::Internal(format!(
                                "computation task failed: {}",
                                e
                            )))),
                        }
                    }
                    .boxed()
                    .shared();
                    flights.insert(key, flight.clone());
                    flight
                }
            }
        };

        flight.await.map_err(|e| e.replicate())
    }
}

/// Admission check for a memoized result: it is only cached while `key` is
/// still at the generation captured when the gate was opened.
pub struct Gate<K> {
    generations: Arc<Generations<K>>,
    key: K,
    seen: u64,
}

impl<K: Eq + Hash> Gate<K> {
    /// Capture the current generation of `key`
    pub fn open(generations: Arc<Generations<K>>, key: K) -> Self {
        let seen = generations.current(&key);
        Self {
            generations,
            key,
            seen,
        }
    }

    pub fn generation(&self) -> u64 {
        self.seen
    }
}

/// Memoizes computations into a [`CacheStore`].
///
/// At most one computation runs per `(namespace, key)`. Its result is stored
/// before any caller sees it; failures are handed to every waiter and never
/// cached.
pub struct Memoizer {
    store: Arc<CacheStore>,
    flights: SingleFlight<(Namespace, String), Arc<Vec<u8>>>,
    compute_timeout: Duration,
}

impl Memoizer {
    pub fn new(store: Arc<CacheStore>, compute_timeout: Duration) -> Self {
        Self {
            store,
            flights: SingleFlight::new(),
            compute_timeout,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Computations currently running
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// A compute error surfaces as [`Error::ComputeFailure`]; exceeding the
    /// compute timeout surfaces as [`Error::Timeout`]. If the result cannot
    /// be stored (for example it is larger than the namespace quota) it is
    /// still returned.
    pub async fn memoize<T, C, F>(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Option<Duration>,
        compute: C,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        C: FnOnce() -> F + Send,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.run(namespace, key, key.to_string(), ttl, compute, |write: &dyn Fn()| {
            write();
            true
        })
        .await
    }

    /// Like [`memoize`](Self::memoize), but the result is only cached if the
    /// gate's key was not invalidated while computing. Callers holding gates
    /// of different generations never share a computation.
    pub async fn memoize_gated<K, T, C, F>(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Option<Duration>,
        gate: Gate<K>,
        compute: C,
    ) -> Result<T>
    where
        K: Eq + Hash + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        C: FnOnce() -> F + Send,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let flight_key = format!("{}@{}", key, gate.seen);
        self.run(namespace, key, flight_key, ttl, compute, move |write: &dyn Fn()| {
            gate.generations
                .if_current(&gate.key, gate.seen, write)
                .is_some()
        })
        .await
    }

    async fn run<T, C, F, A>(
        &self,
        namespace: Namespace,
        key: &str,
        flight_key: String,
        ttl: Option<Duration>,
        compute: C,
        admit: A,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        C: FnOnce() -> F + Send,
        F: Future<Output = Result<T>> + Send + 'static,
        A: FnOnce(&dyn Fn()) -> bool + Send + 'static,
    {
        if let Some(value) = self.store.get_json::<T>(namespace, key) {
            return Ok(value);
        }

        let store = Arc::clone(&self.store);
        let timeout = self.compute_timeout;
        let owned_key = key.to_string();

        let bytes = self
            .flights
            .coalesce((namespace, flight_key), move || {
                let work = compute();
                async move {
                    // An earlier flight may have landed since the miss above
                    if let Some(entry) = store.peek(namespace, &owned_key) {
                        debug!(namespace = %namespace, key = %owned_key, "Computed while waiting");
                        return Ok(Arc::new(entry.value));
                    }

                    let value = match tokio::time::timeout(timeout, work).await {
                        Ok(Ok(value)) => value,
                        Ok(Err(e)) if e.is_retryable() => return Err(e),
                        Ok(Err(e)) => {
                            return Err(Error::compute_failure(namespace, owned_key, e.to_string()))
                        }
                        Err(_) => {
                            return Err(Error::timeout(
                                format!("memoize {}/{}", namespace, owned_key),
                                timeout,
                            ))
                        }
                    };

                    let bytes = serde_json::to_vec(&value)?;
                    let write = || {
                        if let Err(e) = store.set(namespace, owned_key.as_str(), bytes.clone(), ttl) {
                            warn!(
                                namespace = %namespace,
                                key = %owned_key,
                                error = %e,
                                "Memoized value not cached"
                            );
                        }
                    };
                    if !admit(&write) {
                        debug!(
                            namespace = %namespace,
                            key = %owned_key,
                            "Discarding value computed before an invalidation"
                        );
                    }
                    Ok::<_, Error>(Arc::new(bytes))
                }
            })
            .await?;

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Run `op`, retrying retryable failures with exponential backoff until
/// `policy.max_attempts` attempts have been made.
pub async fn with_retry<T, O, F>(policy: &RetryConfig, mut op: O) -> Result<T>
where
    O: FnMut() -> F,
    F: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let backoff = policy.backoff_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after retryable failure"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn memoizer(timeout: Duration) -> Memoizer {
        let store = CacheStore::new(&CacheConfig::with_total_bytes(1_000_000)).unwrap();
        Memoizer::new(Arc::new(store), timeout)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let memo = Arc::new(memoizer(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let memo = Arc::clone(&memo);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                memo.memoize(Namespace::Analytics, "customer:1:profile", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Error>(vec![1u32, 2, 3])
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let memo = memoizer(Duration::from_secs(5));

        let err = memo
            .memoize::<u32, _, _>(Namespace::Main, "flaky", None, || async {
                Err(Error::storage("upstream down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ComputeFailure { .. }));
        assert!(memo.store().peek(Namespace::Main, "flaky").is_none());
        assert_eq!(memo.in_flight(), 0);

        let value = memo
            .memoize(Namespace::Main, "flaky", None, || async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cached_value_skips_compute() {
        let memo = memoizer(Duration::from_secs(5));
        memo.memoize(Namespace::Ai, "ai:abc", None, || async { Ok("hello".to_string()) })
            .await
            .unwrap();

        let value: String = memo
            .memoize(Namespace::Ai, "ai:abc", None, || async {
                Err(Error::storage("should not run"))
            })
            .await
            .unwrap();
        assert_eq!(value, "hello");
    }

    #[tokio::test]
    async fn test_timeout_releases_key() {
        let memo = memoizer(Duration::from_millis(50));

        let err = memo
            .memoize::<u32, _, _>(Namespace::Main, "slow", None, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(memo.in_flight(), 0);

        let value = memo
            .memoize(Namespace::Main, "slow", None, || async { Ok(2u32) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_keys_do_not_serialize() {
        let memo = memoizer(Duration::from_secs(5));
        let barrier = Arc::new(Barrier::new(2));

        let run = |key: &'static str| {
            let barrier = Arc::clone(&barrier);
            memo.memoize(Namespace::Main, key, None, move || async move {
                barrier.wait().await;
                Ok(key.to_string())
            })
        };

        let both = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(run("left"), run("right"))
        })
        .await
        .expect("computations for distinct keys must overlap");

        assert_eq!(both.0.unwrap(), "left");
        assert_eq!(both.1.unwrap(), "right");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_caller_does_not_cancel_compute() {
        let memo = Arc::new(memoizer(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let memo = Arc::clone(&memo);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                memo.memoize(Namespace::Main, "report", None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(42u64)
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(memo.store().peek(Namespace::Main, "report").is_some());
        assert_eq!(memo.in_flight(), 0);

        let value: u64 = memo
            .memoize(Namespace::Main, "report", None, || async { Ok(0u64) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversize_result_is_still_returned() {
        let config = CacheConfig::with_total_bytes(1_000).with_quota(Namespace::Ai, 8);
        let memo = Memoizer::new(
            Arc::new(CacheStore::new(&config).unwrap()),
            Duration::from_secs(1),
        );

        let value = memo
            .memoize(Namespace::Ai, "big", None, || async {
                Ok("a long answer from the model".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "a long answer from the model");
        assert!(memo.store().peek(Namespace::Ai, "big").is_none());
    }

    #[tokio::test]
    async fn test_leader_reuses_value_landed_after_miss() {
        let memo = Arc::new(memoizer(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let memo = Arc::clone(&memo);
            tokio::spawn(async move {
                memo.run(
                    Namespace::Main,
                    "menu",
                    "menu#first".to_string(),
                    None,
                    move || async move {
                        let _ = released.await;
                        Ok(1u32)
                    },
                    |write: &dyn Fn()| {
                        write();
                        true
                    },
                )
                .await
            })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        // Misses the store, but its leader only runs once the first landed
        let calls_in = Arc::clone(&calls);
        let second: u32 = memo
            .run(
                Namespace::Main,
                "menu",
                "menu#second".to_string(),
                None,
                move || async move {
                    calls_in.fetch_add(1, Ordering::SeqCst);
                    Ok(2u32)
                },
                |write: &dyn Fn()| {
                    write();
                    true
                },
            )
            .await
            .unwrap();

        assert_eq!(second, 1);
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gated_result_dropped_after_invalidation() {
        let memo = memoizer(Duration::from_secs(5));
        let generations = Arc::new(Generations::new());
        let key = "customer:1:memory_profile";

        let gate = Gate::open(Arc::clone(&generations), 1i64);
        let during = Arc::clone(&generations);
        let value = memo
            .memoize_gated(Namespace::Analytics, key, None, gate, move || async move {
                during.advance(1, || ());
                Ok(1u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert!(memo.store().peek(Namespace::Analytics, key).is_none());

        let gate = Gate::open(Arc::clone(&generations), 1i64);
        let value = memo
            .memoize_gated(Namespace::Analytics, key, None, gate, || async { Ok(2u32) })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert!(memo.store().peek(Namespace::Analytics, key).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_flight_shares_failure() {
        let flights: Arc<SingleFlight<u64, u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flights
                    .coalesce(9, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u64, _>(Error::timeout("rebuild", Duration::from_millis(50)))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_retryable());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_with_retry_caps_attempts() {
        let policy = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };

        let attempts = AtomicUsize::new(0);
        let err = with_retry(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::timeout("aggregate", Duration::from_millis(1)))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let attempts = AtomicUsize::new(0);
        let value = with_retry(&policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::timeout("aggregate", Duration::from_millis(1)))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let attempts = AtomicUsize::new(0);
        let err = with_retry(&policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::storage("disk full"))
        })
        .await
        .unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
