//! In-process cache store with per-namespace byte quotas, TTL and LRU eviction

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Namespace;
use crate::clock::{self, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// A single cached value
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub namespace: Namespace,
    pub key: String,

    /// Serialized value
    pub value: Vec<u8>,

    /// Bytes charged against the namespace quota
    pub size: u64,

    pub created_at: DateTime<Utc>,

    /// `None` means the entry never expires
    pub expires_at: Option<DateTime<Utc>>,

    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// Counters for one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub namespace: Namespace,
    pub count: usize,
    pub bytes: u64,
    pub quota_bytes: u64,

    /// Cumulative since process start; `clear` does not reset them
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl NamespaceStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

/// One namespace's entries, guarded by its own lock
struct Partition {
    namespace: Namespace,
    quota: u64,
    default_ttl: Option<Duration>,
    entries: HashMap<String, Slot>,
    // access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Partition {
    fn new(namespace: Namespace, quota: u64, default_ttl: Option<Duration>) -> Self {
        Self {
            namespace,
            quota,
            default_ttl,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn insert(&mut self, entry: CacheEntry) {
        let tick = self.tick();
        self.bytes += entry.size;
        self.recency.insert(tick, entry.key.clone());
        self.entries.insert(entry.key.clone(), Slot { entry, tick });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.bytes -= slot.entry.size;
        Some(slot.entry)
    }

    /// Mark `key` as most recently used
    fn touch(&mut self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        let tick = self.tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.tick);
        self.recency.insert(tick, key.to_string());
        slot.tick = tick;
        slot.entry.last_accessed_at = now;
        Some(&slot.entry)
    }

    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.recency.pop_first()?;
        let slot = self.entries.remove(&key)?;
        self.bytes -= slot.entry.size;
        self.evictions += 1;
        Some(slot.entry)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|slot| slot.entry.is_expired(now))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.recency.clear();
        self.bytes = 0;
        count
    }

    fn stats(&self) -> NamespaceStats {
        NamespaceStats {
            namespace: self.namespace,
            count: self.entries.len(),
            bytes: self.bytes,
            quota_bytes: self.quota,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }
}

/// Namespace-partitioned key/value store.
///
/// Every namespace enforces its own byte quota; eviction in one namespace
/// never touches another. All operations take `&self` and are safe to call
/// from many request handlers at once.
pub struct CacheStore {
    partitions: [Mutex<Partition>; 4],
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Create a store using the system clock
    pub fn new(config: &CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let partition = |namespace: Namespace| {
            let ns = config.namespace(namespace);
            Mutex::new(Partition::new(namespace, ns.quota_bytes, ns.default_ttl))
        };

        info!(
            total_bytes = config.total_bytes,
            "Cache store initialized"
        );

        Ok(Self {
            partitions: [
                partition(Namespace::Main),
                partition(Namespace::Analytics),
                partition(Namespace::Ai),
                partition(Namespace::Session),
            ],
            clock,
        })
    }

    fn partition(&self, namespace: Namespace) -> MutexGuard<'_, Partition> {
        let index = match namespace {
            Namespace::Main => 0,
            Namespace::Analytics => 1,
            Namespace::Ai => 2,
            Namespace::Session => 3,
        };
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The clock used for TTL decisions
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Byte quota of a namespace
    pub fn quota(&self, namespace: Namespace) -> u64 {
        self.partition(namespace).quota
    }

    /// Default TTL configured for a namespace
    pub fn default_ttl(&self, namespace: Namespace) -> Option<Duration> {
        self.partition(namespace).default_ttl
    }

    /// Store a value. `ttl = None` stores it without expiry.
    ///
    /// Evicts expired and then least-recently-used entries of the same
    /// namespace until the value fits. A value larger than the whole quota is
    /// rejected and any existing value under `key` is left in place.
    pub fn set(
        &self,
        namespace: Namespace,
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = key.into();
        let size = value.len() as u64;
        let now = self.clock.now();

        let mut part = self.partition(namespace);
        if size > part.quota {
            return Err(Error::Oversize {
                namespace,
                size,
                quota: part.quota,
            });
        }

        part.remove(&key);

        if part.bytes + size > part.quota {
            let purged = part.purge_expired(now);
            if purged > 0 {
                debug!(namespace = %namespace, purged, "Dropped expired entries to make room");
            }
        }
        while part.bytes + size > part.quota {
            match part.evict_lru() {
                Some(evicted) => debug!(
                    namespace = %namespace,
                    key = %evicted.key,
                    size = evicted.size,
                    "Evicted least recently used entry"
                ),
                None => break,
            }
        }

        part.insert(CacheEntry {
            namespace,
            key,
            value,
            size,
            created_at: now,
            expires_at: ttl.and_then(|ttl| clock::add(now, ttl)),
            last_accessed_at: now,
        });

        Ok(())
    }

    /// Look up a value; absent, expired and evicted keys are all a miss
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut part = self.partition(namespace);

        let expired = match part.entries.get(key) {
            Some(slot) => slot.entry.is_expired(now),
            None => {
                part.misses += 1;
                debug!(namespace = %namespace, key, "Cache miss");
                return None;
            }
        };

        if expired {
            part.remove(key);
            part.expirations += 1;
            part.misses += 1;
            debug!(namespace = %namespace, key, "Cache entry expired");
            return None;
        }

        part.hits += 1;
        debug!(namespace = %namespace, key, "Cache hit");
        part.touch(key, now).map(|entry| entry.value.clone())
    }

    /// Inspect an entry without counting a lookup or refreshing its recency
    pub fn peek(&self, namespace: Namespace, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let part = self.partition(namespace);
        part.entries
            .get(key)
            .map(|slot| slot.entry.clone())
            .filter(|entry| !entry.is_expired(now))
    }

    /// Serialize `value` as JSON and store it
    pub fn set_json<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, bytes, ttl)
    }

    /// Look up and deserialize a JSON value. Undecodable entries are dropped
    /// and reported as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let bytes = self.get(namespace, key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(namespace = %namespace, key, error = %e, "Dropping undecodable cache entry");
                self.delete(namespace, key);
                None
            }
        }
    }

    /// Remove a key. Returns whether anything was removed.
    pub fn delete(&self, namespace: Namespace, key: &str) -> bool {
        self.partition(namespace).remove(key).is_some()
    }

    /// Remove every key starting with `prefix`
    pub fn delete_prefix(&self, namespace: Namespace, prefix: &str) -> usize {
        let mut part = self.partition(namespace);
        let keys: Vec<String> = part
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            part.remove(key);
        }
        keys.len()
    }

    /// Drop all entries of one namespace, or of every namespace
    pub fn clear(&self, namespace: Option<Namespace>) -> usize {
        let targets: Vec<Namespace> = match namespace {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };

        let mut cleared = 0;
        for ns in targets {
            cleared += self.partition(ns).clear();
        }
        info!(namespace = ?namespace.map(|ns| ns.as_str()), cleared, "Cleared cache");
        cleared
    }

    /// Counters for one namespace, or for every namespace
    pub fn stats(&self, namespace: Option<Namespace>) -> Vec<NamespaceStats> {
        match namespace {
            Some(ns) => vec![self.partition(ns).stats()],
            None => Namespace::ALL
                .iter()
                .map(|ns| self.partition(*ns).stats())
                .collect(),
        }
    }

    /// Bytes stored across all namespaces
    pub fn total_bytes(&self) -> u64 {
        Namespace::ALL
            .iter()
            .map(|ns| self.partition(*ns).bytes)
            .sum()
    }

    /// Physically remove expired entries from every namespace
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        Namespace::ALL
            .iter()
            .map(|ns| self.partition(*ns).purge_expired(now))
            .sum()
    }

    /// Run `sweep_expired` every `interval` until the store is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.sweep_expired();
                if purged > 0 {
                    debug!(purged, "Swept expired cache entries");
                }
            }
        })
    }
}
