//! Invalidation generations for derived cache entries

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Tracked keys are forgotten once the map grows past this many entries
const PRUNE_THRESHOLD: usize = 4096;

struct Marks<K> {
    by_key: HashMap<K, u64>,

    /// Generation of every key that is not tracked
    floor: u64,
}

/// Per-key invalidation generations drawn from one process-wide counter.
///
/// A value derived from data read at generation `g` may only be cached while
/// the key is still at `g`. Every invalidation moves the key to a fresh
/// counter value, and forgetting keys raises the floor to the counter, so a
/// key never returns to a generation a running computation may hold.
pub struct Generations<K> {
    counter: AtomicU64,
    marks: Mutex<Marks<K>>,
}

impl<K> Default for Generations<K> {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
            marks: Mutex::new(Marks {
                by_key: HashMap::new(),
                floor: 0,
            }),
        }
    }
}

impl<K: Eq + Hash> Generations<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn marks(&self) -> MutexGuard<'_, Marks<K>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current generation of `key`
    pub fn current(&self, key: &K) -> u64 {
        let marks = self.marks();
        marks.by_key.get(key).copied().unwrap_or(marks.floor)
    }

    /// Move `key` to a new generation, then run `evict` before any writer
    /// can observe the new generation. Returns the new generation.
    pub fn advance<R>(&self, key: K, evict: impl FnOnce() -> R) -> (u64, R) {
        let mut marks = self.marks();
        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        marks.by_key.insert(key, generation);
        if marks.by_key.len() >= PRUNE_THRESHOLD {
            Self::forget_all(&mut marks, generation);
        }
        (generation, evict())
    }

    /// Run `write` only if `key` is still at `seen`. Invalidations wait for
    /// the write to finish.
    pub fn if_current<R>(&self, key: &K, seen: u64, write: impl FnOnce() -> R) -> Option<R> {
        let marks = self.marks();
        let current = marks.by_key.get(key).copied().unwrap_or(marks.floor);
        (current == seen).then(write)
    }

    /// Forget every tracked key. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut marks = self.marks();
        let counter = self.counter.load(Ordering::SeqCst);
        Self::forget_all(&mut marks, counter)
    }

    fn forget_all(marks: &mut Marks<K>, counter: u64) -> usize {
        let dropped = marks.by_key.len();
        marks.by_key.clear();
        marks.floor = counter;
        dropped
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.marks().by_key.len()
    }
}
