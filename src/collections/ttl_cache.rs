//! Bounded TTL cache
//!
//! Entries are indexed twice: by key for lookups and by insertion time for
//! eviction. Expired entries are dropped by [`BoundedTtlCache::sweep`] (run
//! periodically by the owner) and are never returned by reads in between.
//! Inserting past `max_entries` evicts the oldest entries first.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// When entries leave the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Age after which an entry is expired
    pub ttl: Duration,
    /// Hard cap on live entries
    pub max_entries: usize,
}

impl EvictionPolicy {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) >= self.ttl
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 1000)
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

/// Size-capped map whose entries expire a fixed time after insertion
#[derive(Debug)]
pub struct BoundedTtlCache<K, V> {
    policy: EvictionPolicy,
    entries: HashMap<K, Entry<V>>,
    /// (inserted_at, seq) -> key, oldest first
    by_age: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
    evictions: u64,
}

impl<K, V> BoundedTtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            next_seq: 0,
            evictions: 0,
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Insert or replace; a replaced entry gets a fresh insertion time
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_at(key, value, Instant::now())
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        let previous = self.remove(&key);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_age.insert((now, seq), key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                seq,
            },
        );

        while self.entries.len() > self.policy.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| !self.policy.is_expired(e.inserted_at, now))
            .map(|e| &e.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.by_age.remove(&(entry.inserted_at, entry.seq));
        Some(entry.value)
    }

    fn evict_oldest(&mut self) -> bool {
        match self.by_age.pop_first() {
            Some((_, key)) => {
                self.entries.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(((inserted_at, _), _)) = self.by_age.first_key_value() {
            if !self.policy.is_expired(*inserted_at, now) {
                break;
            }
            if let Some((_, key)) = self.by_age.pop_first() {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Entries currently stored, expired-but-unswept ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries removed by the size cap since creation
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_age.clear();
    }
}
