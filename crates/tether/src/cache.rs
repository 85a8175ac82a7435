//! Weak Identity Cache
//!
//! Maps keys to weakly held shared values so that every live value has exactly
//! one instance. The most recent insertions are additionally pinned in a
//! fixed-size FIFO ring of strong references, which keeps recently used values
//! alive even when nothing outside the cache holds them.
//!
//! Expired map entries are swept by [`WeakIdentityCache::purge`], which also
//! runs automatically once both the access-count and the interval thresholds
//! of [`CacheConfig`] have been crossed, and before every snapshot.
//!
//! The cache is `!Send`: it stays on the thread that built it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{self, Rc};
use std::sync::{self, Arc};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Shared references
// ─────────────────────────────────────────────────────────────────────────────

/// A reference-counted pointer with a weak counterpart.
pub trait SharedRef: Clone {
    type Weak;

    fn downgrade(this: &Self) -> Self::Weak;

    fn upgrade(weak: &Self::Weak) -> Option<Self>;

    fn is_expired(weak: &Self::Weak) -> bool;
}

impl<T: ?Sized> SharedRef for Arc<T> {
    type Weak = sync::Weak<T>;

    fn downgrade(this: &Self) -> Self::Weak {
        Arc::downgrade(this)
    }

    fn upgrade(weak: &Self::Weak) -> Option<Self> {
        weak.upgrade()
    }

    fn is_expired(weak: &Self::Weak) -> bool {
        weak.strong_count() == 0
    }
}

impl<T: ?Sized> SharedRef for Rc<T> {
    type Weak = rc::Weak<T>;

    fn downgrade(this: &Self) -> Self::Weak {
        Rc::downgrade(this)
    }

    fn upgrade(weak: &Self::Weak) -> Option<Self> {
        weak.upgrade()
    }

    fn is_expired(weak: &Self::Weak) -> bool {
        weak.strong_count() == 0
    }
}

type Creator<K, R> = Box<dyn FnMut(&K) -> R>;
type Cleaner<K> = Box<dyn FnMut(&K)>;

/// Counters describing how a cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `get` calls answered by a live entry
    pub hits: u64,
    /// `get` calls that found nothing live
    pub misses: u64,
    /// Values produced by the creator
    pub created: u64,
    /// Values pushed out of the strong ring
    pub evictions: u64,
    /// Purge passes, automatic or explicit
    pub purges: u64,
    /// Cleaner invocations
    pub cleaned: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Identity-preserving cache of weakly held values.
pub struct WeakIdentityCache<K, R: SharedRef> {
    entries: BTreeMap<K, R::Weak>,
    ring: VecDeque<(K, R)>,
    config: CacheConfig,
    creator: Option<Creator<K, R>>,
    cleaner: Option<Cleaner<K>>,
    accesses_since_purge: usize,
    last_purge: Instant,
    stats: CacheStats,
}

impl<K, R> WeakIdentityCache<K, R>
where
    K: Ord + Clone + fmt::Debug,
    R: SharedRef,
{
    /// Cache with default tuning and no creator.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            ring: VecDeque::with_capacity(config.capacity + 1),
            config,
            creator: None,
            cleaner: None,
            accesses_since_purge: 0,
            last_purge: Instant::now(),
            stats: CacheStats::default(),
        }
    }

    pub fn builder() -> WeakIdentityCacheBuilder<K, R> {
        WeakIdentityCacheBuilder::new()
    }

    /// Look up `key`, creating the value with the configured creator on a
    /// miss. Returns `None` on a miss when no creator is configured.
    pub fn get(&mut self, key: &K) -> Option<R> {
        self.note_access();

        if let Some(value) = self.entries.get(key).and_then(R::upgrade) {
            self.stats.hits += 1;
            return Some(value);
        }
        self.stats.misses += 1;

        let creator = self.creator.as_mut()?;
        let value = creator(key);
        self.stats.created += 1;
        self.insert(key.clone(), value.clone());
        Some(value)
    }

    /// Add `value` under `key` and pin it in the strong ring.
    ///
    /// The caller must make sure no live value is cached for `key`; inserting
    /// over one breaks the one-instance-per-key guarantee.
    pub fn insert(&mut self, key: K, value: R) {
        debug_assert!(
            !self.contains(&key),
            "WeakIdentityCache: inserting {key:?} over a live entry"
        );

        self.entries.insert(key.clone(), R::downgrade(&value));
        self.ring.push_back((key, value));

        while self.ring.len() > self.config.capacity {
            let Some((evicted, value)) = self.ring.pop_front() else {
                break;
            };
            drop(value);
            self.stats.evictions += 1;
            self.release(&evicted);
        }
    }

    /// Whether a live value is cached for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|weak| !R::is_expired(weak))
    }

    /// Drop every expired entry, notifying the cleaner for each.
    pub fn purge(&mut self) {
        self.accesses_since_purge = 0;
        self.last_purge = Instant::now();
        self.stats.purges += 1;

        let mut expired = Vec::new();
        self.entries.retain(|key, weak| {
            if R::is_expired(weak) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), remaining = self.entries.len(), "Purged weak cache");
        }
        for key in &expired {
            self.clean(key);
        }
    }

    /// Keys with live values. Purges first.
    pub fn keys(&mut self) -> Vec<K> {
        self.pairs().into_iter().map(|(key, _)| key).collect()
    }

    /// Live values. Purges first.
    pub fn values(&mut self) -> Vec<R> {
        self.pairs().into_iter().map(|(_, value)| value).collect()
    }

    /// Strong snapshot of every live entry, in key order. Purges first.
    pub fn pairs(&mut self) -> Vec<(K, R)> {
        self.purge();
        self.entries
            .iter()
            .filter_map(|(key, weak)| R::upgrade(weak).map(|value| (key.clone(), value)))
            .collect()
    }

    /// Map entries, expired ones included until the next purge.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values currently pinned by the strong ring.
    pub fn pinned(&self) -> usize {
        self.ring.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn note_access(&mut self) {
        self.accesses_since_purge += 1;
        if self.accesses_since_purge >= self.config.auto_purge_count
            && self.last_purge.elapsed() >= self.config.auto_purge_interval()
        {
            self.purge();
        }
    }

    /// Called after `key` left the ring. If that was the last strong
    /// reference the entry is gone for good.
    fn release(&mut self, key: &K) {
        let expired = self.entries.get(key).is_some_and(|weak| R::is_expired(weak));
        if expired {
            self.entries.remove(key);
            self.clean(key);
        }
    }

    fn clean(&mut self, key: &K) {
        if let Some(cleaner) = self.cleaner.as_mut() {
            cleaner(key);
            self.stats.cleaned += 1;
        }
    }
}

impl<K, R> Default for WeakIdentityCache<K, R>
where
    K: Ord + Clone + fmt::Debug,
    R: SharedRef,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, R: SharedRef> fmt::Debug for WeakIdentityCache<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakIdentityCache")
            .field("entries", &self.entries.len())
            .field("pinned", &self.ring.len())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct WeakIdentityCacheBuilder<K, R> {
    config: CacheConfig,
    creator: Option<Creator<K, R>>,
    cleaner: Option<Cleaner<K>>,
}

impl<K, R> WeakIdentityCacheBuilder<K, R>
where
    K: Ord + Clone + fmt::Debug,
    R: SharedRef,
{
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            creator: None,
            cleaner: None,
        }
    }

    /// Replace all tuning knobs at once.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn auto_purge_count(mut self, count: usize) -> Self {
        self.config.auto_purge_count = count;
        self
    }

    pub fn auto_purge_interval(mut self, interval: Duration) -> Self {
        self.config.auto_purge_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build values for keys that miss.
    pub fn creator(mut self, creator: impl FnMut(&K) -> R + 'static) -> Self {
        self.creator = Some(Box::new(creator));
        self
    }

    /// Called once for every entry whose value has been released.
    pub fn cleaner(mut self, cleaner: impl FnMut(&K) + 'static) -> Self {
        self.cleaner = Some(Box::new(cleaner));
        self
    }

    pub fn build(self) -> WeakIdentityCache<K, R> {
        let mut cache = WeakIdentityCache::with_config(self.config);
        cache.creator = self.creator;
        cache.cleaner = self.cleaner;
        cache
    }
}

impl<K, R> Default for WeakIdentityCacheBuilder<K, R>
where
    K: Ord + Clone + fmt::Debug,
    R: SharedRef,
{
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
