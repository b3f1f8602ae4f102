// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, time-expiring concurrent store with removal notifications.
//!
//! Entries are bounded three ways: a maximum entry count (least recently used
//! entries go first), a maximum age since the last write, and a concurrency
//! factor that splits the store into independently locked shards.
//!
//! Every removal is reported to the removal listener together with its
//! [`RemovalCause`]. Notifications are queued while a shard is locked and
//! delivered after the lock is released, so the listener runs eventually but
//! not synchronously with the mutation that caused it. Expired entries are
//! only reclaimed when they are touched or when [`TrackingCache::cleanup`]
//! runs; callers are expected to run `cleanup` periodically off the hot path.

use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hash};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_MAX_SIZE: u64 = 1000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);
const DEFAULT_CONCURRENCY: usize = 2;

// Rebuild the order queues once stale markers outnumber live entries by this much.
const COMPACTION_SLACK: usize = 32;

/// Why an entry left the cache.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemovalCause {
    /// Removed or overwritten at the caller's request.
    #[display("EXPLICIT")]
    Explicit,
    /// Older than the configured maximum age.
    #[display("EXPIRED")]
    Expired,
    /// Evicted to stay within the maximum entry count.
    #[display("SIZE")]
    Size,
    /// Removed because the whole cache was cleared.
    #[display("OTHER")]
    Other,
}

impl RemovalCause {
    /// True for removals the caller did not ask for.
    #[must_use]
    pub const fn was_evicted(self) -> bool {
        !matches!(self, RemovalCause::Explicit)
    }
}

/// A removed entry handed to the removal listener.
#[derive(Debug)]
pub struct RemovalNotification<K, V> {
    pub key: K,
    pub value: V,
    pub cause: RemovalCause,
}

type RemovalListener<K, V> = Box<dyn Fn(RemovalNotification<K, V>) + Send + Sync>;

/// Bounds of a [`TrackingCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries across all shards.
    pub max_size: u64,
    /// Maximum time an entry may live after its last write.
    pub max_age: Duration,
    /// Number of independently locked shards.
    pub concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_age: DEFAULT_MAX_AGE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

struct Slot<V> {
    value: V,
    written_at: Instant,
    write_stamp: u64,
    access_stamp: u64,
}

struct Shard<K, V> {
    slots: HashMap<K, Slot<V>, FnvBuildHasher>,
    // Both queues hold (key, stamp) markers; a marker is live only while the
    // slot for `key` still carries the same stamp.
    writes: VecDeque<(K, u64)>,
    accesses: VecDeque<(K, u64)>,
    tick: u64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_hasher(FnvBuildHasher::default()),
            writes: VecDeque::new(),
            accesses: VecDeque::new(),
            tick: 0,
            capacity,
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, key: K, value: V, now: Instant, removed: &mut Vec<RemovalNotification<K, V>>) {
        let stamp = self.next_stamp();
        let slot = Slot {
            value,
            written_at: now,
            write_stamp: stamp,
            access_stamp: stamp,
        };
        if let Some(old) = self.slots.insert(key.clone(), slot) {
            removed.push(RemovalNotification {
                key: key.clone(),
                value: old.value,
                cause: RemovalCause::Explicit,
            });
        }
        self.writes.push_back((key.clone(), stamp));
        self.accesses.push_back((key, stamp));
    }

    fn touch(&mut self, key: &K) {
        let stamp = self.next_stamp();
        if let Some(slot) = self.slots.get_mut(key) {
            slot.access_stamp = stamp;
            self.accesses.push_back((key.clone(), stamp));
        }
    }

    fn is_expired(slot: &Slot<V>, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(slot.written_at) >= max_age
    }

    /// Removes `key` if it has outlived `max_age`. Returns true if it did.
    fn expire_one(
        &mut self,
        key: &K,
        now: Instant,
        max_age: Duration,
        removed: &mut Vec<RemovalNotification<K, V>>,
    ) -> bool {
        let expired = self
            .slots
            .get(key)
            .is_some_and(|slot| Self::is_expired(slot, now, max_age));
        if expired {
            if let Some((key, slot)) = self.slots.remove_entry(key) {
                removed.push(RemovalNotification {
                    key,
                    value: slot.value,
                    cause: RemovalCause::Expired,
                });
            }
        }
        expired
    }

    fn expire(&mut self, now: Instant, max_age: Duration, removed: &mut Vec<RemovalNotification<K, V>>) {
        while let Some((key, stamp)) = self.writes.front().cloned() {
            let live = self
                .slots
                .get(&key)
                .is_some_and(|slot| slot.write_stamp == stamp);
            if live && !self.expire_one(&key, now, max_age, removed) {
                // Writes are queued in time order, nothing behind this one is older.
                break;
            }
            self.writes.pop_front();
        }
    }

    fn evict_to_capacity(&mut self, removed: &mut Vec<RemovalNotification<K, V>>) {
        while self.slots.len() > self.capacity {
            let Some((key, stamp)) = self.accesses.pop_front() else {
                break;
            };
            let live = self
                .slots
                .get(&key)
                .is_some_and(|slot| slot.access_stamp == stamp);
            if live {
                if let Some((key, slot)) = self.slots.remove_entry(&key) {
                    removed.push(RemovalNotification {
                        key,
                        value: slot.value,
                        cause: RemovalCause::Size,
                    });
                }
            }
        }
    }

    fn compact(&mut self) {
        let limit = self.slots.len() * 2 + COMPACTION_SLACK;
        if self.writes.len() > limit {
            let slots = &self.slots;
            self.writes
                .retain(|(key, stamp)| slots.get(key).is_some_and(|s| s.write_stamp == *stamp));
        }
        if self.accesses.len() > limit {
            let slots = &self.slots;
            self.accesses
                .retain(|(key, stamp)| slots.get(key).is_some_and(|s| s.access_stamp == *stamp));
        }
    }

    fn remove(&mut self, key: &K, cause: RemovalCause, removed: &mut Vec<RemovalNotification<K, V>>) -> bool {
        match self.slots.remove_entry(key) {
            Some((key, slot)) => {
                removed.push(RemovalNotification {
                    key,
                    value: slot.value,
                    cause,
                });
                true
            }
            None => false,
        }
    }
}

/// Bounded, time-expiring map from keys to tracked values.
pub struct TrackingCache<K, V> {
    shards: Box<[Mutex<Shard<K, V>>]>,
    hasher: FnvBuildHasher,
    max_age: Duration,
    pending: Mutex<VecDeque<RemovalNotification<K, V>>>,
    listener: Option<RemovalListener<K, V>>,
}

impl<K, V> TrackingCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a cache without a removal listener.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a cache that reports every removal to `listener`.
    #[must_use]
    pub fn with_removal_listener<F>(config: CacheConfig, listener: F) -> Self
    where
        F: Fn(RemovalNotification<K, V>) + Send + Sync + 'static,
    {
        Self::build(config, Some(Box::new(listener)))
    }

    fn build(config: CacheConfig, listener: Option<RemovalListener<K, V>>) -> Self {
        let max_size = usize::try_from(config.max_size).unwrap_or(usize::MAX);
        // Every shard must be able to hold at least one entry.
        let shard_count = config.concurrency.clamp(1, max_size.max(1));
        let (per_shard, remainder) = (max_size / shard_count, max_size % shard_count);

        info!(
            "Initializing tracking cache with max_size: {}, max_age_secs: {}, concurrency: {}",
            config.max_size,
            config.max_age.as_secs(),
            shard_count
        );

        let shards = (0..shard_count)
            .map(|index| Mutex::new(Shard::new(per_shard + usize::from(index < remainder))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: FnvBuildHasher::default(),
            max_age: config.max_age,
            pending: Mutex::new(VecDeque::new()),
            listener,
        }
    }

    fn shard_for(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Runs `f` with the locked shard owning `key`, then delivers any removals
    /// it produced.
    fn with_shard<R>(
        &self,
        key: &K,
        f: impl FnOnce(&mut Shard<K, V>, &mut Vec<RemovalNotification<K, V>>) -> R,
    ) -> R {
        let mut removed = Vec::new();
        let result = {
            #[allow(clippy::expect_used)]
            let mut shard = self.shard_for(key).lock().expect("lock poisoned");
            f(&mut *shard, &mut removed)
        };
        self.enqueue(removed);
        self.deliver();
        result
    }

    /// Inserts `value`, replacing (and explicitly removing) any previous value.
    pub fn put(&self, key: K, value: V) {
        let now = Instant::now();
        let max_age = self.max_age;
        self.with_shard(&key.clone(), |shard, removed| {
            shard.expire(now, max_age, removed);
            shard.insert(key, value, now, removed);
            shard.evict_to_capacity(removed);
            shard.compact();
        });
    }

    /// Returns a copy of the value for `key` unless absent or expired.
    pub fn get_if_present(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.update(key, |value| value.clone())
    }

    /// Runs `f` on the value for `key` in place, without renewing its age.
    ///
    /// Returns `None` if the key is absent or expired.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let now = Instant::now();
        let max_age = self.max_age;
        self.with_shard(key, |shard, removed| {
            if shard.expire_one(key, now, max_age, removed) {
                return None;
            }
            shard.touch(key);
            let result = shard.slots.get_mut(key).map(|slot| f(&mut slot.value));
            shard.compact();
            result
        })
    }

    /// Explicitly removes `key`. Returns true if an entry was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.with_shard(key, |shard, removed| {
            shard.remove(key, RemovalCause::Explicit, removed)
        })
    }

    /// Removes every entry, reporting each with [`RemovalCause::Other`].
    pub fn clear(&self) {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            #[allow(clippy::expect_used)]
            let mut shard = shard.lock().expect("lock poisoned");
            removed.extend(shard.slots.drain().map(|(key, slot)| RemovalNotification {
                key,
                value: slot.value,
                cause: RemovalCause::Other,
            }));
            shard.writes.clear();
            shard.accesses.clear();
        }
        self.enqueue(removed);
        self.deliver();
    }

    /// Sweeps expired entries out of every shard and delivers pending
    /// notifications.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            #[allow(clippy::expect_used)]
            let mut shard = shard.lock().expect("lock poisoned");
            shard.expire(now, self.max_age, &mut removed);
            shard.compact();
        }
        if !removed.is_empty() {
            debug!("Tracking cache cleanup removed {} expired entries", removed.len());
        }
        self.enqueue(removed);
        self.deliver();
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                #[allow(clippy::expect_used)]
                let shard = shard.lock().expect("lock poisoned");
                shard.slots.len()
            })
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue(&self, removed: Vec<RemovalNotification<K, V>>) {
        if removed.is_empty() || self.listener.is_none() {
            return;
        }
        #[allow(clippy::expect_used)]
        let mut pending = self.pending.lock().expect("lock poisoned");
        pending.extend(removed);
    }

    fn deliver(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            let next = {
                #[allow(clippy::expect_used)]
                let mut pending = self.pending.lock().expect("lock poisoned");
                pending.pop_front()
            };
            match next {
                Some(notification) => listener(notification),
                None => break,
            }
        }
    }
}
