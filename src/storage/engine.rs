//! Thread-Safe LRU Storage Engine
//!
//! This module implements the storage side of FlashCache: a bounded,
//! concurrent key-value map that evicts the least recently used entries
//! once its memory budget is exhausted.
//!
//! ## Design Decisions
//!
//! 1. **Capability Trait**: The network layer only sees the [`Storage`] trait,
//!    so any engine that synchronizes itself can be plugged in.
//! 2. **Sharded Locks**: Instead of one big lock, keys are spread across
//!    shards, each with its own mutex and its own share of the budget.
//! 3. **Byte Budget**: An entry costs `key.len() + value.len()` bytes.
//! 4. **Recency Clock**: Every access stamps the entry with a monotonically
//!    increasing tick; the entry with the lowest tick is evicted first.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LruStorage                            │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ Mutex   │ │ Mutex   │ │ Mutex   │ │ Mutex   │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  │ BTreeMap│ │ BTreeMap│ │ BTreeMap│ │ BTreeMap│           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `get` refreshes recency, so even reads need exclusive access to their
//! shard. Workers on different threads touching different shards never
//! contend.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of shards.
const NUM_SHARDS: usize = 16;

/// Default memory budget (64 MB, same as memcached's default).
pub const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

/// The key-value capability used by command execution.
///
/// Implementations must be safe to call concurrently from every worker
/// thread; the connection engine performs no locking of its own.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &Bytes) -> Option<Bytes>;

    /// Stores the value, replacing any previous one.
    ///
    /// Returns `false` if the entry can never fit into the storage.
    fn put(&self, key: Bytes, value: Bytes) -> bool;

    /// Stores the value only if the key is not present yet.
    fn put_if_absent(&self, key: Bytes, value: Bytes) -> bool;

    /// Replaces the value only if the key is already present.
    fn set(&self, key: Bytes, value: Bytes) -> bool;

    /// Removes the key. Returns `true` if it was present.
    fn delete(&self, key: &Bytes) -> bool;

    /// Returns the number of stored keys.
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the engine's counters.
    ///
    /// Engines without counters only report the key count.
    fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len() as u64,
            ..StorageStats::default()
        }
    }
}

/// A stored value with its recency stamp.
#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    tick: u64,
}

/// A single shard: the entries plus their recency order.
#[derive(Debug)]
struct Shard {
    entries: HashMap<Bytes, Slot>,
    /// Recency order: lowest tick is the least recently used key
    order: BTreeMap<u64, Bytes>,
    clock: u64,
    used: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
            used: 0,
            capacity,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &Bytes) -> Option<Bytes> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;

        let key = self.order.remove(&slot.tick)?;
        slot.tick = tick;
        self.order.insert(tick, key);

        Some(slot.value.clone())
    }

    fn contains(&self, key: &Bytes) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry, evicting as needed.
    ///
    /// Returns the number of evicted entries, or `None` if the entry is
    /// larger than the whole shard.
    fn insert(&mut self, key: Bytes, value: Bytes) -> Option<u64> {
        let size = key.len() + value.len();
        if size > self.capacity {
            return None;
        }

        self.remove(&key);

        let mut evicted = 0;
        while self.used + size > self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    if let Some(slot) = self.entries.remove(&oldest) {
                        self.used -= oldest.len() + slot.value.len();
                        evicted += 1;
                    }
                }
                None => break,
            }
        }

        let tick = self.next_tick();
        self.used += size;
        self.order.insert(tick, key.clone());
        self.entries.insert(key, Slot { value, tick });

        Some(evicted)
    }

    fn remove(&mut self, key: &Bytes) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                self.used -= key.len() + slot.value.len();
                true
            }
            None => false,
        }
    }
}

/// A sharded, memory-bounded LRU cache.
///
/// This struct is designed to be wrapped in an `Arc` and shared across
/// all workers. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use flashcache::storage::{LruStorage, Storage};
/// use bytes::Bytes;
///
/// let storage = LruStorage::new(1024 * 1024);
///
/// storage.put(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(storage.get(&Bytes::from("name")), Some(Bytes::from("Ariz")));
///
/// // add only succeeds for new keys
/// assert!(!storage.put_if_absent(Bytes::from("name"), Bytes::from("other")));
/// ```
pub struct LruStorage {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,

    /// Statistics: total get operations
    get_count: AtomicU64,

    /// Statistics: gets that found a value
    hit_count: AtomicU64,

    /// Statistics: total store operations
    set_count: AtomicU64,

    /// Statistics: total delete operations
    del_count: AtomicU64,

    /// Statistics: entries evicted to make room
    evicted_count: AtomicU64,
}

impl std::fmt::Debug for LruStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruStorage")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for LruStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LruStorage {
    /// Creates a storage with the given budget in bytes.
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, NUM_SHARDS)
    }

    /// Creates a storage with an explicit shard count.
    ///
    /// Each shard gets an equal share of the budget, so a single entry can
    /// never be larger than `capacity / shards`.
    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = capacity / shards;

        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::new(per_shard))).collect(),
            capacity,
            get_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
        }
    }

    /// Returns the total memory budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes currently used by keys and values.
    pub fn used(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).used).sum()
    }

    /// Determines which shard a key belongs to.
    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Locks the shard for a given key.
    #[inline]
    fn shard(&self, key: &[u8]) -> MutexGuard<'_, Shard> {
        lock(&self.shards[self.shard_index(key)])
    }

    fn record_insert(&self, outcome: Option<u64>) -> bool {
        match outcome {
            Some(evicted) => {
                if evicted > 0 {
                    self.evicted_count.fetch_add(evicted, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }
}

impl Storage for LruStorage {
    fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        let value = self.shard(key).get(key);
        if value.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn put(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let outcome = self.shard(&key).insert(key, value);
        self.record_insert(outcome)
    }

    fn put_if_absent(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shard(&key);
        if shard.contains(&key) {
            return false;
        }
        let outcome = shard.insert(key, value);
        drop(shard);
        self.record_insert(outcome)
    }

    fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shard(&key);
        if !shard.contains(&key) {
            return false;
        }
        let outcome = shard.insert(key, value);
        drop(shard);
        self.record_insert(outcome)
    }

    fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        self.shard(key).remove(key)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).entries.len()).sum()
    }

    fn stats(&self) -> StorageStats {
        let gets = self.get_count.load(Ordering::Relaxed);
        let hits = self.hit_count.load(Ordering::Relaxed);
        StorageStats {
            keys: self.len() as u64,
            bytes: self.used() as u64,
            capacity: self.capacity as u64,
            get_ops: gets,
            get_hits: hits,
            get_misses: gets.saturating_sub(hits),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            evictions: self.evicted_count.load(Ordering::Relaxed),
        }
    }
}

/// Locks a shard, ignoring poisoning: no shard operation can panic
/// between its map updates.
fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Bytes used by keys and values
    pub bytes: u64,
    /// Memory budget in bytes
    pub capacity: u64,
    /// Total get operations
    pub get_ops: u64,
    /// Gets that found a value
    pub get_hits: u64,
    /// Gets that found nothing
    pub get_misses: u64,
    /// Total store operations
    pub set_ops: u64,
    /// Total delete operations
    pub del_ops: u64,
    /// Entries evicted to make room for new ones
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_shard(capacity: usize) -> LruStorage {
        LruStorage::with_shards(capacity, 1)
    }

    #[test]
    fn test_put_and_get() {
        let storage = LruStorage::new(1024 * 1024);

        assert!(storage.put(Bytes::from("key"), Bytes::from("value")));
        assert_eq!(storage.get(&Bytes::from("key")), Some(Bytes::from("value")));
    }

    #[test]
    fn test_get_nonexistent() {
        let storage = LruStorage::new(1024);
        assert_eq!(storage.get(&Bytes::from("nonexistent")), None);
    }

    #[test]
    fn test_put_overwrites() {
        let storage = single_shard(1024);

        storage.put(Bytes::from("key"), Bytes::from("one"));
        storage.put(Bytes::from("key"), Bytes::from("three"));

        assert_eq!(storage.get(&Bytes::from("key")), Some(Bytes::from("three")));
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.used(), 8);
    }

    #[test]
    fn test_put_if_absent() {
        let storage = LruStorage::new(1024 * 1024);

        assert!(storage.put_if_absent(Bytes::from("key"), Bytes::from("first")));
        assert!(!storage.put_if_absent(Bytes::from("key"), Bytes::from("second")));
        assert_eq!(storage.get(&Bytes::from("key")), Some(Bytes::from("first")));
    }

    #[test]
    fn test_set_requires_existing_key() {
        let storage = LruStorage::new(1024 * 1024);

        assert!(!storage.set(Bytes::from("key"), Bytes::from("value")));
        assert_eq!(storage.get(&Bytes::from("key")), None);

        storage.put(Bytes::from("key"), Bytes::from("value"));
        assert!(storage.set(Bytes::from("key"), Bytes::from("updated")));
        assert_eq!(storage.get(&Bytes::from("key")), Some(Bytes::from("updated")));
    }

    #[test]
    fn test_delete() {
        let storage = LruStorage::new(1024 * 1024);

        storage.put(Bytes::from("key"), Bytes::from("value"));
        assert!(storage.delete(&Bytes::from("key")));
        assert_eq!(storage.get(&Bytes::from("key")), None);
        assert!(!storage.delete(&Bytes::from("key"))); // Already deleted
        assert!(storage.is_empty());
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let storage = single_shard(8);

        assert!(!storage.put(Bytes::from("key"), Bytes::from("too long")));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        // Every entry costs 2 bytes, room for three of them
        let storage = single_shard(6);

        storage.put(Bytes::from("a"), Bytes::from("1"));
        storage.put(Bytes::from("b"), Bytes::from("2"));
        storage.put(Bytes::from("c"), Bytes::from("3"));

        // Touch "a" so that "b" becomes the oldest entry
        assert!(storage.get(&Bytes::from("a")).is_some());

        storage.put(Bytes::from("d"), Bytes::from("4"));

        assert_eq!(storage.get(&Bytes::from("b")), None);
        assert!(storage.get(&Bytes::from("a")).is_some());
        assert!(storage.get(&Bytes::from("c")).is_some());
        assert!(storage.get(&Bytes::from("d")).is_some());
        assert_eq!(storage.stats().evictions, 1);
        assert_eq!(storage.used(), 6);
    }

    #[test]
    fn test_large_entry_evicts_several() {
        let storage = single_shard(10);

        storage.put(Bytes::from("a"), Bytes::from("1"));
        storage.put(Bytes::from("b"), Bytes::from("2"));
        storage.put(Bytes::from("c"), Bytes::from("3"));
        storage.put(Bytes::from("big"), Bytes::from("12345"));

        assert_eq!(storage.get(&Bytes::from("big")), Some(Bytes::from("12345")));
        assert_eq!(storage.get(&Bytes::from("a")), None);
        assert_eq!(storage.get(&Bytes::from("b")), None);
        assert!(storage.get(&Bytes::from("c")).is_some());
    }

    #[test]
    fn test_stats() {
        let storage = LruStorage::new(1024 * 1024);

        storage.put(Bytes::from("key"), Bytes::from("value"));
        storage.get(&Bytes::from("key"));
        storage.get(&Bytes::from("missing"));
        storage.delete(&Bytes::from("key"));

        let stats = storage.stats();
        assert_eq!(stats.get_ops, 2);
        assert_eq!(stats.get_hits, 1);
        assert_eq!(stats.get_misses, 1);
        assert_eq!(stats.set_ops, 1);
        assert_eq!(stats.del_ops, 1);
        assert_eq!(stats.keys, 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let storage = Arc::new(LruStorage::new(16 * 1024 * 1024));
        let mut handles = vec![];

        // Spawn multiple writers
        for i in 0..10 {
            let storage = Arc::clone(&storage);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = format!("key-{}-{}", i, j);
                    storage.put(Bytes::from(key.clone()), Bytes::from("value"));
                    storage.get(&Bytes::from(key));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.len(), 1000);
    }
}
