use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::disk::{DiskLayout, DiskStore};
use super::memory::MemoryStore;
use super::recency::RecencyQueue;
use crate::codec::{BincodeCodec, Codec};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::pressure::PressureHandler;

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_evictions: u64,
    pub disk_evictions: u64,
    pub disk_write_failures: u64,
    pub pressure_signals: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.disk_hits
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// Outcome of [`TieredCache::set`].
///
/// The value is always usable from memory once `set` returns; `persisted`
/// says whether it also reached disk.
#[must_use]
#[derive(Debug)]
pub struct SetReport {
    /// Size in bytes of the entry file, or why it is not on disk
    pub persisted: Result<u64>,
    pub evicted_from_memory: usize,
    pub evicted_from_disk: usize,
}

impl SetReport {
    pub fn is_persisted(&self) -> bool {
        self.persisted.is_ok()
    }
}

/// State guarded by the cache lock
struct Inner<K, V> {
    memory: MemoryStore<K, V>,
    disk: DiskStore<K>,
    /// Union of both tiers in access order
    queue: RecencyQueue<K>,
    /// Memory residents only, in the same relative order as `queue`
    memory_order: RecencyQueue<K>,
    /// Disk residents only, in the same relative order as `queue`
    disk_order: RecencyQueue<K>,
    /// Current memory limit; starts at the configured one, shrinks under pressure
    memory_limit: usize,
    stats: CacheStats,
}

impl<K, V> Inner<K, V>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
{
    /// Marks `key` as just used, in the shared order and in each tier holding it
    fn touch(&mut self, key: &K) {
        self.queue.touch(key);
        if self.memory.contains(key) {
            self.memory_order.touch(key);
        }
        if self.disk.contains(key) {
            self.disk_order.touch(key);
        }
    }

    /// Drops `key` from the queue once neither tier holds it
    fn release_if_untracked(&mut self, key: &K) {
        if !self.memory.contains(key) && !self.disk.contains(key) {
            self.queue.remove(key);
        }
    }

    /// Deletes `key`'s disk entry, leaving any memory copy in place
    fn drop_from_disk(&mut self, key: &K) -> Result<bool> {
        self.disk_order.remove(key);
        let removed = self.disk.remove(key);
        self.release_if_untracked(key);
        removed
    }

    fn evict_memory_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.memory.exceeds(self.memory_limit) {
            let victim = match self.memory_order.evict_candidate() {
                Ok(key) => key,
                Err(e) => {
                    error!(
                        "{} while evicting from memory ({} resident)",
                        e,
                        self.memory.count()
                    );
                    debug_assert!(false, "memory-resident keys missing from memory order");
                    break;
                }
            };

            self.memory.remove(&victim);
            self.release_if_untracked(&victim);
            self.stats.memory_evictions += 1;
            evicted += 1;
            debug!("Memory EVICT (limit {})", self.memory_limit);
        }
        evicted
    }

    fn evict_disk_overflow(&mut self, limit: u64) -> usize {
        if limit == 0 {
            return 0;
        }

        let mut total = match self.disk.total_size() {
            Ok(total) => total,
            Err(e) => {
                warn!("Cannot size disk tier, skipping disk eviction: {}", e);
                return 0;
            }
        };

        let mut evicted = 0;
        while total > limit {
            let victim = match self.disk_order.evict_candidate() {
                Ok(key) => key,
                Err(_) if self.disk.count() == 0 => {
                    warn!(
                        "Disk tier at {} bytes over limit {} with no entries of ours left",
                        total, limit
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        "{} while evicting from disk ({} entries)",
                        e,
                        self.disk.count()
                    );
                    debug_assert!(false, "disk-resident keys missing from disk order");
                    break;
                }
            };

            let size = self.disk.entry_size(&victim).unwrap_or(0);
            if let Err(e) = self.disk.remove(&victim) {
                warn!("Disk eviction could not delete file: {}", e);
            }
            total = total.saturating_sub(size);
            self.release_if_untracked(&victim);
            self.stats.disk_evictions += 1;
            evicted += 1;
            debug!("Disk EVICT ({} bytes, {} now)", size, total);
        }
        evicted
    }

    fn clear_memory(&mut self) {
        let count = self.memory.count();
        self.memory.clear();
        self.memory_order.clear();
        let disk = &self.disk;
        self.queue.retain(|key| disk.contains(key));
        debug!("Memory CLEAR ({} entries)", count);
    }
}

/// Two-tier LRU cache.
///
/// Values live in a count-bounded memory tier and a byte-bounded disk tier.
/// Both tiers share a single recency order: each evicts its own least
/// recently used resident when over its limit, and an entry evicted from
/// one tier stays in the other.
///
/// All state sits behind one lock, so every public operation is atomic with
/// respect to the others. `set` encodes and writes its temp file before
/// taking the lock.
pub struct TieredCache<K, V, C = BincodeCodec> {
    config: CacheConfig,
    codec: C,
    layout: Arc<DiskLayout>,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TieredCache<K, V, BincodeCodec>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open a cache with the default (bincode) codec
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<K, V, C> TieredCache<K, V, C>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
    V: Serialize + DeserializeOwned + Clone,
    C: Codec,
{
    /// Open a cache over `config.storage_directory`, recovering whatever
    /// entries a previous instance left there.
    ///
    /// Recovered keys enter the recency order oldest first by file mtime,
    /// which only writes and disk reads refresh; memory hits from the
    /// previous session are not reflected. If they exceed the disk limit,
    /// the oldest are evicted before this returns.
    pub fn with_codec(config: CacheConfig, codec: C) -> Result<Self> {
        config.validate()?;

        let layout = Arc::new(DiskLayout::new(&config.storage_directory));
        let (disk, recovered) = DiskStore::open(layout.clone(), config.exclusive_disk_owner)?;

        let mut queue = RecencyQueue::new();
        let mut disk_order = RecencyQueue::new();
        for key in &recovered {
            queue.touch(key);
            disk_order.touch(key);
        }

        let mut inner = Inner {
            memory: MemoryStore::new(),
            disk,
            queue,
            memory_order: RecencyQueue::new(),
            disk_order,
            memory_limit: config.memory_count_limit,
            stats: CacheStats::default(),
        };
        let evicted = inner.evict_disk_overflow(config.disk_size_limit);

        info!(
            "Opened tiered cache at {:?}: {} recovered, {} evicted (memory limit {}, disk limit {} bytes, exclusive {})",
            config.storage_directory,
            recovered.len(),
            evicted,
            config.memory_count_limit,
            config.disk_size_limit,
            config.exclusive_disk_owner
        );

        Ok(Self {
            config,
            codec,
            layout,
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage_directory(&self) -> &Path {
        self.layout.directory()
    }

    /// Look up `key`, memory first, then disk.
    ///
    /// A disk hit is loaded back into memory. Unreadable disk entries count
    /// as misses; corrupt ones are deleted.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();

        if let Some(value) = inner.memory.get(key).cloned() {
            inner.touch(key);
            inner.stats.memory_hits += 1;
            debug!("Memory HIT");
            return Some(value);
        }

        if !inner.disk.contains(key) {
            inner.stats.misses += 1;
            debug!("Cache MISS");
            return None;
        }

        let loaded = inner
            .disk
            .read(key)
            .and_then(|bytes| bytes.map(|b| self.codec.decode::<V>(&b)).transpose());

        match loaded {
            Ok(Some(value)) => {
                inner.memory.put(key.clone(), value.clone());
                inner.touch(key);
                inner.evict_memory_overflow();
                inner.stats.disk_hits += 1;
                debug!("Disk HIT");
                Some(value)
            }
            Ok(None) => {
                inner.disk_order.remove(key);
                inner.release_if_untracked(key);
                inner.stats.misses += 1;
                None
            }
            Err(e) => {
                if e.is_corruption() {
                    warn!("Removing corrupt cache entry: {}", e);
                    if let Err(remove_err) = inner.drop_from_disk(key) {
                        warn!("Failed to remove corrupt entry: {}", remove_err);
                    }
                } else {
                    warn!("Disk read failed, treating as miss: {}", e);
                }
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store `value` under `key` in both tiers, then evict whatever the
    /// limits no longer allow.
    ///
    /// Encode or disk failures leave the value memory-only and are reported
    /// in [`SetReport::persisted`]; any older disk copy of `key` is removed
    /// so it cannot resurface later. An entry that had to leave disk again
    /// to bring the tier back under its limit is reported as
    /// [`CacheError::ExceedsDiskLimit`].
    pub fn set(&self, key: K, value: V) -> SetReport {
        let staged = self
            .codec
            .encode(&value)
            .and_then(|payload| self.layout.stage(&key, &payload));

        let mut inner = self.inner.lock();

        inner.memory.put(key.clone(), value);
        let persisted = match staged {
            Ok(staged) => inner.disk.commit(key.clone(), staged),
            Err(e) => Err(e),
        };

        if let Err(e) = &persisted {
            inner.stats.disk_write_failures += 1;
            warn!("Value kept in memory only, disk write failed: {}", e);
            if let Err(remove_err) = inner.drop_from_disk(&key) {
                warn!("Failed to remove stale disk entry: {}", remove_err);
            }
        }
        inner.touch(&key);

        let evicted_from_memory = inner.evict_memory_overflow();
        let evicted_from_disk = inner.evict_disk_overflow(self.config.disk_size_limit);

        let persisted = match persisted {
            Ok(size) if !inner.disk.contains(&key) => {
                debug!("Entry of {} bytes evicted from disk on write", size);
                Err(CacheError::ExceedsDiskLimit {
                    size,
                    limit: self.config.disk_size_limit,
                })
            }
            other => other,
        };

        SetReport {
            persisted,
            evicted_from_memory,
            evicted_from_disk,
        }
    }

    /// Remove `key` from both tiers. Returns `true` if it was cached.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let in_memory = inner.memory.remove(key).is_some();
        inner.memory_order.remove(key);
        inner.disk_order.remove(key);
        let on_disk = match inner.disk.remove(key) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to delete cache file: {}", e);
                true
            }
        };
        inner.queue.remove(key);
        in_memory || on_disk
    }

    /// Whether either tier holds `key`. Does not affect recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().queue.contains(key)
    }

    /// Number of distinct keys held across both tiers
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_in_memory(&self) -> usize {
        self.inner.lock().memory.count()
    }

    pub fn count_on_disk(&self) -> usize {
        self.inner.lock().disk.count()
    }

    /// Bytes used by the disk tier. Scans the directory unless the cache is
    /// the exclusive owner.
    pub fn total_disk_size(&self) -> Result<u64> {
        self.inner.lock().disk.total_size()
    }

    /// Current memory limit, possibly reduced by pressure signals
    pub fn memory_count_limit(&self) -> usize {
        self.inner.lock().memory_limit
    }

    /// Restore the configured memory limit after pressure shrinking
    pub fn reset_memory_count_limit(&self) {
        let mut inner = self.inner.lock();
        inner.memory_limit = self.config.memory_count_limit;
        info!("Memory limit reset to {}", inner.memory_limit);
    }

    /// Drop every value from memory. Keys still on disk keep their place in
    /// the recency order.
    pub fn clear_memory(&self) {
        self.inner.lock().clear_memory();
    }

    /// Delete every entry file. Keys still in memory keep their place in
    /// the recency order, as do entries whose file could not be deleted.
    pub fn clear_disk(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let count = inner.disk.count();
        let result = inner.disk.clear_all();

        let Inner {
            memory,
            disk,
            queue,
            disk_order,
            ..
        } = &mut *inner;
        disk_order.retain(|key| disk.contains(key));
        queue.retain(|key| memory.contains(key) || disk.contains(key));
        debug!("Disk CLEAR ({} of {} entries left)", disk.count(), count);
        result
    }

    /// React to host memory pressure: optionally clear the memory tier,
    /// optionally shrink its limit. Shrinks compound across signals and
    /// persist until [`reset_memory_count_limit`](Self::reset_memory_count_limit).
    pub fn on_low_memory_signal(&self) {
        let mut inner = self.inner.lock();
        inner.stats.pressure_signals += 1;

        if self.config.clear_on_pressure {
            inner.clear_memory();
        }

        if self.config.shrink_on_pressure && inner.memory_limit > 0 {
            let previous = inner.memory_limit;
            inner.memory_limit = self.config.shrunk_limit(previous);
            let evicted = inner.evict_memory_overflow();
            info!(
                "Low memory: memory limit {} -> {} ({} evicted)",
                previous, inner.memory_limit, evicted
            );
        } else {
            info!("Low memory signal handled");
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Verify the cross-tier invariants:
    /// - the recency queue holds exactly the union of both tiers
    /// - each tier's own order is the shared order restricted to that tier
    /// - neither tier is over its limit
    /// - an exclusive owner's running counter matches a directory scan
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) -> std::result::Result<(), crate::error::InvariantError> {
        use crate::error::InvariantError;

        let inner = self.inner.lock();
        inner.queue.debug_validate_invariants();
        inner.memory_order.debug_validate_invariants();
        inner.disk_order.debug_validate_invariants();

        for key in inner.queue.iter() {
            if !inner.memory.contains(key) && !inner.disk.contains(key) {
                return Err(InvariantError::new("queued key resident in neither tier"));
            }
        }
        if inner.memory.keys().any(|key| !inner.queue.contains(key)) {
            return Err(InvariantError::new("memory key missing from queue"));
        }
        if inner.disk.keys().any(|key| !inner.queue.contains(key)) {
            return Err(InvariantError::new("disk key missing from queue"));
        }

        let memory_view = inner.queue.iter().filter(|key| inner.memory.contains(key));
        if !inner.memory_order.iter().eq(memory_view) {
            return Err(InvariantError::new("memory order diverges from shared order"));
        }
        let disk_view = inner.queue.iter().filter(|key| inner.disk.contains(key));
        if !inner.disk_order.iter().eq(disk_view) {
            return Err(InvariantError::new("disk order diverges from shared order"));
        }

        if inner.memory.exceeds(inner.memory_limit) {
            return Err(InvariantError::new(format!(
                "memory holds {} items, limit {}",
                inner.memory.count(),
                inner.memory_limit
            )));
        }
        let limit = self.config.disk_size_limit;
        if limit > 0 && inner.disk.tracked_size() > limit {
            return Err(InvariantError::new(format!(
                "disk holds {} bytes, limit {}",
                inner.disk.tracked_size(),
                limit
            )));
        }

        if inner.disk.is_exclusive() {
            let scanned = inner
                .disk
                .scan_size()
                .map_err(|e| InvariantError::new(format!("scan failed: {}", e)))?;
            if scanned != inner.disk.tracked_size() {
                return Err(InvariantError::new(format!(
                    "exclusive counter {} disagrees with scan {}",
                    inner.disk.tracked_size(),
                    scanned
                )));
            }
        }

        Ok(())
    }
}

impl<K, V, C> PressureHandler for TieredCache<K, V, C>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone + Send,
    V: Serialize + DeserializeOwned + Clone + Send,
    C: Codec,
{
    fn on_low_memory(&self) {
        self.on_low_memory_signal();
    }
}
