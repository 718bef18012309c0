// Persistence Tests
// Reopening a cache directory, size accounting modes and foreign files

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;
use tierlru::cache::filename_for;
use tierlru::{CacheConfig, TieredCache};

/// Surface warn-level cache logs in test output (`RUST_LOG=tierlru=debug` for more)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config(dir: &Path, exclusive: bool) -> CacheConfig {
    CacheConfig::new(dir)
        .with_memory_count_limit(4)
        .with_disk_size_limit(2048)
        .with_exclusive_disk_owner(exclusive)
}

/// Same operation sequence for both accounting modes
fn run_workload(cache: &TieredCache<String, Vec<u8>>) {
    for i in 0..30usize {
        let _ = cache.set(format!("item-{}", i), vec![i as u8; 40 + i * 7]);
        if i % 4 == 0 {
            cache.get(&format!("item-{}", i / 2));
        }
        if i % 9 == 0 {
            cache.remove(&format!("item-{}", i / 3));
        }
    }
    // Overwrite with a different size.
    let _ = cache.set("item-29".to_string(), vec![0u8; 5]);
}

#[test]
fn test_exclusive_and_shared_accounting_agree() {
    let exclusive_dir = tempdir().unwrap();
    let shared_dir = tempdir().unwrap();

    let exclusive: TieredCache<String, Vec<u8>> =
        TieredCache::open(config(exclusive_dir.path(), true)).unwrap();
    let shared: TieredCache<String, Vec<u8>> =
        TieredCache::open(config(shared_dir.path(), false)).unwrap();

    run_workload(&exclusive);
    run_workload(&shared);

    assert_eq!(
        exclusive.total_disk_size().unwrap(),
        shared.total_disk_size().unwrap()
    );
    assert_eq!(exclusive.keys_by_recency(), shared.keys_by_recency());
    exclusive.check_invariants().unwrap();
    shared.check_invariants().unwrap();
}

#[test]
fn test_reopen_recovers_disk_entries() {
    let dir = tempdir().unwrap();
    {
        let cache: TieredCache<String, String> =
            TieredCache::open(config(dir.path(), true)).unwrap();
        let _ = cache.set("alpha".to_string(), "1".to_string());
        let _ = cache.set("beta".to_string(), "2".to_string());
    }

    let cache: TieredCache<String, String> = TieredCache::open(config(dir.path(), true)).unwrap();
    assert_eq!(cache.count_in_memory(), 0);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&"alpha".to_string()), Some("1".to_string()));
    assert_eq!(cache.get(&"beta".to_string()), Some("2".to_string()));
    cache.check_invariants().unwrap();
}

/// Pins an entry file's mtime so recovery order does not depend on timestamp granularity
fn set_entry_mtime(dir: &Path, key: &str, modified: SystemTime) {
    let path = dir.join(filename_for(&key.to_string()).unwrap());
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(modified).unwrap();
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn test_reopen_restores_recency_order() {
    let dir = tempdir().unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    {
        let cache: TieredCache<String, String> =
            TieredCache::open(config(dir.path(), true)).unwrap();
        for (i, key) in ["c", "a", "b"].iter().enumerate() {
            let _ = cache.set(key.to_string(), key.to_uppercase());
            set_entry_mtime(dir.path(), key, base + Duration::from_secs(10 * i as u64));
        }
    }

    let cache: TieredCache<String, String> = TieredCache::open(config(dir.path(), true)).unwrap();
    assert_eq!(cache.keys_by_recency(), keys(&["c", "a", "b"]));
    cache.check_invariants().unwrap();
}

#[test]
fn test_disk_read_moves_entry_to_front_after_reopen() {
    let dir = tempdir().unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    {
        let cache: TieredCache<String, String> =
            TieredCache::open(config(dir.path(), true)).unwrap();
        for (i, key) in ["A", "B", "C"].iter().enumerate() {
            let _ = cache.set(key.to_string(), key.to_lowercase());
            set_entry_mtime(dir.path(), key, base + Duration::from_secs(10 * i as u64));
        }
        cache.clear_memory();
        assert_eq!(cache.get(&"A".to_string()), Some("a".to_string()));
        assert_eq!(cache.stats().disk_hits, 1);
    }

    let cache: TieredCache<String, String> = TieredCache::open(config(dir.path(), true)).unwrap();
    assert_eq!(cache.keys_by_recency(), keys(&["B", "C", "A"]));
    cache.check_invariants().unwrap();
}

#[test]
fn test_reopen_order_ignores_memory_hits() {
    let dir = tempdir().unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    {
        let cache: TieredCache<String, String> =
            TieredCache::open(config(dir.path(), true)).unwrap();
        for (i, key) in ["A", "B", "C"].iter().enumerate() {
            let _ = cache.set(key.to_string(), key.to_lowercase());
            set_entry_mtime(dir.path(), key, base + Duration::from_secs(10 * i as u64));
        }
        // Served from memory: the file is not touched.
        assert_eq!(cache.get(&"A".to_string()), Some("a".to_string()));
        assert_eq!(cache.stats().memory_hits, 1);
        assert_eq!(cache.keys_by_recency(), keys(&["B", "C", "A"]));
    }

    let cache: TieredCache<String, String> = TieredCache::open(config(dir.path(), true)).unwrap();
    assert_eq!(cache.keys_by_recency(), keys(&["A", "B", "C"]));
}

#[test]
fn test_reopen_with_smaller_disk_limit_evicts() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let cache: TieredCache<String, Vec<u8>> =
            TieredCache::open(CacheConfig::new(dir.path()).with_exclusive_disk_owner(true))
                .unwrap();
        for i in 0..10 {
            let _ = cache.set(format!("k{}", i), vec![0u8; 100]);
        }
    }

    let cache: TieredCache<String, Vec<u8>> = TieredCache::open(
        CacheConfig::new(dir.path())
            .with_exclusive_disk_owner(true)
            .with_disk_size_limit(500),
    )
    .unwrap();
    assert!(cache.total_disk_size().unwrap() <= 500);
    assert!(cache.count_on_disk() < 10);
    cache.check_invariants().unwrap();
}

#[test]
fn test_foreign_files_are_left_alone() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
    fs::create_dir(dir.path().join("nested")).unwrap();

    let cache: TieredCache<String, String> =
        TieredCache::open(CacheConfig::new(dir.path())).unwrap();
    let size = cache
        .set("k".to_string(), "v".to_string())
        .persisted
        .unwrap();
    assert_eq!(cache.total_disk_size().unwrap(), size);

    cache.clear_disk().unwrap();
    assert_eq!(cache.total_disk_size().unwrap(), 0);
    assert!(dir.path().join("notes.txt").exists());
    assert!(dir.path().join("nested").is_dir());
}

#[test]
fn test_directory_created_on_open() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("a").join("b").join("cache");
    let cache: TieredCache<String, String> =
        TieredCache::open(CacheConfig::new(&nested)).unwrap();
    assert!(nested.is_dir());
    assert_eq!(cache.storage_directory(), nested.as_path());
}

#[test]
fn test_unwritable_directory_degrades_to_memory() {
    init_logging();
    let dir = tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let cache: TieredCache<String, String> =
        TieredCache::open(CacheConfig::new(&cache_dir).with_memory_count_limit(2)).unwrap();
    let _ = cache.set("before".to_string(), "on disk".to_string());

    // Pull the directory out from under the cache.
    fs::remove_dir_all(&cache_dir).unwrap();

    let report = cache.set("after".to_string(), "memory only".to_string());
    assert!(!report.is_persisted());
    assert!(matches!(report.persisted, Err(tierlru::CacheError::Io { .. })));
    assert_eq!(cache.get(&"after".to_string()), Some("memory only".to_string()));
    assert_eq!(cache.stats().disk_write_failures, 1);
}

#[test]
fn test_failed_write_drops_stale_disk_copy() {
    init_logging();
    let dir = tempdir().unwrap();
    let cache: TieredCache<String, String> =
        TieredCache::open(CacheConfig::new(dir.path()).with_memory_count_limit(1)).unwrap();
    let _ = cache.set("k".to_string(), "old".to_string());

    // Staging fails while the directory is missing.
    fs::remove_dir_all(dir.path()).unwrap();
    let report = cache.set("k".to_string(), "new".to_string());
    assert!(!report.is_persisted());
    fs::create_dir_all(dir.path()).unwrap();

    let _ = cache.set("other".to_string(), "x".to_string());
    // "k" left memory; the old disk copy must not come back.
    assert_eq!(cache.get(&"k".to_string()), None);
}
