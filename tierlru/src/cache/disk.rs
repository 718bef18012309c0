//! Disk Store
//!
//! One file per key inside a dedicated directory:
//!
//! ```text
//!   <dir>/<sha256(canonical key)>.entry        committed entry
//!   <dir>/<sha256(canonical key)>.<pid>-<n>.tmp staged write, renamed on commit
//! ```
//!
//! The canonical key is the key's compact JSON encoding. Each entry file
//! starts with a small envelope so the key can be recovered on reopen:
//!
//! ```text
//!   "TLRU" | version u8 | key_len u32 LE | key bytes | payload
//! ```
//!
//! Files that do not match the naming scheme are never read, counted or
//! deleted.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

const ENVELOPE_MAGIC: &[u8; 4] = b"TLRU";
const ENVELOPE_VERSION: u8 = 1;
const ENVELOPE_HEADER_LEN: usize = 4 + 1 + 4;
const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";
const HASH_HEX_LEN: usize = 64;

/// Process-wide so two stores sharing a directory never pick the same temp name
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Canonical string form of a key, the input to [`filename_for`]
pub fn canonical_key<K: Serialize>(key: &K) -> Result<String> {
    serde_json::to_string(key).map_err(|e| CacheError::Encode(format!("key: {}", e)))
}

/// File name for an already canonicalized key
pub fn filename_for_canonical(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{}.{}", hex::encode(hasher.finalize()), ENTRY_EXTENSION)
}

/// Deterministic, path-safe file name for `key`
pub fn filename_for<K: Serialize>(key: &K) -> Result<String> {
    Ok(filename_for_canonical(&canonical_key(key)?))
}

fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// `<64 hex>.entry`
pub fn is_entry_file_name(name: &str) -> bool {
    name.strip_suffix(ENTRY_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
        .is_some_and(is_hash_hex)
}

/// `<64 hex>.<pid>-<seq>.tmp`
fn is_temp_file_name(name: &str) -> bool {
    let Some(rest) = name
        .strip_suffix(TEMP_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    match rest.split_once('.') {
        Some((hash, seq)) => {
            is_hash_hex(hash)
                && seq
                    .split_once('-')
                    .is_some_and(|(pid, n)| is_digits(pid) && is_digits(n))
        }
        None => false,
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn encode_envelope(canonical: &str, payload: &[u8]) -> Vec<u8> {
    let key_bytes = canonical.as_bytes();
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + key_bytes.len() + payload.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(key_bytes);
    out.extend_from_slice(payload);
    out
}

fn parse_header(header: &[u8; ENVELOPE_HEADER_LEN]) -> Result<usize> {
    if &header[..4] != ENVELOPE_MAGIC {
        return Err(CacheError::Decode("bad envelope magic".to_string()));
    }
    if header[4] != ENVELOPE_VERSION {
        return Err(CacheError::Decode(format!(
            "unsupported envelope version {}",
            header[4]
        )));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[5..9]);
    Ok(u32::from_le_bytes(len) as usize)
}

/// Splits an entry file into (canonical key, payload)
fn decode_envelope(bytes: &[u8]) -> Result<(&str, &[u8])> {
    let header: &[u8; ENVELOPE_HEADER_LEN] = bytes
        .get(..ENVELOPE_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| CacheError::Decode("truncated envelope header".to_string()))?;
    let key_len = parse_header(header)?;
    let key_end = ENVELOPE_HEADER_LEN + key_len;
    let key_bytes = bytes
        .get(ENVELOPE_HEADER_LEN..key_end)
        .ok_or_else(|| CacheError::Decode("truncated envelope key".to_string()))?;
    let key = std::str::from_utf8(key_bytes)
        .map_err(|e| CacheError::Decode(format!("envelope key: {}", e)))?;
    Ok((key, &bytes[key_end..]))
}

/// Reads just the canonical key from an entry file
fn read_envelope_key(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CacheError::Decode("truncated envelope header".to_string()),
        _ => CacheError::io(path, e),
    })?;
    let key_len = parse_header(&header)?;
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CacheError::Decode("truncated envelope key".to_string()),
        _ => CacheError::io(path, e),
    })?;
    String::from_utf8(key).map_err(|e| CacheError::Decode(format!("envelope key: {}", e)))
}

/// Directory layout shared between the locked store and lock-free staging
#[derive(Debug)]
pub struct DiskLayout {
    directory: PathBuf,
}

impl DiskLayout {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn entry_path(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    /// Writes the envelope for `key` to a fresh temp file and syncs it.
    ///
    /// Touches no store state, so it can run without holding the cache lock.
    pub fn stage<K: Serialize>(&self, key: &K, payload: &[u8]) -> Result<StagedWrite> {
        let canonical = canonical_key(key)?;
        let file_name = filename_for_canonical(&canonical);
        let stem = &file_name[..HASH_HEX_LEN];
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .directory
            .join(format!("{}.{}-{}.{}", stem, std::process::id(), seq, TEMP_EXTENSION));

        let bytes = encode_envelope(&canonical, payload);
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            });

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(CacheError::io(&temp_path, e));
        }

        Ok(StagedWrite {
            temp_path,
            file_name,
            size: bytes.len() as u64,
        })
    }
}

/// A fully written temp file waiting to be renamed into place
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    file_name: String,
    size: u64,
}

impl StagedWrite {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Deletes the temp file without committing it
    pub fn discard(self) {
        if let Err(e) = fs::remove_file(&self.temp_path) {
            warn!("Failed to discard staged write {:?}: {}", self.temp_path, e);
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    file_name: String,
    size: u64,
}

/// Disk tier: key → entry file, plus the running byte total
pub struct DiskStore<K> {
    layout: Arc<DiskLayout>,
    exclusive: bool,
    entries: HashMap<K, DiskEntry>,
    disk_size: u64,
}

impl<K> DiskStore<K>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
{
    /// Opens (creating if needed) the store directory and indexes the
    /// entries already in it.
    ///
    /// Returns the recovered keys oldest first by modification time. Only
    /// writes and disk reads refresh a file's mtime, so a key served from
    /// memory since it was last written or read from disk is recovered at
    /// that older position.
    /// Entry files whose envelope is unreadable or does not hash back to
    /// their own name are deleted. Leftover temp files are deleted too, but
    /// only by an exclusive owner; a shared directory may hold another
    /// writer's in-flight temp file.
    pub fn open(layout: Arc<DiskLayout>, exclusive: bool) -> Result<(Self, Vec<K>)> {
        let directory = layout.directory().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| CacheError::io(&directory, e))?;

        let mut store = Self {
            layout,
            exclusive,
            entries: HashMap::new(),
            disk_size: 0,
        };

        let mut recovered: Vec<(SystemTime, String, K)> = Vec::new();
        for dir_entry in fs::read_dir(&directory).map_err(|e| CacheError::io(&directory, e))? {
            let dir_entry = dir_entry.map_err(|e| CacheError::io(&directory, e))?;
            let Ok(name) = dir_entry.file_name().into_string() else {
                continue;
            };
            let path = dir_entry.path();

            if is_temp_file_name(&name) {
                if exclusive {
                    debug!("Removing leftover staged write {:?}", path);
                    let _ = fs::remove_file(&path);
                }
                continue;
            }
            if !is_entry_file_name(&name) {
                continue;
            }

            match Self::recover_entry(&path, &name) {
                Ok((key, size, modified)) => {
                    store.disk_size += size;
                    store.entries.insert(
                        key.clone(),
                        DiskEntry {
                            file_name: name.clone(),
                            size,
                        },
                    );
                    recovered.push((modified, name, key));
                }
                Err(e) => {
                    warn!("Dropping unrecoverable cache file {:?}: {}", path, e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        recovered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let keys: Vec<K> = recovered.into_iter().map(|(_, _, key)| key).collect();

        info!(
            "Opened disk store {:?}: {} entries, {} bytes",
            directory,
            keys.len(),
            store.disk_size
        );
        Ok((store, keys))
    }

    fn recover_entry(path: &Path, name: &str) -> Result<(K, u64, SystemTime)> {
        let canonical = read_envelope_key(path)?;
        if filename_for_canonical(&canonical) != name {
            return Err(CacheError::KeyMismatch {
                path: path.to_path_buf(),
            });
        }
        let key: K = serde_json::from_str(&canonical)
            .map_err(|e| CacheError::Decode(format!("key: {}", e)))?;
        let metadata = fs::metadata(path).map_err(|e| CacheError::io(path, e))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok((key, metadata.len(), modified))
    }

    pub fn layout(&self) -> &Arc<DiskLayout> {
        &self.layout
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Size of `key`'s entry file as last accounted
    pub fn entry_size(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.size)
    }

    /// Reads the payload stored for `key`.
    ///
    /// `Ok(None)` if the key has no entry. A file that vanished underneath
    /// the store is also reported as `None` and dropped from the index.
    pub fn read(&mut self, key: &K) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        let path = self.layout.entry_path(&entry.file_name);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Cache file {:?} disappeared, forgetting it", path);
                self.forget(key);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let (stored_key, payload) = decode_envelope(&bytes)?;
        if stored_key != canonical_key(key)? {
            return Err(CacheError::KeyMismatch { path });
        }

        // Recovery orders entries by mtime, so a read counts as a use.
        let bumped = File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = bumped {
            debug!("Could not refresh mtime of {:?}: {}", path, e);
        }

        Ok(Some(payload.to_vec()))
    }

    /// Stages and commits in one step
    pub fn write(&mut self, key: K, payload: &[u8]) -> Result<u64> {
        let staged = self.layout.stage(&key, payload)?;
        self.commit(key, staged)
    }

    /// Renames a staged write into place and updates the size counter by
    /// the delta against any prior entry. Returns the new entry size.
    pub fn commit(&mut self, key: K, staged: StagedWrite) -> Result<u64> {
        let final_path = self.layout.entry_path(&staged.file_name);
        if let Err(e) = fs::rename(&staged.temp_path, &final_path) {
            staged.discard();
            return Err(CacheError::io(&final_path, e));
        }

        let size = staged.size;
        let prior = self.entries.insert(
            key,
            DiskEntry {
                file_name: staged.file_name,
                size,
            },
        );
        self.disk_size = self.disk_size.saturating_sub(prior.map_or(0, |p| p.size)) + size;
        debug!("Disk PUT: {:?} ({} bytes)", final_path, size);
        Ok(size)
    }

    /// Deletes `key`'s file. Returns `Ok(false)` if the key had no entry.
    ///
    /// The entry is forgotten even when the delete fails; a missing file is
    /// not an error.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        let Some(entry) = self.forget(key) else {
            return Ok(false);
        };
        let path = self.layout.entry_path(&entry.file_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Cache file {:?} already gone", path);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        }
        debug!("Disk REMOVE: {:?} ({} bytes)", path, entry.size);
        Ok(true)
    }

    fn forget(&mut self, key: &K) -> Option<DiskEntry> {
        let entry = self.entries.remove(key)?;
        self.disk_size = self.disk_size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Running byte total maintained by write/remove
    pub fn tracked_size(&self) -> u64 {
        self.disk_size
    }

    /// Bytes on disk: the running counter when exclusive, a directory scan
    /// otherwise.
    pub fn total_size(&self) -> Result<u64> {
        if self.exclusive {
            Ok(self.disk_size)
        } else {
            self.scan_size()
        }
    }

    /// Sums the sizes of every file matching the naming scheme
    pub fn scan_size(&self) -> Result<u64> {
        let directory = self.layout.directory();
        let mut total = 0u64;
        for dir_entry in fs::read_dir(directory).map_err(|e| CacheError::io(directory, e))? {
            let dir_entry = dir_entry.map_err(|e| CacheError::io(directory, e))?;
            let is_ours = dir_entry
                .file_name()
                .to_str()
                .is_some_and(is_entry_file_name);
            if !is_ours {
                continue;
            }
            match dir_entry.metadata() {
                Ok(metadata) => total += metadata.len(),
                // Removed between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(dir_entry.path(), e)),
            }
        }
        Ok(total)
    }

    /// Deletes every entry file in the directory. Foreign files are left
    /// alone.
    ///
    /// Entries whose file could not be deleted stay indexed and counted at
    /// their current on-disk size; the first failure is returned.
    pub fn clear_all(&mut self) -> Result<()> {
        let directory = self.layout.directory().to_path_buf();

        let mut first_error = None;
        match fs::read_dir(&directory) {
            Ok(listing) => {
                for dir_entry in listing {
                    let dir_entry = match dir_entry {
                        Ok(dir_entry) => dir_entry,
                        Err(e) => {
                            first_error.get_or_insert(CacheError::io(&directory, e));
                            continue;
                        }
                    };
                    let is_ours = dir_entry
                        .file_name()
                        .to_str()
                        .is_some_and(is_entry_file_name);
                    if !is_ours {
                        continue;
                    }
                    let path = dir_entry.path();
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!("Failed to delete cache file {:?}: {}", path, e);
                            first_error.get_or_insert(CacheError::io(&path, e));
                        }
                    }
                }
            }
            // Nothing left to delete.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => first_error = Some(CacheError::io(&directory, e)),
        }

        let layout = &self.layout;
        self.entries.retain(|_, entry| {
            match fs::symlink_metadata(layout.entry_path(&entry.file_name)) {
                Ok(metadata) => {
                    entry.size = metadata.len();
                    true
                }
                Err(e) => e.kind() != io::ErrorKind::NotFound,
            }
        });
        self.disk_size = self.entries.values().map(|entry| entry.size).sum();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
