use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

/// Default factor the memory limit is multiplied by on each pressure signal
pub const DEFAULT_PRESSURE_SHRINK_FACTOR: f64 = 0.5;

/// Cache configuration
///
/// Every field except `storage_directory` is optional in YAML and falls back
/// to its default: unlimited tiers, non-exclusive disk ownership and no
/// pressure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one file per cached key. Created if missing.
    pub storage_directory: PathBuf,

    /// If > 0, the memory tier holds at most this many items
    #[serde(default)]
    pub memory_count_limit: usize,

    /// If > 0, the disk tier holds at most this many bytes
    #[serde(default)]
    pub disk_size_limit: u64,

    /// Trust the running disk-size counter instead of rescanning the
    /// directory on every write.
    ///
    /// Only sound when no other cache instance or process writes into
    /// `storage_directory`. Nothing enforces this; `check_invariants` catches
    /// violations in debug builds.
    #[serde(default)]
    pub exclusive_disk_owner: bool,

    /// Drop the memory tier when a low-memory signal arrives
    #[serde(default)]
    pub clear_on_pressure: bool,

    /// Shrink the memory limit when a low-memory signal arrives.
    /// Has no effect while `memory_count_limit == 0`.
    #[serde(default)]
    pub shrink_on_pressure: bool,

    /// Fraction applied to the memory limit per pressure signal, in (0, 1)
    #[serde(default = "default_shrink_factor")]
    pub pressure_shrink_factor: f64,
}

fn default_shrink_factor() -> f64 {
    DEFAULT_PRESSURE_SHRINK_FACTOR
}

impl CacheConfig {
    /// Unlimited configuration rooted at `storage_directory`
    pub fn new(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: storage_directory.into(),
            memory_count_limit: 0,
            disk_size_limit: 0,
            exclusive_disk_owner: false,
            clear_on_pressure: false,
            shrink_on_pressure: false,
            pressure_shrink_factor: DEFAULT_PRESSURE_SHRINK_FACTOR,
        }
    }

    pub fn with_memory_count_limit(mut self, limit: usize) -> Self {
        self.memory_count_limit = limit;
        self
    }

    pub fn with_disk_size_limit(mut self, limit: u64) -> Self {
        self.disk_size_limit = limit;
        self
    }

    pub fn with_exclusive_disk_owner(mut self, exclusive: bool) -> Self {
        self.exclusive_disk_owner = exclusive;
        self
    }

    pub fn with_clear_on_pressure(mut self, clear: bool) -> Self {
        self.clear_on_pressure = clear;
        self
    }

    pub fn with_shrink_on_pressure(mut self, shrink: bool) -> Self {
        self.shrink_on_pressure = shrink;
        self
    }

    pub fn with_pressure_shrink_factor(mut self, factor: f64) -> Self {
        self.pressure_shrink_factor = factor;
        self
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        let config: CacheConfig = serde_yaml::from_str(&content)
            .map_err(|e| CacheError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.storage_directory.as_os_str().is_empty() {
            return Err(CacheError::Config(
                "storage_directory must not be empty".to_string(),
            ));
        }

        let factor = self.pressure_shrink_factor;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(CacheError::Config(format!(
                "pressure_shrink_factor must be in (0, 1), got {}",
                factor
            )));
        }

        Ok(())
    }

    /// Memory limit after one pressure signal, floored at 1.
    /// An unlimited (0) limit stays unlimited.
    pub fn shrunk_limit(&self, current: usize) -> usize {
        if current == 0 {
            return 0;
        }
        let reduced = (current as f64 * self.pressure_shrink_factor).floor() as usize;
        reduced.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::new("/tmp/tierlru");
        assert_eq!(config.memory_count_limit, 0);
        assert_eq!(config.disk_size_limit, 0);
        assert!(!config.exclusive_disk_owner);
        assert!(!config.clear_on_pressure);
        assert!(!config.shrink_on_pressure);
        assert_eq!(config.pressure_shrink_factor, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_uses_field_defaults() {
        let yaml = "storage_directory: /var/cache/app\nmemory_count_limit: 64\n";
        let config: CacheConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage_directory, PathBuf::from("/var/cache/app"));
        assert_eq!(config.memory_count_limit, 64);
        assert_eq!(config.disk_size_limit, 0);
        assert_eq!(config.pressure_shrink_factor, DEFAULT_PRESSURE_SHRINK_FACTOR);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "storage_directory: ./cache\ndisk_size_limit: 1048576\nexclusive_disk_owner: true\nshrink_on_pressure: true\npressure_shrink_factor: 0.25"
        )
        .unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.disk_size_limit, 1_048_576);
        assert!(config.exclusive_disk_owner);
        assert!(config.shrink_on_pressure);
        assert_eq!(config.pressure_shrink_factor, 0.25);
    }

    #[test]
    fn test_from_file_missing() {
        let result = CacheConfig::from_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(CacheError::Io { .. })));
    }

    #[test]
    fn test_from_file_rejects_bad_factor() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage_directory: ./cache\npressure_shrink_factor: 1.5").unwrap();
        let result = CacheConfig::from_file(file.path());
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_directory() {
        let config = CacheConfig::new("");
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_shrunk_limit_halves_down_to_one() {
        let config = CacheConfig::new("/tmp/x");
        assert_eq!(config.shrunk_limit(10), 5);
        assert_eq!(config.shrunk_limit(5), 2);
        assert_eq!(config.shrunk_limit(2), 1);
        assert_eq!(config.shrunk_limit(1), 1);
        assert_eq!(config.shrunk_limit(0), 0);
    }
}
