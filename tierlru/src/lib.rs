//! tierlru: a two-tier (memory + disk) LRU cache with a single recency order.
//!
//! ```no_run
//! use tierlru::{CacheConfig, TieredCache};
//!
//! let config = CacheConfig::new("/var/cache/myapp")
//!     .with_memory_count_limit(100)
//!     .with_disk_size_limit(64 * 1024 * 1024)
//!     .with_exclusive_disk_owner(true);
//! let cache: TieredCache<String, Vec<u8>> = TieredCache::open(config)?;
//!
//! let report = cache.set("avatar:42".to_string(), vec![0u8; 512]);
//! if let Err(e) = &report.persisted {
//!     eprintln!("memory only: {}", e);
//! }
//! assert!(cache.get(&"avatar:42".to_string()).is_some());
//! # Ok::<(), tierlru::CacheError>(())
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod pressure;

// Re-export commonly used types
pub use cache::{CacheStats, SetReport, TieredCache};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::CacheConfig;
pub use error::{CacheError, InvariantError, Result};
pub use pressure::{HandlerId, PressureHandler, PressureMonitor};
