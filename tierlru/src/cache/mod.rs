//! Cache Module
//!
//! Two storage tiers sharing one recency order:
//! - Memory: bounded by item count
//! - Disk: one file per key, bounded by total bytes
//!
//! [`TieredCache`] ties them together and owns eviction.

pub mod disk;
pub mod memory;
pub mod recency;
pub mod tiered;

pub use disk::{DiskLayout, DiskStore, StagedWrite, filename_for};
pub use memory::MemoryStore;
pub use recency::RecencyQueue;
pub use tiered::{CacheStats, SetReport, TieredCache};
