//! asset-cache: versioned multi-platform asset cache.
//!
//! Preprocessed object and resource data is kept per target platform in
//! caches made of a table of contents and an append-only blob file. Entries
//! carry the timestamp of the data they were built from, so unchanged assets
//! are never rebuilt. All cache reads go through a single background
//! [`DiskLoader`](transfer::disk_loader::DiskLoader) worker.

pub mod cache;
pub mod config;
pub mod preprocess;
pub mod transfer;

pub use cache::entry::{AssetPath, CacheEntry, PlatformId};
pub use cache::registry::CacheRegistry;
pub use cache::store::{PlatformCacheStore, StoreError};
pub use preprocess::orchestrator::{CacheOrchestrator, PreprocessError, ResourceLoad};
pub use transfer::disk_loader::{DiskLoader, LoadError, LoadPriority, LoadResult};
