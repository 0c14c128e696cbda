//! Cache registry: owns every open store, keyed by cache name and platform.
//!
//! Stores are created on first request. File layout under the root:
//! `<root>/<platform>/<name>.toc` and `<root>/<platform>/<name>.cache`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::cache::entry::PlatformId;
use crate::cache::store::PlatformCacheStore;
use crate::transfer::disk_loader::DiskLoader;

/// TOC file extension.
pub const TOC_EXTENSION: &str = "toc";

/// Blob file extension.
pub const CACHE_EXTENSION: &str = "cache";

#[derive(Debug)]
pub struct CacheRegistry {
    root: PathBuf,
    loader: Arc<DiskLoader>,
    caches: HashMap<(String, PlatformId), PlatformCacheStore>,
}

impl CacheRegistry {
    pub fn new(root: impl Into<PathBuf>, loader: Arc<DiskLoader>) -> Self {
        Self {
            root: root.into(),
            loader,
            caches: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn loader(&self) -> &Arc<DiskLoader> {
        &self.loader
    }

    /// Get the store for `(name, platform)`, creating it if needed.
    pub fn get_cache(&mut self, name: &str, platform: &PlatformId) -> &mut PlatformCacheStore {
        let root = &self.root;
        let loader = &self.loader;
        self.caches
            .entry((name.to_string(), platform.clone()))
            .or_insert_with(|| {
                let dir = root.join(platform.as_str());
                debug!(cache = name, platform = %platform, dir = %dir.display(), "Opening cache");
                PlatformCacheStore::new(
                    name,
                    platform.clone(),
                    dir.join(format!("{name}.{TOC_EXTENSION}")),
                    dir.join(format!("{name}.{CACHE_EXTENSION}")),
                    Arc::clone(loader),
                )
            })
    }

    /// Get an already-open store.
    pub fn cache(&self, name: &str, platform: &PlatformId) -> Option<&PlatformCacheStore> {
        self.caches.get(&(name.to_string(), platform.clone()))
    }

    /// Number of open stores.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
