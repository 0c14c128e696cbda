//! The object model the orchestrator consumes.
//!
//! Objects and resources are owned by the caller; the orchestrator only
//! reads their identity and properties and reads/writes their per-platform
//! preprocessed data.

use std::collections::HashMap;
use std::path::Path;

use crate::cache::entry::{AssetPath, PlatformId};

/// A cacheable object.
pub trait Asset {
    /// Identity the object is cached under.
    fn path(&self) -> &AssetPath;

    /// Broken objects are never cached.
    fn is_broken(&self) -> bool {
        false
    }

    /// Packages are containers and are never cached themselves.
    fn is_package(&self) -> bool {
        false
    }

    /// Serialize the object's properties into the cached property block.
    fn serialize_properties(&self) -> anyhow::Result<Vec<u8>>;

    /// Called once after a caching pass that wrote to at least one cache.
    fn post_save(&mut self) {}

    fn as_resource(&self) -> Option<&dyn Resource> {
        None
    }

    fn as_resource_mut(&mut self) -> Option<&mut dyn Resource> {
        None
    }
}

/// An object backed by a source file that is preprocessed per platform.
pub trait Resource: Asset {
    /// Type name used to find the resource handler.
    fn resource_type(&self) -> &str;

    /// Name of the cache holding this resource type's sub-data chunks.
    fn cache_name(&self) -> &str;

    /// Source file path, relative to the configured data directory.
    fn source_file_path(&self) -> &Path;

    fn preprocessed(&self) -> &PreprocessedDataSet;

    fn preprocessed_mut(&mut self) -> &mut PreprocessedDataSet;

    /// Receives the current platform's persistent data after regeneration.
    fn load_persistent_resource_data(&mut self, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One platform's preprocessed output for a resource.
///
/// Buffers are only meaningful while `loaded` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessedData {
    /// Small data loaded eagerly with the object.
    pub persistent: Vec<u8>,

    /// Large payload chunks cached separately and loaded on demand.
    pub sub_data: Vec<Vec<u8>>,

    pub loaded: bool,
}

impl PreprocessedData {
    pub fn new(persistent: Vec<u8>, sub_data: Vec<Vec<u8>>) -> Self {
        Self {
            persistent,
            sub_data,
            loaded: true,
        }
    }

    /// Drop all buffers and mark the data unloaded.
    pub fn clear(&mut self) {
        self.persistent = Vec::new();
        self.sub_data = Vec::new();
        self.loaded = false;
    }

    /// Total bytes held in memory.
    pub fn size(&self) -> usize {
        self.persistent.len() + self.sub_data.iter().map(Vec::len).sum::<usize>()
    }
}

/// Preprocessed data of one resource for every platform.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedDataSet {
    platforms: HashMap<PlatformId, PreprocessedData>,
}

impl PreprocessedDataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, platform: &PlatformId) -> Option<&PreprocessedData> {
        self.platforms.get(platform)
    }

    /// Get a platform's data, creating an unloaded slot if needed.
    pub fn get_mut(&mut self, platform: &PlatformId) -> &mut PreprocessedData {
        self.platforms.entry(platform.clone()).or_default()
    }

    pub fn set(&mut self, platform: PlatformId, data: PreprocessedData) {
        self.platforms.insert(platform, data);
    }

    pub fn is_loaded(&self, platform: &PlatformId) -> bool {
        self.platforms.get(platform).is_some_and(|data| data.loaded)
    }

    /// Clear every platform's data.
    pub fn clear_all(&mut self) {
        for data in self.platforms.values_mut() {
            data.clear();
        }
    }
}
