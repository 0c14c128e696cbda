//! Cache orchestrator: decides per object and per platform whether cached
//! data is current, regenerates stale resource data through its handler,
//! and writes object records and resource sub-data to the platform caches.
//!
//! Object records go to the object cache under sub-data index 0. Resource
//! sub-data chunks go to a second cache named after the resource type,
//! indexed by chunk position, so loading an object never has to touch the
//! large payloads.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::entry::{AssetPath, PlatformId};
use crate::cache::record::{ObjectRecord, RecordError, ResourceSection};
use crate::cache::registry::CacheRegistry;
use crate::cache::store::StoreError;
use crate::config::Config;
use crate::preprocess::asset::{Asset, PreprocessedData, Resource};
use crate::preprocess::handler::ResourceHandler;
use crate::preprocess::platform::PlatformCodec;
use crate::transfer::disk_loader::DiskLoader;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("no platform codec registered for platform {0}")]
    MissingCodec(PlatformId),

    #[error("no entry for \"{path}\" sub-data {sub_data_index} in cache \"{cache}\"")]
    EntryNotFound {
        cache: String,
        path: AssetPath,
        sub_data_index: u32,
    },

    #[error("cache entry for \"{path}\" is {size} bytes, too small for its property length prefix")]
    EntryTooSmall { path: AssetPath, size: u32 },

    #[error("no resource handler for resource type \"{0}\"")]
    NoResourceHandler(String),

    #[error("resource handler failed for \"{path}\": {message}")]
    Handler { path: AssetPath, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Persistent data read back from an object record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentResourceData {
    pub data: Vec<u8>,
    pub sub_data_count: u32,
}

/// How [`CacheOrchestrator::load_resource_data`] satisfied a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLoad {
    /// Every platform was already in memory or loaded from a current cache entry.
    Cached,

    /// At least one platform was stale; all platforms were regenerated.
    Regenerated,

    /// Regeneration was needed but failed.
    RegenerationFailed,
}

/// Builds and loads per-platform cached data for objects and resources.
pub struct CacheOrchestrator {
    config: Arc<Config>,
    caches: CacheRegistry,
    codecs: BTreeMap<PlatformId, Arc<dyn PlatformCodec>>,
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl CacheOrchestrator {
    pub fn new(config: Arc<Config>, loader: Arc<DiskLoader>) -> Self {
        let caches = CacheRegistry::new(config.cache.root.clone(), loader);
        Self {
            config,
            caches,
            codecs: BTreeMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Enable caching for a platform.
    pub fn set_platform_codec(&mut self, platform: PlatformId, codec: Arc<dyn PlatformCodec>) {
        info!(platform = %platform, "Registered platform codec");
        self.codecs.insert(platform, codec);
    }

    pub fn platform_codec(&self, platform: &PlatformId) -> Option<&Arc<dyn PlatformCodec>> {
        self.codecs.get(platform)
    }

    /// Platforms with a registered codec, in a stable order.
    pub fn platforms(&self) -> impl Iterator<Item = &PlatformId> {
        self.codecs.keys()
    }

    pub fn register_resource_handler(&mut self, handler: Arc<dyn ResourceHandler>) {
        self.handlers
            .insert(handler.resource_type().to_string(), handler);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    pub fn caches_mut(&mut self) -> &mut CacheRegistry {
        &mut self.caches
    }

    /// Timestamp a resource's cached data is checked against: the later of
    /// the object timestamp and its source file's modification time.
    pub fn resource_timestamp(&self, resource: &dyn Resource, object_timestamp: i64) -> i64 {
        let source_file = self.config.source.data_dir.join(resource.source_file_path());
        match file_timestamp(&source_file) {
            Some(source) => object_timestamp.max(source),
            None => object_timestamp,
        }
    }

    /// [`cache_object_with`](Self::cache_object_with) using the configured
    /// eviction default.
    pub fn cache_object(&mut self, asset: &mut dyn Asset, timestamp: i64) -> bool {
        let evict = self.config.preprocess.evict_after_cache;
        self.cache_object_with(asset, timestamp, evict)
    }

    /// Cache an object for every registered platform.
    ///
    /// Platforms whose cached record already carries `timestamp` are
    /// skipped. Every platform and sub-data chunk is attempted; the result
    /// is false if any of them failed, or if the object is broken or a
    /// package and was not cached at all.
    pub fn cache_object_with(
        &mut self,
        asset: &mut dyn Asset,
        timestamp: i64,
        evict_after_cache: bool,
    ) -> bool {
        if asset.is_broken() || asset.is_package() {
            debug!(path = %asset.path(), "Skipping broken or package object");
            return false;
        }

        let path = asset.path().clone();
        let object_cache = self.config.cache.object_cache_name.clone();
        let platforms: Vec<_> = self
            .codecs
            .iter()
            .map(|(platform, codec)| (platform.clone(), codec.byte_order()))
            .collect();

        let mut failed = false;
        let mut updated_any = false;

        for (platform, order) in &platforms {
            let store = self.caches.get_cache(&object_cache, platform);
            if store
                .find_entry(&path, 0)
                .is_some_and(|entry| entry.timestamp == timestamp)
            {
                debug!(path = %path, platform = %platform, timestamp, "Cached object is up to date");
                continue;
            }

            info!(path = %path, platform = %platform, timestamp, "Object is out of date, recaching");
            updated_any = true;

            let encoded = match build_record(&*asset, platform)
                .and_then(|record| Ok(record.encode(*order)?))
            {
                Ok(encoded) => encoded,
                Err(err) => {
                    error!(path = %path, platform = %platform, error = %format!("{err:#}"), "Failed to build object record");
                    failed = true;
                    continue;
                }
            };

            if let Err(err) = store.cache_entry(&path, 0, &encoded, timestamp) {
                error!(path = %path, platform = %platform, error = %err, "Failed to cache object");
                failed = true;
            }

            let Some(resource) = asset.as_resource() else {
                continue;
            };
            let Some(data) = resource
                .preprocessed()
                .get(platform)
                .filter(|data| data.loaded && !data.sub_data.is_empty())
            else {
                continue;
            };

            let resource_store = self.caches.get_cache(resource.cache_name(), platform);
            for (index, chunk) in data.sub_data.iter().enumerate() {
                if let Err(err) = resource_store.cache_entry(&path, index as u32, chunk, timestamp) {
                    error!(
                        path = %path,
                        platform = %platform,
                        sub_data_index = index,
                        error = %err,
                        "Failed to cache resource sub-data"
                    );
                    failed = true;
                }
            }
        }

        if evict_after_cache {
            if let Some(resource) = asset.as_resource_mut() {
                resource.preprocessed_mut().clear_all();
            }
        }

        if updated_any {
            asset.post_save();
        }

        !failed
    }

    /// Make a resource's preprocessed data available for every platform.
    ///
    /// Platforms already in memory are left alone; the rest are loaded from
    /// the cache when their object record is current. If any platform is
    /// stale or fails to load, the resource is regenerated from source for
    /// all platforms.
    pub fn load_resource_data(
        &mut self,
        resource: &mut dyn Resource,
        object_timestamp: i64,
    ) -> ResourceLoad {
        let path = resource.path().clone();
        let source_file = self.config.source.data_dir.join(resource.source_file_path());
        let timestamp = self.resource_timestamp(&*resource, object_timestamp);
        let object_cache = self.config.cache.object_cache_name.clone();
        let platforms: Vec<PlatformId> = self.codecs.keys().cloned().collect();

        let mut satisfied = true;
        for platform in &platforms {
            if resource.preprocessed().is_loaded(platform) {
                continue;
            }

            let current = self
                .caches
                .get_cache(&object_cache, platform)
                .find_entry(&path, 0)
                .is_some_and(|entry| entry.timestamp == timestamp);
            if !current {
                info!(
                    path = %path,
                    platform = %platform,
                    timestamp,
                    "Cached resource data missing or out of date, resource will be preprocessed"
                );
                satisfied = false;
                break;
            }

            if let Err(err) = self.load_cached_resource_data(resource, platform) {
                warn!(
                    path = %path,
                    platform = %platform,
                    error = %err,
                    "Failed to load cached resource data, resource will be preprocessed again"
                );
                satisfied = false;
                break;
            }
        }

        if satisfied {
            return ResourceLoad::Cached;
        }

        match self.preprocess_resource(resource, &source_file) {
            Ok(()) => ResourceLoad::Regenerated,
            Err(err) => {
                error!(path = %path, error = %err, "Preprocessing of resource failed");
                ResourceLoad::RegenerationFailed
            }
        }
    }

    /// Read the persistent data and sub-data count from an object record.
    pub fn load_persistent_resource_data(
        &mut self,
        path: &AssetPath,
        platform: &PlatformId,
    ) -> Result<PersistentResourceData, PreprocessError> {
        self.read_persistent(path, platform).map_err(|err| {
            error!(path = %path, platform = %platform, error = %err, "Failed to load persistent resource data");
            err
        })
    }

    fn read_persistent(
        &mut self,
        path: &AssetPath,
        platform: &PlatformId,
    ) -> Result<PersistentResourceData, PreprocessError> {
        let order = self
            .codecs
            .get(platform)
            .ok_or_else(|| PreprocessError::MissingCodec(platform.clone()))?
            .byte_order();

        let store = self
            .caches
            .get_cache(&self.config.cache.object_cache_name, platform);
        let entry = store
            .find_entry(path, 0)
            .cloned()
            .ok_or_else(|| PreprocessError::EntryNotFound {
                cache: store.name().to_string(),
                path: path.clone(),
                sub_data_index: 0,
            })?;

        if (entry.size as usize) < std::mem::size_of::<u32>() {
            return Err(PreprocessError::EntryTooSmall {
                path: path.clone(),
                size: entry.size,
            });
        }

        let data = store.read_entry_exact(&entry)?;
        let section = ObjectRecord::decode_resource(&data, order)?
            .resource
            .unwrap_or_default();

        Ok(PersistentResourceData {
            data: section.persistent,
            sub_data_count: section.sub_data_count,
        })
    }

    /// Load one platform's persistent data and sub-data from the caches.
    fn load_cached_resource_data(
        &mut self,
        resource: &mut dyn Resource,
        platform: &PlatformId,
    ) -> Result<(), PreprocessError> {
        let path = resource.path().clone();
        resource.preprocessed_mut().get_mut(platform).loaded = false;

        let persistent = self.load_persistent_resource_data(&path, platform)?;

        let mut sub_data = Vec::new();
        if persistent.sub_data_count != 0 {
            let store = self.caches.get_cache(resource.cache_name(), platform);
            store.enforce_table_load();

            for index in 0..persistent.sub_data_count {
                let entry = store.lookup(&path, index).cloned().ok_or_else(|| {
                    PreprocessError::EntryNotFound {
                        cache: store.name().to_string(),
                        path: path.clone(),
                        sub_data_index: index,
                    }
                })?;

                sub_data.push(store.read_entry_exact(&entry)?);
            }
        }

        debug!(
            path = %path,
            platform = %platform,
            sub_data = sub_data.len(),
            "Loaded cached resource data"
        );
        resource
            .preprocessed_mut()
            .set(platform.clone(), PreprocessedData::new(persistent.data, sub_data));
        Ok(())
    }

    /// Regenerate a resource for every platform through its handler.
    ///
    /// Existing in-memory data is discarded first. Afterwards the current
    /// platform's persistent data, if any, is handed back to the resource.
    pub fn preprocess_resource(
        &mut self,
        resource: &mut dyn Resource,
        source_file: &Path,
    ) -> Result<(), PreprocessError> {
        let path = resource.path().clone();
        info!(path = %path, source = %source_file.display(), "Preprocessing resource");

        resource.preprocessed_mut().clear_all();

        let handler = self
            .handlers
            .get(resource.resource_type())
            .cloned()
            .ok_or_else(|| PreprocessError::NoResourceHandler(resource.resource_type().to_string()))?;

        handler
            .cache_resource(&*self, resource, source_file)
            .map_err(|err| PreprocessError::Handler {
                path: path.clone(),
                message: format!("{err:#}"),
            })?;

        let Some(current) = self.config.preprocess.current_platform.as_deref() else {
            return Ok(());
        };
        let current = PlatformId::new(current);
        if !self.codecs.contains_key(&current) {
            return Ok(());
        }

        let persistent = resource
            .preprocessed()
            .get(&current)
            .filter(|data| data.loaded && !data.persistent.is_empty())
            .map(|data| data.persistent.clone());
        if let Some(persistent) = persistent {
            resource
                .load_persistent_resource_data(&persistent)
                .map_err(|err| PreprocessError::Handler {
                    path,
                    message: format!("{err:#}"),
                })?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("platforms", &self.codecs.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("caches", &self.caches.len())
            .finish()
    }
}

/// Build the record for one platform from the object's current state.
fn build_record(asset: &dyn Asset, platform: &PlatformId) -> anyhow::Result<ObjectRecord> {
    let properties = asset.serialize_properties()?;

    let resource = match asset.as_resource() {
        None => None,
        Some(resource) => match resource.preprocessed().get(platform) {
            Some(data) if data.loaded => Some(ResourceSection {
                persistent: data.persistent.clone(),
                sub_data_count: u32::try_from(data.sub_data.len())?,
            }),
            _ => {
                warn!(
                    path = %asset.path(),
                    platform = %platform,
                    "Resource data is not in memory, caching properties only; load_resource_data must run before caching"
                );
                None
            }
        },
    };

    Ok(ObjectRecord {
        properties,
        resource,
    })
}

/// Modification time of a file in seconds since the Unix epoch.
pub fn file_timestamp(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}
