//! Integration tests for the cache orchestrator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use asset_cache::cache::entry::{AssetPath, PlatformId};
use asset_cache::cache::record::ByteOrder;
use asset_cache::cache::store::StoreError;
use asset_cache::config::Config;
use asset_cache::preprocess::asset::{Asset, PreprocessedData, PreprocessedDataSet, Resource};
use asset_cache::preprocess::handler::ResourceHandler;
use asset_cache::preprocess::orchestrator::{CacheOrchestrator, PreprocessError, ResourceLoad};
use asset_cache::preprocess::platform::{NativeCodec, SwappedCodec};
use asset_cache::transfer::disk_loader::DiskLoader;

/// Far enough in the future to dominate any source file mtime.
const T: i64 = 4_000_000_000;

struct Entity {
    path: AssetPath,
    properties: Vec<u8>,
    broken: bool,
    package: bool,
    saves: usize,
}

impl Entity {
    fn new(path: &str, properties: &[u8]) -> Self {
        Self {
            path: AssetPath::new(path),
            properties: properties.to_vec(),
            broken: false,
            package: false,
            saves: 0,
        }
    }
}

impl Asset for Entity {
    fn path(&self) -> &AssetPath {
        &self.path
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn is_package(&self) -> bool {
        self.package
    }

    fn serialize_properties(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.properties.clone())
    }

    fn post_save(&mut self) {
        self.saves += 1;
    }
}

struct Texture {
    path: AssetPath,
    source: PathBuf,
    data: PreprocessedDataSet,
    handed_back: Option<Vec<u8>>,
    saves: usize,
}

impl Texture {
    fn new(path: &str, source: &str) -> Self {
        Self {
            path: AssetPath::new(path),
            source: PathBuf::from(source),
            data: PreprocessedDataSet::new(),
            handed_back: None,
            saves: 0,
        }
    }
}

impl Asset for Texture {
    fn path(&self) -> &AssetPath {
        &self.path
    }

    fn serialize_properties(&self) -> anyhow::Result<Vec<u8>> {
        Ok(format!("{{\"source\":\"{}\"}}", self.source.display()).into_bytes())
    }

    fn post_save(&mut self) {
        self.saves += 1;
    }

    fn as_resource(&self) -> Option<&dyn Resource> {
        Some(self)
    }

    fn as_resource_mut(&mut self) -> Option<&mut dyn Resource> {
        Some(self)
    }
}

impl Resource for Texture {
    fn resource_type(&self) -> &str {
        "texture"
    }

    fn cache_name(&self) -> &str {
        "textures"
    }

    fn source_file_path(&self) -> &Path {
        &self.source
    }

    fn preprocessed(&self) -> &PreprocessedDataSet {
        &self.data
    }

    fn preprocessed_mut(&mut self) -> &mut PreprocessedDataSet {
        &mut self.data
    }

    fn load_persistent_resource_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.handed_back = Some(data.to_vec());
        Ok(())
    }
}

/// Splits the source file into 4-byte chunks per platform.
#[derive(Default)]
struct TextureHandler {
    runs: AtomicUsize,
}

impl ResourceHandler for TextureHandler {
    fn resource_type(&self) -> &str {
        "texture"
    }

    fn cache_resource(
        &self,
        orchestrator: &CacheOrchestrator,
        resource: &mut dyn Resource,
        source_file: &Path,
    ) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let source = fs::read(source_file)?;

        for platform in orchestrator.platforms() {
            let persistent = format!("{platform}:{}", source.len()).into_bytes();
            let chunks = source.chunks(4).map(<[u8]>::to_vec).collect();
            resource
                .preprocessed_mut()
                .set(platform.clone(), PreprocessedData::new(persistent, chunks));
        }
        Ok(())
    }
}

struct Fixture {
    _tmp: TempDir,
    config: Config,
    handler: Arc<TextureHandler>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        fs::create_dir_all(config.source.data_dir.join("textures")).unwrap();
        fs::write(config.source.data_dir.join("textures/grass.png"), b"0123456789").unwrap();
        Self {
            _tmp: tmp,
            config,
            handler: Arc::new(TextureHandler::default()),
        }
    }

    /// A fresh orchestrator over the same files, with `pc` and `ps3` registered.
    fn orchestrator(&self) -> CacheOrchestrator {
        let loader = DiskLoader::start_new(&self.config.loader).unwrap();
        let mut orchestrator = CacheOrchestrator::new(Arc::new(self.config.clone()), loader);
        orchestrator.set_platform_codec(PlatformId::new("pc"), Arc::new(NativeCodec));
        orchestrator.set_platform_codec(PlatformId::new("ps3"), Arc::new(SwappedCodec));
        orchestrator.register_resource_handler(self.handler.clone());
        orchestrator
    }

    fn runs(&self) -> usize {
        self.handler.runs.load(Ordering::SeqCst)
    }

    fn blob_len(&self, platform: &str, cache: &str) -> u64 {
        let path = self.config.cache.root.join(platform).join(format!("{cache}.cache"));
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}

#[test]
fn test_caching_twice_writes_nothing_new() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut hero = Entity::new("Entities/Hero", b"{\"hp\":100}");

    assert!(orchestrator.cache_object(&mut hero, 100));
    let written = fx.blob_len("pc", "objects");
    assert!(written > 0);
    assert_eq!(hero.saves, 1);

    assert!(orchestrator.cache_object(&mut hero, 100));
    assert_eq!(fx.blob_len("pc", "objects"), written);
    assert_eq!(fx.blob_len("ps3", "objects"), written);
    assert_eq!(hero.saves, 1);
}

#[test]
fn test_newer_timestamp_orphans_old_record() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut hero = Entity::new("Entities/Hero", b"{\"hp\":100}");
    let pc = PlatformId::new("pc");

    assert!(orchestrator.cache_object(&mut hero, 100));
    let first = fx.blob_len("pc", "objects");

    hero.properties = b"{\"hp\":150}".to_vec();
    assert!(orchestrator.cache_object(&mut hero, 150));
    assert_eq!(fx.blob_len("pc", "objects"), first * 2);

    let store = orchestrator.caches_mut().get_cache("objects", &pc);
    let entry = store.find_entry(&hero.path, 0).cloned().unwrap();
    assert_eq!(entry.timestamp, 150);
    assert_eq!(entry.offset, first);
    assert_eq!(store.entries().len(), 1);
    assert_eq!(hero.saves, 2);
}

#[test]
fn test_broken_and_package_objects_are_skipped() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();

    let mut broken = Entity::new("Entities/Broken", b"{}");
    broken.broken = true;
    let mut package = Entity::new("Packages/Level1", b"{}");
    package.package = true;

    assert!(!orchestrator.cache_object(&mut broken, 1));
    assert!(!orchestrator.cache_object(&mut package, 1));
    assert_eq!(fx.blob_len("pc", "objects"), 0);
    assert_eq!(broken.saves + package.saves, 0);
}

#[test]
fn test_records_use_each_platforms_byte_order() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let properties = b"{\"hp\":100}";
    let mut hero = Entity::new("Entities/Hero", properties);
    assert!(orchestrator.cache_object(&mut hero, 100));

    let prefix = |platform: &str| {
        let bytes = fs::read(fx.config.cache.root.join(platform).join("objects.cache")).unwrap();
        [bytes[0], bytes[1], bytes[2], bytes[3]]
    };

    let len = properties.len() as u32;
    let (native, swapped) = match ByteOrder::native() {
        ByteOrder::Little => (len.to_le_bytes(), len.to_be_bytes()),
        ByteOrder::Big => (len.to_be_bytes(), len.to_le_bytes()),
    };
    assert_eq!(prefix("pc"), native);
    assert_eq!(prefix("ps3"), swapped);
}

#[test]
fn test_resource_round_trip_through_cache() {
    let fx = Fixture::new();
    let pc = PlatformId::new("pc");
    let ps3 = PlatformId::new("ps3");

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    let mut orchestrator = fx.orchestrator();
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Regenerated);
    assert_eq!(fx.runs(), 1);
    let expected_pc = grass.data.get(&pc).cloned().unwrap();
    let expected_ps3 = grass.data.get(&ps3).cloned().unwrap();
    assert_eq!(expected_pc.sub_data.len(), 3);

    assert!(orchestrator.cache_object_with(&mut grass, T, false));
    assert_eq!(fx.blob_len("pc", "textures"), 10);
    drop(orchestrator);

    // A fresh process finds everything cached.
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    let mut orchestrator = fx.orchestrator();
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Cached);
    assert_eq!(fx.runs(), 1);
    assert_eq!(grass.data.get(&pc), Some(&expected_pc));
    assert_eq!(grass.data.get(&ps3), Some(&expected_ps3));

    let persistent = orchestrator.load_persistent_resource_data(&grass.path, &ps3).unwrap();
    assert_eq!(persistent.data, b"ps3:10");
    assert_eq!(persistent.sub_data_count, 3);
}

#[test]
fn test_stale_resource_is_regenerated() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object(&mut grass, T));
    assert_eq!(fx.runs(), 1);

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, T + 50), ResourceLoad::Regenerated);
    assert_eq!(fx.runs(), 2);
}

#[test]
fn test_loaded_platforms_are_not_reloaded() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Cached);
    assert_eq!(fx.runs(), 1);
}

#[test]
fn test_newer_source_file_invalidates() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    // An old object timestamp is overridden by the source file's mtime.
    let effective = orchestrator.resource_timestamp(&grass, 100);
    assert!(effective > 100);

    orchestrator.load_resource_data(&mut grass, 100);
    assert!(orchestrator.cache_object(&mut grass, 100));

    // Cached under the object timestamp, so the source still looks newer.
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, 100), ResourceLoad::Regenerated);

    assert!(orchestrator.cache_object(&mut grass, effective));
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, 100), ResourceLoad::Cached);
    assert_eq!(fx.runs(), 2);
}

#[test]
fn test_missing_sub_data_forces_regeneration() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object(&mut grass, T));
    drop(orchestrator);

    fs::remove_file(fx.config.cache.root.join("ps3/textures.toc")).unwrap();

    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Regenerated);
    assert_eq!(fx.runs(), 2);
}

#[test]
fn test_truncated_object_record_forces_regeneration() {
    let fx = Fixture::new();
    let pc = PlatformId::new("pc");
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object(&mut grass, T));
    drop(orchestrator);

    // Drop the trailing sub-data count of the only record in the blob.
    let blob = fx.config.cache.root.join("pc/objects.cache");
    let bytes = fs::read(&blob).unwrap();
    fs::write(&blob, &bytes[..bytes.len() - 4]).unwrap();

    let mut orchestrator = fx.orchestrator();
    let err = orchestrator
        .load_persistent_resource_data(&grass.path, &pc)
        .unwrap_err();
    assert!(matches!(err, PreprocessError::Store(StoreError::ShortRead { .. })));

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Regenerated);
    assert_eq!(fx.runs(), 2);
    assert_eq!(grass.data.get(&pc).map(|data| data.sub_data.len()), Some(3));
}

#[test]
fn test_failed_platform_does_not_stop_the_others() {
    let fx = Fixture::new();
    let ps3 = PlatformId::new("ps3");

    // A file where the pc cache directory belongs makes every pc write fail.
    fs::create_dir_all(&fx.config.cache.root).unwrap();
    fs::write(fx.config.cache.root.join("pc"), b"not a directory").unwrap();

    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(orchestrator.load_resource_data(&mut grass, T), ResourceLoad::Regenerated);

    assert!(!orchestrator.cache_object_with(&mut grass, T, false));
    assert_eq!(grass.saves, 1);

    let objects = orchestrator.caches_mut().get_cache("objects", &ps3);
    assert_eq!(objects.find_entry(&grass.path, 0).map(|e| e.timestamp), Some(T));
    let textures = orchestrator.caches_mut().get_cache("textures", &ps3);
    for index in 0..3 {
        assert!(textures.find_entry(&grass.path, index).is_some());
    }
    assert_eq!(fx.blob_len("ps3", "textures"), 10);

    // The failing platform keeps failing; the healthy one is already current.
    assert!(!orchestrator.cache_object_with(&mut grass, T, false));
    assert_eq!(fx.blob_len("ps3", "textures"), 10);
}

#[test]
fn test_evict_after_cache() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let pc = PlatformId::new("pc");
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object_with(&mut grass, T, false));
    assert!(grass.data.is_loaded(&pc));

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object(&mut grass, T));
    assert!(!grass.data.is_loaded(&pc));
    assert_eq!(grass.data.get(&pc).map(PreprocessedData::size), Some(0));
}

#[test]
fn test_unloaded_resource_caches_properties_only() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let pc = PlatformId::new("pc");
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    assert!(orchestrator.cache_object(&mut grass, T));
    assert_eq!(fx.blob_len("pc", "textures"), 0);

    let err = orchestrator
        .load_persistent_resource_data(&grass.path, &pc)
        .unwrap_err();
    assert!(matches!(err, PreprocessError::Record(_)));
}

#[test]
fn test_persistent_data_errors() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let path = AssetPath::new("Textures/Grass");

    let err = orchestrator
        .load_persistent_resource_data(&path, &PlatformId::new("xbox"))
        .unwrap_err();
    assert!(matches!(err, PreprocessError::MissingCodec(_)));

    let err = orchestrator
        .load_persistent_resource_data(&path, &PlatformId::new("pc"))
        .unwrap_err();
    assert!(matches!(err, PreprocessError::EntryNotFound { sub_data_index: 0, .. }));

    let pc = PlatformId::new("pc");
    orchestrator
        .caches_mut()
        .get_cache("objects", &pc)
        .cache_entry(&path, 0, &[1, 2], T)
        .unwrap();
    let err = orchestrator.load_persistent_resource_data(&path, &pc).unwrap_err();
    assert!(matches!(err, PreprocessError::EntryTooSmall { size: 2, .. }));
}

#[test]
fn test_missing_handler_fails_regeneration() {
    let fx = Fixture::new();
    let loader = DiskLoader::start_new(&fx.config.loader).unwrap();
    let mut orchestrator = CacheOrchestrator::new(Arc::new(fx.config.clone()), loader);
    orchestrator.set_platform_codec(PlatformId::new("pc"), Arc::new(NativeCodec));

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    assert_eq!(
        orchestrator.load_resource_data(&mut grass, T),
        ResourceLoad::RegenerationFailed
    );
}

#[test]
fn test_current_platform_data_is_handed_back() {
    let mut fx = Fixture::new();
    fx.config.preprocess.current_platform = Some("pc".to_string());
    let mut orchestrator = fx.orchestrator();

    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");
    orchestrator.load_resource_data(&mut grass, T);
    assert_eq!(grass.handed_back.as_deref(), Some(&b"pc:10"[..]));
}

#[test]
fn test_post_save_only_when_something_was_written() {
    let fx = Fixture::new();
    let mut orchestrator = fx.orchestrator();
    let mut grass = Texture::new("Textures/Grass", "textures/grass.png");

    orchestrator.load_resource_data(&mut grass, T);
    assert!(orchestrator.cache_object(&mut grass, T));
    assert_eq!(grass.saves, 1);

    assert!(orchestrator.cache_object(&mut grass, T));
    assert_eq!(grass.saves, 1);
}
