//! Per-platform cache store: a table of contents plus an append-only blob file.
//!
//! The table is loaded lazily on first use and rewritten after every
//! successful write. Blob data is only ever appended; a superseded entry's
//! bytes stay in the blob file, unreachable through the table.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::entry::{AssetPath, CacheEntry, EntryKey, PlatformId};
use crate::cache::toc::TableOfContents;
use crate::transfer::disk_loader::{DiskLoader, LoadError, LoadPriority, LoadResult};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt table of contents: {0}")]
    TocCorrupt(String),

    #[error("cache version {found} exceeds the supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("duplicate entry for \"{path}\", sub-data {sub_data_index}")]
    DuplicateEntry {
        path: AssetPath,
        sub_data_index: u32,
    },

    #[error("asset path \"{0}\" is too long for the table of contents")]
    PathTooLong(AssetPath),

    #[error("entry of {0} bytes exceeds the 32-bit entry size limit")]
    EntryTooLarge(usize),

    #[error("cache file not found: {0}")]
    FileMissing(PathBuf),

    #[error("short read of \"{path}\" sub-data {sub_data_index}: expected {expected} bytes, read {read}")]
    ShortRead {
        path: AssetPath,
        sub_data_index: u32,
        expected: u32,
        read: usize,
    },

    #[error("disk loader error: {0}")]
    Loader(#[from] LoadError),
}

/// One cache for one platform.
#[derive(Debug)]
pub struct PlatformCacheStore {
    name: String,
    platform: PlatformId,
    toc_path: PathBuf,
    cache_path: PathBuf,
    loader: Arc<DiskLoader>,

    /// `None` until the table has been loaded.
    toc: Option<TableOfContents>,
}

impl PlatformCacheStore {
    /// Create a store over the given TOC and blob files. Nothing is read
    /// until the table is first needed.
    pub fn new(
        name: impl Into<String>,
        platform: PlatformId,
        toc_path: PathBuf,
        cache_path: PathBuf,
        loader: Arc<DiskLoader>,
    ) -> Self {
        Self {
            name: name.into(),
            platform,
            toc_path,
            cache_path,
            loader,
            toc: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    pub fn toc_path(&self) -> &Path {
        &self.toc_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn is_table_loaded(&self) -> bool {
        self.toc.is_some()
    }

    /// Load the table of contents if it has not been loaded yet.
    ///
    /// A missing TOC file yields an empty table. A corrupt one is logged
    /// and also yields an empty table, so every entry gets regenerated.
    pub fn enforce_table_load(&mut self) {
        if self.toc.is_some() {
            return;
        }

        let toc = match self.read_table() {
            Ok(toc) => toc,
            Err(err) => {
                error!(
                    cache = %self.name,
                    platform = %self.platform,
                    toc = %self.toc_path.display(),
                    error = %err,
                    "Failed to load cache table of contents, starting empty"
                );
                TableOfContents::new()
            }
        };

        info!(
            cache = %self.name,
            platform = %self.platform,
            entries = toc.len(),
            "Loaded cache table of contents"
        );
        self.toc = Some(toc);
    }

    fn read_table(&self) -> Result<TableOfContents, StoreError> {
        let expected = match fs::metadata(&self.toc_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                info!(toc = %self.toc_path.display(), "TOC file does not exist yet");
                return Ok(TableOfContents::new());
            }
        };
        let expected = usize::try_from(expected)
            .map_err(|_| StoreError::TocCorrupt("TOC file too large".to_string()))?;

        let id = self
            .loader
            .queue_request(&self.toc_path, 0, expected, LoadPriority::High)?;
        let data = match self.loader.sync_request(id)? {
            LoadResult::Loaded(data) => data,
            LoadResult::FileMissing => return Ok(TableOfContents::new()),
        };

        if data.is_empty() {
            warn!(toc = %self.toc_path.display(), "No data loaded from TOC file");
            return Ok(TableOfContents::new());
        }
        if data.len() != expected {
            warn!(
                toc = %self.toc_path.display(),
                expected,
                read = data.len(),
                "TOC file size does not match the number of bytes read"
            );
        }

        TableOfContents::decode(&data)
    }

    /// Look up an entry. Loads the table if needed; absent keys return `None`.
    pub fn find_entry(&mut self, path: &AssetPath, sub_data_index: u32) -> Option<&CacheEntry> {
        self.enforce_table_load();
        self.lookup(path, sub_data_index)
    }

    /// Look up an entry in the already-loaded table.
    pub fn lookup(&self, path: &AssetPath, sub_data_index: u32) -> Option<&CacheEntry> {
        self.toc
            .as_ref()?
            .find(&EntryKey::new(path.clone(), sub_data_index))
    }

    /// Entries in table order. Empty until the table is loaded.
    pub fn entries(&self) -> &[CacheEntry] {
        self.toc.as_ref().map(|toc| toc.entries()).unwrap_or(&[])
    }

    /// Append `data` to the blob file and point the entry for
    /// `(path, sub_data_index)` at it.
    ///
    /// On failure the table is left as it was before the call.
    pub fn cache_entry(
        &mut self,
        path: &AssetPath,
        sub_data_index: u32,
        data: &[u8],
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let size = u32::try_from(data.len()).map_err(|_| StoreError::EntryTooLarge(data.len()))?;
        self.enforce_table_load();

        // Readers of these files must not be mid-flight while they change.
        let loader = Arc::clone(&self.loader);
        let _lock = loader.lock();

        let offset = self.append_blob(data)?;
        let entry = CacheEntry {
            path: path.clone(),
            sub_data_index,
            timestamp,
            offset,
            size,
        };
        let key = entry.key();

        let toc = self.toc.get_or_insert_with(TableOfContents::new);
        let previous = toc.upsert(entry);
        match previous {
            None => info!(path = %path, cache = %self.cache_path.display(), "Adding entry to cache"),
            Some(_) => info!(path = %path, cache = %self.cache_path.display(), "Updating entry in cache"),
        }

        if let Err(err) = self.write_table() {
            error!(toc = %self.toc_path.display(), error = %err, "Failed to rewrite TOC file");
            if let Some(toc) = self.toc.as_mut() {
                toc.revert(&key, previous);
            }
            return Err(err);
        }

        debug!(
            path = %path,
            sub_data_index,
            timestamp,
            offset,
            size,
            "Cached entry"
        );
        Ok(())
    }

    /// Append bytes at the end of the blob file, returning their offset.
    fn append_blob(&self, data: &[u8]) -> Result<u64, StoreError> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.cache_path)
            .map_err(|err| {
                error!(cache = %self.cache_path.display(), error = %err, "Failed to open cache for writing");
                StoreError::Io(err)
            })?;

        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(data).map_err(|err| {
            error!(
                cache = %self.cache_path.display(),
                size = data.len(),
                error = %err,
                "Failed to write entry data"
            );
            StoreError::Io(err)
        })?;
        file.flush()?;

        Ok(offset)
    }

    /// Persist the table: write a sibling temp file, then rename over the TOC.
    fn write_table(&self) -> Result<(), StoreError> {
        let Some(toc) = self.toc.as_ref() else {
            return Ok(());
        };
        let encoded = toc.encode()?;

        if let Some(parent) = self.toc_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.toc_path.with_extension("toc.tmp");
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, &self.toc_path)?;

        debug!(toc = %self.toc_path.display(), entries = toc.len(), "Rewrote TOC file");
        Ok(())
    }

    /// Read an entry's bytes through the disk loader.
    ///
    /// A short read is logged and the bytes that were read are returned;
    /// see [`read_entry_exact`](Self::read_entry_exact) for a checked read.
    pub fn read_entry(&self, entry: &CacheEntry) -> Result<Vec<u8>, StoreError> {
        let id = self.loader.queue_request(
            &self.cache_path,
            entry.offset,
            entry.size as usize,
            LoadPriority::Normal,
        )?;

        match self.loader.sync_request(id)? {
            LoadResult::Loaded(data) => {
                if data.len() != entry.size as usize {
                    warn!(
                        path = %entry.path,
                        offset = entry.offset,
                        expected = entry.size,
                        read = data.len(),
                        cache = %self.cache_path.display(),
                        "Short read of cache entry"
                    );
                }
                Ok(data)
            }
            LoadResult::FileMissing => Err(StoreError::FileMissing(self.cache_path.clone())),
        }
    }

    /// Read an entry's bytes, failing unless exactly `entry.size` bytes
    /// come back.
    pub fn read_entry_exact(&self, entry: &CacheEntry) -> Result<Vec<u8>, StoreError> {
        let data = self.read_entry(entry)?;
        if data.len() != entry.size as usize {
            return Err(StoreError::ShortRead {
                path: entry.path.clone(),
                sub_data_index: entry.sub_data_index,
                expected: entry.size,
                read: data.len(),
            });
        }
        Ok(data)
    }
}
