//! Cache entry types: asset paths, platform identifiers and table entries.
//!
//! An entry maps `(asset path, sub-data index)` to a byte range in a
//! platform's blob file, stamped with the timestamp it was built from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cached object, e.g. `"Entities/Hero"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetPath(String);

impl AssetPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AssetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Identifies a target platform (`"pc"`, `"ps3"`, ...).
///
/// Also used as the per-platform directory name under the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformId(String);

impl PlatformId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lookup key of a table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub path: AssetPath,
    pub sub_data_index: u32,
}

impl EntryKey {
    pub fn new(path: AssetPath, sub_data_index: u32) -> Self {
        Self {
            path,
            sub_data_index,
        }
    }
}

/// A single table-of-contents entry.
///
/// The timestamp is the only staleness authority: an entry is current
/// when its timestamp equals the object's authoritative timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cached object identity.
    pub path: AssetPath,

    /// Sub-data chunk index (0 for object records).
    pub sub_data_index: u32,

    /// Timestamp the cached bytes were built from.
    pub timestamp: i64,

    /// Byte offset of the data within the blob file.
    pub offset: u64,

    /// Size of the data in bytes.
    pub size: u32,
}

impl CacheEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.path.clone(), self.sub_data_index)
    }

    /// Byte range covered in the blob file.
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + u64::from(self.size)
    }
}
