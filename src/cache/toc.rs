//! Table-of-contents file codec.
//!
//! ```text
//! u32 magic | u32 version | u32 entry_count |
//!   entry_count × (u16 path_len | path | u32 sub_index | u64 offset | i64 timestamp | u32 size)
//! ```
//!
//! Tables are written little-endian. A table whose magic reads back
//! byte-swapped was written by a big-endian host and is decoded as such.

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use tracing::{info, warn};

use crate::cache::entry::{AssetPath, CacheEntry, EntryKey};
use crate::cache::record::ByteOrder;
use crate::cache::store::StoreError;

/// TOC header magic.
pub const TOC_MAGIC: u32 = 0xcac4_e70c;

/// TOC header magic as seen from a host of the other byte order.
pub const TOC_MAGIC_SWAPPED: u32 = 0x0ce7_c4ca;

/// Highest TOC format version this build reads and the one it writes.
pub const TOC_VERSION: u32 = 0;

/// In-memory table of contents.
///
/// Entries keep their insertion order (the order they are persisted in);
/// lookups go through the key index.
#[derive(Debug, Default, Clone)]
pub struct TableOfContents {
    entries: Vec<CacheEntry>,
    index: HashMap<EntryKey, usize>,
}

impl TableOfContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &EntryKey) -> Option<&CacheEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    /// Insert or overwrite an entry, returning the entry it replaced.
    pub fn upsert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let key = entry.key();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i], entry)),
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
                None
            }
        }
    }

    /// Undo an `upsert`: restore the replaced entry, or drop a fresh one.
    pub fn revert(&mut self, key: &EntryKey, previous: Option<CacheEntry>) {
        match previous {
            Some(previous) => {
                if let Some(&i) = self.index.get(key) {
                    self.entries[i] = previous;
                }
            }
            None => {
                if let Some(i) = self.index.remove(key) {
                    self.entries.remove(i);
                    for slot in self.index.values_mut() {
                        if *slot > i {
                            *slot -= 1;
                        }
                    }
                }
            }
        }
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the table.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| StoreError::TocCorrupt("too many entries".to_string()))?;

        let mut out = Vec::with_capacity(12 + self.entries.len() * 40);
        out.put_u32_le(TOC_MAGIC);
        out.put_u32_le(TOC_VERSION);
        out.put_u32_le(count);

        for entry in &self.entries {
            let path = entry.path.as_str().as_bytes();
            let path_len = u16::try_from(path.len())
                .map_err(|_| StoreError::PathTooLong(entry.path.clone()))?;
            out.put_u16_le(path_len);
            out.put_slice(path);
            out.put_u32_le(entry.sub_data_index);
            out.put_u64_le(entry.offset);
            out.put_i64_le(entry.timestamp);
            out.put_u32_le(entry.size);
        }

        Ok(out)
    }

    /// Parse a table read from disk.
    pub fn decode(data: &[u8]) -> Result<Self, StoreError> {
        let mut reader = TocReader {
            buf: data,
            order: ByteOrder::Little,
        };

        let magic = reader.u32("the header magic")?;
        reader.order = match magic {
            TOC_MAGIC => ByteOrder::Little,
            TOC_MAGIC_SWAPPED => {
                warn!("TOC uses swapped byte order, decoding big-endian");
                ByteOrder::Big
            }
            other => {
                return Err(StoreError::TocCorrupt(format!(
                    "invalid file magic {other:#010x}"
                )))
            }
        };

        let version = reader.u32("the cache version number")?;
        if version > TOC_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                supported: TOC_VERSION,
            });
        }

        let count = reader.u32("the number of entries")? as usize;
        let mut toc = TableOfContents {
            entries: Vec::with_capacity(count.min(data.len() / 26)),
            index: HashMap::new(),
        };

        for _ in 0..count {
            let path_len = reader.u16("entry path size")? as usize;
            let path_bytes = reader.bytes(path_len, "entry path")?;
            let path = std::str::from_utf8(path_bytes)
                .map_err(|_| StoreError::TocCorrupt("entry path is not valid UTF-8".to_string()))?;
            if path.is_empty() {
                return Err(StoreError::TocCorrupt("empty entry path".to_string()));
            }

            let entry = CacheEntry {
                path: AssetPath::new(path),
                sub_data_index: reader.u32("entry sub-data index")?,
                offset: reader.u64("entry offset")?,
                timestamp: reader.i64("entry timestamp")?,
                size: reader.u32("entry size")?,
            };

            if toc.find(&entry.key()).is_some() {
                return Err(StoreError::DuplicateEntry {
                    path: entry.path,
                    sub_data_index: entry.sub_data_index,
                });
            }
            toc.upsert(entry);
        }

        if reader.buf.has_remaining() {
            info!(trailing = reader.buf.remaining(), "Ignoring trailing bytes after TOC entries");
        }

        Ok(toc)
    }
}

/// Bounds-checked field reader.
struct TocReader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> TocReader<'a> {
    fn need(&self, len: usize, what: &str) -> Result<(), StoreError> {
        if self.buf.remaining() < len {
            return Err(StoreError::TocCorrupt(format!(
                "not enough bytes in the TOC file for {what}"
            )));
        }
        Ok(())
    }

    fn u16(&mut self, what: &str) -> Result<u16, StoreError> {
        self.need(2, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u16_le(),
            ByteOrder::Big => self.buf.get_u16(),
        })
    }

    fn u32(&mut self, what: &str) -> Result<u32, StoreError> {
        self.need(4, what)?;
        Ok(self.order.get_u32(&mut self.buf))
    }

    fn u64(&mut self, what: &str) -> Result<u64, StoreError> {
        self.need(8, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_u64_le(),
            ByteOrder::Big => self.buf.get_u64(),
        })
    }

    fn i64(&mut self, what: &str) -> Result<i64, StoreError> {
        self.need(8, what)?;
        Ok(match self.order {
            ByteOrder::Little => self.buf.get_i64_le(),
            ByteOrder::Big => self.buf.get_i64(),
        })
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8], StoreError> {
        self.need(len, what)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}
