//! Object record codec.
//!
//! One record is cached per object per platform under sub-data index 0:
//!
//! ```text
//! u32 property_length | property bytes | [persistent bytes | u32 sub_data_count]
//! ```
//!
//! The bracketed tail is only present for resources. The `u32` fields use
//! the target platform's byte order.

use bytes::{Buf, BufMut};
use thiserror::Error;
use tracing::warn;

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();
const SUB_DATA_COUNT: usize = std::mem::size_of::<u32>();

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is {0} bytes, too small for the property length prefix")]
    TooSmall(usize),

    #[error("record has no room for the resource sub-data count ({remaining} bytes left)")]
    MissingSubDataCount { remaining: usize },

    #[error("{what} is {len} bytes, exceeding the 32-bit record limit")]
    TooLarge { what: &'static str, len: usize },
}

/// Byte order of multi-byte fields in cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the host.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Byte order for a target, given whether it swaps relative to the host.
    pub fn for_target(swap_bytes: bool) -> Self {
        if swap_bytes {
            Self::native().swapped()
        } else {
            Self::native()
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    pub(crate) fn put_u32(self, buf: &mut impl BufMut, value: u32) {
        match self {
            ByteOrder::Little => buf.put_u32_le(value),
            ByteOrder::Big => buf.put_u32(value),
        }
    }

    pub(crate) fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            ByteOrder::Little => buf.get_u32_le(),
            ByteOrder::Big => buf.get_u32(),
        }
    }
}

/// Persistent resource data and the number of sub-data chunks stored
/// alongside it in the resource cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceSection {
    pub persistent: Vec<u8>,
    pub sub_data_count: u32,
}

/// A cached object record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectRecord {
    /// Serialized object properties.
    pub properties: Vec<u8>,

    /// Resource tail, present for resources with loaded data.
    pub resource: Option<ResourceSection>,
}

impl ObjectRecord {
    /// Encode the record using the given byte order.
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, RecordError> {
        let property_len = checked_u32("property data", self.properties.len())?;

        let tail = self
            .resource
            .as_ref()
            .map(|r| r.persistent.len() + SUB_DATA_COUNT)
            .unwrap_or(0);
        let total = LENGTH_PREFIX + self.properties.len() + tail;
        checked_u32("object record", total)?;

        let mut out = Vec::with_capacity(total);
        order.put_u32(&mut out, property_len);
        out.put_slice(&self.properties);

        if let Some(resource) = &self.resource {
            out.put_slice(&resource.persistent);
            order.put_u32(&mut out, resource.sub_data_count);
        }

        Ok(out)
    }

    /// Decode a plain object record (no resource tail).
    ///
    /// An oversized property length is clamped to the available bytes.
    pub fn decode_object(data: &[u8], order: ByteOrder) -> Result<Self, RecordError> {
        let (properties, _) = split_properties(data, order)?;
        Ok(Self {
            properties: properties.to_vec(),
            resource: None,
        })
    }

    /// Decode a resource record: properties, persistent data and the
    /// trailing sub-data count.
    pub fn decode_resource(data: &[u8], order: ByteOrder) -> Result<Self, RecordError> {
        let (properties, mut rest) = split_properties(data, order)?;

        if rest.len() < SUB_DATA_COUNT {
            return Err(RecordError::MissingSubDataCount {
                remaining: rest.len(),
            });
        }

        let persistent_len = rest.len() - SUB_DATA_COUNT;
        let persistent = rest[..persistent_len].to_vec();
        rest.advance(persistent_len);
        let sub_data_count = order.get_u32(&mut rest);

        Ok(Self {
            properties: properties.to_vec(),
            resource: Some(ResourceSection {
                persistent,
                sub_data_count,
            }),
        })
    }
}

/// Split off the length-prefixed property block, returning it and the rest.
fn split_properties(data: &[u8], order: ByteOrder) -> Result<(&[u8], &[u8]), RecordError> {
    if data.len() < LENGTH_PREFIX {
        return Err(RecordError::TooSmall(data.len()));
    }

    let mut buf = data;
    let declared = order.get_u32(&mut buf) as usize;

    let property_len = if declared > buf.len() {
        warn!(
            declared,
            available = buf.len(),
            "Property data extends past the end of its record, clamping"
        );
        buf.len()
    } else {
        declared
    };

    Ok(buf.split_at(property_len))
}

fn checked_u32(what: &'static str, len: usize) -> Result<u32, RecordError> {
    u32::try_from(len).map_err(|_| RecordError::TooLarge { what, len })
}
