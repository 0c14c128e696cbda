//! Platform codec collaborator.

use crate::cache::record::ByteOrder;

/// Knows a target platform's byte order and platform-specific transforms.
///
/// Registering a codec for a platform enables caching for that platform.
pub trait PlatformCodec: Send + Sync {
    /// Whether the target's byte order differs from the host's.
    fn swap_bytes(&self) -> bool;

    /// Byte order used for this platform's cached records.
    fn byte_order(&self) -> ByteOrder {
        ByteOrder::for_target(self.swap_bytes())
    }
}

/// Codec for a platform that shares the host's byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

impl PlatformCodec for NativeCodec {
    fn swap_bytes(&self) -> bool {
        false
    }
}

/// Codec for a platform with the opposite byte order to the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwappedCodec;

impl PlatformCodec for SwappedCodec {
    fn swap_bytes(&self) -> bool {
        true
    }
}
