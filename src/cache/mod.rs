//! Per-platform cache storage.
//!
//! - [`entry`]: asset paths, platform ids and table entries
//! - [`toc`]: the table of contents and its on-disk format
//! - [`store`]: one cache (TOC + append-only blob) for one platform
//! - [`registry`]: opens stores by name and platform
//! - [`record`]: the object record written into the object cache

pub mod entry;
pub mod record;
pub mod registry;
pub mod store;
pub mod toc;
