//! Background disk reads.
//!
//! - [`disk_loader`]: single-worker loader with sync, try-sync and async waits
//! - [`request_pool`]: generation-checked slots for in-flight requests

pub mod disk_loader;
pub mod request_pool;
