//! Incremental preprocessing of objects and resources into the caches.
//!
//! - [`asset`]: the object and resource traits the orchestrator consumes
//! - [`platform`]: platform codecs
//! - [`handler`]: per-resource-type regeneration
//! - [`orchestrator`]: staleness checks, regeneration and cache writes

pub mod asset;
pub mod handler;
pub mod orchestrator;
pub mod platform;
