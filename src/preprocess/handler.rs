//! Resource handler collaborator.

use std::path::Path;

use crate::preprocess::asset::Resource;
use crate::preprocess::orchestrator::CacheOrchestrator;

/// Converts one resource type's source data into preprocessed bytes.
///
/// An implementation fills the resource's [`PreprocessedData`] for every
/// platform the orchestrator has a codec for (see
/// [`CacheOrchestrator::platforms`]) and marks each one loaded.
///
/// [`PreprocessedData`]: crate::preprocess::asset::PreprocessedData
pub trait ResourceHandler: Send + Sync {
    /// Resource type this handler processes (matches [`Resource::resource_type`]).
    fn resource_type(&self) -> &str;

    fn cache_resource(
        &self,
        orchestrator: &CacheOrchestrator,
        resource: &mut dyn Resource,
        source_file: &Path,
    ) -> anyhow::Result<()>;
}
