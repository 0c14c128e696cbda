//! asset-cache: inspect per-platform asset caches.
//!
//! Lists a cache's table of contents, or reads one entry's bytes through
//! the background disk loader.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use asset_cache::cache::entry::{AssetPath, PlatformId};
use asset_cache::cache::registry::CacheRegistry;
use asset_cache::config::{Cli, Command, Config};
use asset_cache::transfer::disk_loader::{DiskLoader, LoadPriority, LoadResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "asset_cache=debug"
    } else {
        "asset_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("asset-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(&cli.config)?);
    info!(
        cache_root = %config.cache.root.display(),
        data_dir = %config.source.data_dir.display(),
        "Configuration loaded"
    );

    let loader = DiskLoader::start_new(&config.loader)?;
    let mut registry = CacheRegistry::new(config.cache.root.clone(), Arc::clone(&loader));

    match cli.command {
        Command::Inspect { cache, platform } => {
            let platform = PlatformId::new(platform);
            let store = registry.get_cache(&cache, &platform);
            store.enforce_table_load();

            println!(
                "{} ({} entries)",
                store.toc_path().display(),
                store.entries().len()
            );
            for entry in store.entries() {
                println!(
                    "{}\t{}\toffset={}\tsize={}\ttimestamp={}",
                    entry.path, entry.sub_data_index, entry.offset, entry.size, entry.timestamp
                );
            }
        }

        Command::Read {
            cache,
            platform,
            path,
            sub_index,
            output,
        } => {
            let platform = PlatformId::new(platform);
            let path = AssetPath::new(path);
            let store = registry.get_cache(&cache, &platform);

            let entry = store
                .find_entry(&path, sub_index)
                .cloned()
                .with_context(|| format!("no entry for {path} sub-data {sub_index} in {cache}/{platform}"))?;

            let id = loader.queue_request(
                store.cache_path(),
                entry.offset,
                entry.size as usize,
                LoadPriority::High,
            )?;

            let data = match loader.wait(id).await? {
                LoadResult::Loaded(data) => data,
                LoadResult::FileMissing => {
                    anyhow::bail!("blob file {} is missing", store.cache_path().display())
                }
            };
            if data.len() != entry.size as usize {
                warn!(expected = entry.size, read = data.len(), "Short read from blob file");
            }

            match output {
                Some(output) => {
                    std::fs::write(&output, &data)
                        .with_context(|| format!("failed to write {}", output.display()))?;
                    info!(bytes = data.len(), output = %output.display(), "Entry written");
                }
                None => println!(
                    "{path}\t{sub_index}\t{} bytes\ttimestamp={}",
                    data.len(),
                    entry.timestamp
                ),
            }
        }
    }

    loader.stop();
    Ok(())
}
