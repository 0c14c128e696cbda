//! Runtime configuration for asset-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache locations, loader tuning and preprocessing defaults live here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "asset-cache", about = "Inspect per-platform asset caches")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "asset-cache.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List the table of contents of one cache.
    Inspect {
        /// Cache name (e.g. "objects", "textures").
        cache: String,

        /// Target platform.
        platform: String,
    },

    /// Read the raw bytes of one cache entry.
    Read {
        /// Cache name.
        cache: String,

        /// Target platform.
        platform: String,

        /// Asset path of the entry.
        path: String,

        /// Sub-data index of the entry.
        #[arg(long, default_value_t = 0)]
        sub_index: u32,

        /// Write the bytes to this file instead of printing a summary.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache file locations.
    pub cache: CacheConfig,

    /// Source asset locations.
    pub source: SourceConfig,

    /// Background loader settings.
    pub loader: LoaderConfig,

    /// Preprocessing defaults.
    pub preprocess: PreprocessConfig,
}

/// Where cache files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory; each platform gets a subdirectory holding
    /// `<name>.toc` and `<name>.cache`.
    pub root: PathBuf,

    /// Name of the cache holding object records.
    pub object_cache_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("Cache"),
            object_cache_name: "objects".to_string(),
        }
    }
}

/// Where resource source files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory that resource source paths are relative to.
    pub data_dir: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("Data"),
        }
    }
}

/// Disk loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Name given to the worker thread.
    pub worker_name: String,

    /// Initial number of request slots.
    pub request_pool_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_name: "asset-cache-loader".to_string(),
            request_pool_capacity: 64,
        }
    }
}

/// Preprocessing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Drop in-memory preprocessed data once it has been cached.
    pub evict_after_cache: bool,

    /// Platform the process itself runs on. After a resource is
    /// regenerated, this platform's persistent data is handed back to it.
    pub current_platform: Option<String>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            evict_after_cache: true,
            current_platform: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Configuration rooted in one directory: caches under `<dir>/cache`,
    /// sources under `<dir>/data`.
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        let mut config = Config::default();
        config.cache.root = dir.join("cache");
        config.source.data_dir = dir.join("data");
        config
    }
}
