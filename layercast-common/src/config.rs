//! Bootstrap configuration loading and root folder resolution
//!
//! Settings sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (`LAYERCAST_ROOT_FOLDER`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "LAYERCAST_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML
///
/// Every field has a built-in default, so an empty file is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for session data (layer snapshots, configs, results)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Generation engine tuning
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Artifact storage settings
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Generation engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Width and height of the square output canvas in pixels
    pub canvas_size: u32,
    /// Items composited and uploaded together before a progress update
    pub batch_size: usize,
    /// Worker limit inside a batch (0 = available CPU cores)
    pub concurrency: usize,
    /// Idle sessions older than this are evicted
    pub session_ttl_secs: u64,
    /// Largest accepted target supply
    pub max_supply: usize,
    /// Largest accepted royalty percentage
    pub max_royalties: f64,
    /// Largest accepted number of traits in one layer
    pub max_traits_per_layer: usize,
    /// Largest accepted trait image width/height in pixels
    pub max_image_dimension: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            canvas_size: 512,
            batch_size: 100,
            concurrency: 0,
            session_ttl_secs: 3600,
            max_supply: 10_000,
            max_royalties: 25.0,
            max_traits_per_layer: 100,
            max_image_dimension: 2048,
        }
    }
}

impl GenerationSettings {
    /// Concurrency limit with `0` resolved to the number of available cores
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Session time-to-live as a duration
    pub fn session_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_ttl_secs)
    }
}

/// Artifact storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// URI prefix returned for stored objects
    pub base_uri: String,
    /// Directory objects are written to (defaults to `<root_folder>/storage`)
    pub output_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_uri: "file://storage".to_string(),
            output_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    validate_config(&config)?;
    debug!(path = %path.display(), "Loaded TOML config");
    Ok(config)
}

/// Load configuration from an explicit path, the default location, or defaults
///
/// An explicit path that cannot be read is an error; a missing default
/// config file is not.
pub fn load_or_default(explicit: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = explicit {
        return load_toml_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Using config file");
            load_toml_config(&path)
        }
        _ => {
            debug!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Write configuration to disk atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!(path = %path.display(), error = %e, "Atomic rename failed");
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Io(e));
    }
    Ok(())
}

/// Reject values no engine component can work with
fn validate_config(config: &TomlConfig) -> Result<()> {
    let generation = &config.generation;
    if generation.canvas_size == 0 {
        return Err(Error::Config("generation.canvas_size must be > 0".to_string()));
    }
    if generation.batch_size == 0 {
        return Err(Error::Config("generation.batch_size must be > 0".to_string()));
    }
    if generation.max_supply == 0 {
        return Err(Error::Config("generation.max_supply must be > 0".to_string()));
    }
    if !generation.max_royalties.is_finite() || generation.max_royalties < 0.0 {
        return Err(Error::Config(
            "generation.max_royalties must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Default configuration file path (`<config_dir>/layercast/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("layercast").join("config.toml"))
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("layercast"))
        .unwrap_or_else(|| PathBuf::from("./layercast_data"))
}
