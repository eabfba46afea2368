//! Output settings file support

use crate::audio::DEFAULT_WATER_LEVEL;
use crate::video::DEFAULT_WORKERS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Settings file name searched for next to the executable
pub const SETTINGS_FILE_NAME: &str = "sdiout.toml";

/// Output settings loaded from a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Resolution key, e.g. "1920 x 1080"
    pub resolution: String,

    /// Refresh rate label, e.g. "60.0" or "23.976"
    pub refresh_rate: String,

    /// Pixel format name, e.g. "10 bit RGB"
    pub pixel_format: String,

    /// Buffered sample frames at or below which audio is topped up
    pub audio_water_level: u32,

    /// Audio delay relative to video in milliseconds (may be negative)
    pub audio_sync_delay_ms: i64,

    /// Start output as soon as the settings are applied
    pub auto_start: bool,

    /// Worker threads for pixel conversion
    pub converter_threads: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    pub log_file: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            resolution: "1920 x 1080".to_string(),
            refresh_rate: "60.0".to_string(),
            pixel_format: "10 bit RGB".to_string(),
            audio_water_level: DEFAULT_WATER_LEVEL,
            audio_sync_delay_ms: 0,
            auto_start: false,
            converter_threads: DEFAULT_WORKERS,
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl OutputSettings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        let settings = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Load settings from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: sdiout.toml
    /// 2. The user config directory: sdiout/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in Self::default_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        debug!("No settings file found, using defaults");
        Ok(Self::default())
    }

    /// Candidate settings paths, in search order
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                paths.push(exe_dir.join(SETTINGS_FILE_NAME));
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("sdiout").join("config.toml"));
        }
        paths
    }

    /// Save settings to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Log file as a path, if one is configured
    pub fn log_path(&self) -> Option<PathBuf> {
        if self.log_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.log_file))
        }
    }

    /// Generate a sample settings file content
    pub fn sample_config() -> String {
        r#"# sdiout output settings

# Output resolution, as listed by `sdiout modes`
resolution = "1920 x 1080"

# Refresh rate for the resolution, as listed by `sdiout rates`
refresh_rate = "60.0"

# Pixel format: "10 bit RGB", "10 bit RGB-LE", "12 bit RGB", "12 bit RGB-LE"
pixel_format = "10 bit RGB"

# Top up the card's audio buffer at or below this many sample frames (default: 4096)
audio_water_level = 4096

# Delay audio relative to video, in milliseconds; negative plays it earlier
audio_sync_delay_ms = 0

# Start output as soon as the device is initialized
auto_start = false

# Pixel conversion worker threads (default: 8)
converter_threads = 8

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = no file logging)
log_file = ""
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading/writing settings file
    #[error("Failed to access settings file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing TOML
    #[error("Failed to parse settings file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// Error serializing settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[source] toml::ser::Error),
}
