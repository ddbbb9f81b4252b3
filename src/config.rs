// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Device and logging settings. Every section falls back to defaults, so a
// missing or partial config.toml still yields a usable device.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Shaders shipped with the crate
pub const BUILTIN_SHADER_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders");

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub log: LogConfig,
}

/// Which backend engine drives the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// wgpu: single implicit context, per-dispatch binding
    Immediate,
    /// Vulkan: explicit streams, cached descriptor sets, barriers
    Explicit,
}

impl std::fmt::Display for RendererKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendererKind::Immediate => write!(f, "immediate"),
            RendererKind::Explicit => write!(f, "explicit"),
        }
    }
}

/// Device settings, held by the device for its whole lifetime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: RendererKind,
    /// Files or directories of .wgsl shaders loaded at initialization
    pub shader_paths: Vec<PathBuf>,
    /// Enable API validation (wgpu validation / Vulkan validation layer)
    pub debug_layer: bool,
    /// Wrap recorded work in debug groups named by debug markers
    pub capture: bool,
    /// Prefer a software adapter (WARP-like fallback / CPU Vulkan driver)
    pub software_adapter: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: RendererKind::Immediate,
            shader_paths: vec![PathBuf::from(BUILTIN_SHADER_DIR)],
            debug_layer: cfg!(debug_assertions),
            capture: false,
            software_adapter: false,
        }
    }
}

impl DeviceConfig {
    pub fn new(backend: RendererKind) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    None,
    WarnError,
    Normal,
    Full,
}

impl LogLevel {
    pub fn filter(self) -> log::LevelFilter {
        match self {
            LogLevel::None => log::LevelFilter::Off,
            LogLevel::WarnError => log::LevelFilter::Warn,
            LogLevel::Normal => log::LevelFilter::Info,
            LogLevel::Full => log::LevelFilter::Trace,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Normal,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is
    /// missing or malformed
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [device]
            backend = "explicit"
            capture = true
            "#,
        )
        .unwrap();

        assert_eq!(config.device.backend, RendererKind::Explicit);
        assert!(config.device.capture);
        assert!(!config.device.software_adapter);
        assert_eq!(config.device.shader_paths, vec![PathBuf::from(BUILTIN_SHADER_DIR)]);
        assert_eq!(config.log.level, LogLevel::Normal);
    }

    #[test]
    fn log_levels_map_to_filters() {
        let config: Config = toml::from_str("[log]\nlevel = \"warn_error\"").unwrap();
        assert_eq!(config.log.level.filter(), log::LevelFilter::Warn);
        assert_eq!(LogLevel::None.filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Full.filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.device.backend, RendererKind::Immediate);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device\nbackend = 3").unwrap();
        assert!(Config::load_from_path(&path).is_err());

        let fallback = Config::load(&path);
        assert_eq!(fallback.device.backend, RendererKind::Immediate);
    }
}
