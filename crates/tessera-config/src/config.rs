//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport and session settings.
    pub network: NetworkConfig,
    /// Interest grid settings.
    pub scene: SceneConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// How sessions decide that a network tick is due.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpdateCheckType {
    /// `update_period` is measured in milliseconds of wall-clock time.
    #[default]
    Time,
    /// `update_period` is measured in frames.
    Frame,
}

/// Network/multiplayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address clients connect to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Maximum concurrent connections (server only).
    pub max_connections: usize,
    /// Time- or frame-driven session updates.
    pub update_check: UpdateCheckType,
    /// Session update period, in ms or frames depending on `update_check`.
    pub update_period: u64,
    /// Minimum interval between synchronize snapshots in Time mode.
    pub synchronize_interval_ms: u64,
    /// Inbound events processed per node per tick in Time mode.
    pub max_read_events_per_tick: usize,
    /// Message buffers preallocated by the pool.
    pub message_pool_size: usize,
    /// Frames buffered from the I/O thread to the user thread, per connection.
    pub inbound_queue_capacity: usize,
    /// Frames buffered from the user thread to the I/O thread, per connection.
    pub outbound_queue_capacity: usize,
    /// Frames allowed to wait behind a full outbound queue before the
    /// connection is dropped.
    pub max_outbound_backlog: usize,
}

/// Interest grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    /// Cells per side of the square grid.
    pub grid_size: u32,
    /// World-space side length of one cell.
    pub cell_length: f32,
    /// In Time mode, run a synchronization pass every this many scene ticks.
    pub synchronize_every_ticks: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter override (e.g. "debug", "info,tessera_net=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            max_connections: 256,
            update_check: UpdateCheckType::Time,
            update_period: 50,
            synchronize_interval_ms: 100,
            max_read_events_per_tick: 40,
            message_pool_size: 128,
            inbound_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            max_outbound_backlog: 1024,
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            grid_size: 64,
            cell_length: 256.0,
            synchronize_every_ticks: 24,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// `host:port` string for the configured server endpoint.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

/// Per-user configuration directory (`<config_dir>/tessera`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("tessera"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("server_port: 7777"));
        assert!(ron_str.contains("grid_size: 64"));
        assert!(ron_str.contains("update_check: Time"));
    }

    #[test]
    fn test_defaults_match_session_timing() {
        let network = NetworkConfig::default();
        assert_eq!(network.update_period, 50);
        assert_eq!(network.synchronize_interval_ms, 100);
        assert_eq!(network.max_read_events_per_tick, 40);
        assert_eq!(network.message_pool_size, 128);
        assert_eq!(SceneConfig::default().cell_length, 256.0);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.network.update_check = UpdateCheckType::Frame;
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (server_port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.server_port, 9000);
        assert_eq!(config.network.max_connections, 256);
        assert_eq!(config.scene, SceneConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.scene.grid_size = 32;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.server_port = 8000;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().network.server_port, 8000);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_server_endpoint() {
        let network = NetworkConfig::default();
        assert_eq!(network.server_endpoint(), "127.0.0.1:7777");
    }
}
