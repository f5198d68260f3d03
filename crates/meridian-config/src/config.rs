//! Server configuration with defaults and RON persistence.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside a config directory.
pub const CONFIG_FILE: &str = "server.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub world: WorldConfig,
    pub debug: DebugConfig,
}

/// Listener and wire limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    pub port: u16,
    /// Largest payload accepted in one frame; anything above is corruption.
    pub max_payload_size: u32,
    /// Connections beyond this are turned away.
    pub max_clients: usize,
}

/// Per-client timing and proximity settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Disconnect a client silent for this long.
    pub message_timeout_secs: f32,
    /// Disconnect a client without an active heartbeat for this long.
    pub activity_timeout_secs: f32,
    /// Drain window when closing a timed-out client.
    pub disconnect_linger_secs: f32,
    /// How long a freed id is remembered.
    pub recently_deleted_secs: f32,
    /// Render range a client starts with before it reports its own.
    pub initial_render_range: f32,
    /// Distance a player moves before the others are told.
    pub player_resolution: f32,
    /// Hosted in a development environment that may pause; disables timeouts.
    pub dev_host: bool,
}

/// Persistence and world settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Name of the save, without extension.
    pub save_name: String,
    pub saves_dir: PathBuf,
    /// Prefab every logged-in player is represented by.
    pub player_prefab: String,
    /// Optional prefab table (`<key> <radius> <persistent>` per line).
    pub prefab_data: Option<PathBuf>,
    /// Refuse to start without an existing save (headless deployments).
    pub require_existing_save: bool,
    /// Server ticks per second.
    pub tick_rate: u32,
    /// Seconds between automatic saves (0 = off).
    pub autosave_secs: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 6969,
            max_payload_size: 1 << 20,
            max_clients: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            message_timeout_secs: 6.0,
            activity_timeout_secs: 60.0,
            disconnect_linger_secs: 10.0,
            recently_deleted_secs: 6.0,
            initial_render_range: 0.0,
            player_resolution: 5.0,
            dev_host: false,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            save_name: "world".to_string(),
            saves_dir: default_saves_dir(),
            player_prefab: "player".to_string(),
            prefab_data: None,
            require_existing_save: false,
            tick_rate: 30,
            autosave_secs: 0,
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

/// `<platform data dir>/meridian/saves`, or `./saves` when the platform
/// reports none.
pub fn default_saves_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("meridian").join("saves"))
        .unwrap_or_else(|| PathBuf::from("saves"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the server, if the platform has one.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("meridian"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = read_config(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let write_error = |source| ConfigError::Write {
            path: config_path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_error)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&config_path, serialized).map_err(write_error)?;
        Ok(())
    }

    /// Returns `Some(new_config)` if the file on disk differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = read_config(&config_dir.join(CONFIG_FILE))?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.network.port, 6969);
        assert_eq!(config.session.message_timeout_secs, 6.0);
        assert_eq!(config.session.activity_timeout_secs, 60.0);
        assert_eq!(config.session.player_resolution, 5.0);
        assert!(!config.session.dev_host);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (port: 7000), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.max_clients, 64);
        assert_eq!(config.session, SessionConfig::default());
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
        config.world.save_name = "island".to_string();
        config.world.prefab_data = Some(PathBuf::from("server_data"));
        config.session.dev_host = true;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
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
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.network.port = 9000;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().network.port, 9000);
    }

    #[test]
    fn test_reload_without_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(&err, ConfigError::Read { path, .. } if path.ends_with(CONFIG_FILE)));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
