use std::time::Duration;

use bevy::log::warn;
use bevy::prelude::Resource;
use network::{ConnectionSettings, DEFAULT_ENDPOINT, DEFAULT_RECONNECT_DELAY};
use serde::Deserialize;
use tiles::TileSettings;

use ::config::builder::{ConfigBuilder, DefaultState};
use ::config::{Config, Environment, File, FileFormat};

const CONFIG_BASENAME: &str = "config";

#[derive(Debug, Clone, Deserialize, Resource)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub tiles: TileSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                endpoint: DEFAULT_ENDPOINT.to_string(),
                reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            },
            tiles: TileSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub endpoint: String,
    pub reconnect_delay_ms: u64,
}

impl NetworkConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings::new(self.endpoint.clone())
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
    }
}

pub fn load_config() -> AppConfig {
    match load_config_inner() {
        Ok(config) => config,
        Err(error) => {
            warn!("Failed to load config, using defaults: {error}");
            AppConfig::default()
        }
    }
}

fn load_config_inner() -> Result<AppConfig, ::config::ConfigError> {
    let builder = with_defaults()?
        .add_source(File::new(CONFIG_BASENAME, FileFormat::Toml).required(false))
        .add_source(File::new(CONFIG_BASENAME, FileFormat::Ron).required(false))
        .add_source(Environment::with_prefix("HEXMAP").separator("__"));

    builder.build()?.try_deserialize()
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ::config::ConfigError> {
    let defaults = AppConfig::default();

    Config::builder()
        .set_default("network.endpoint", defaults.network.endpoint)?
        .set_default("network.reconnect_delay_ms", defaults.network.reconnect_delay_ms)?
        .set_default(
            "tiles.default_terrain",
            defaults.tiles.default_terrain.to_string(),
        )?
        .set_default("tiles.click_terrain", defaults.tiles.click_terrain.to_string())
}

#[cfg(test)]
mod tests {
    use network::Terrain;

    use super::*;

    fn load_from_toml(toml: &str) -> Result<AppConfig, ::config::ConfigError> {
        with_defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_defaults() {
        let config = load_from_toml("").expect("defaults deserialize");
        assert_eq!(config.network.endpoint, "ws://localhost:9001/ws");
        assert_eq!(
            config.network.connection_settings().reconnect_delay,
            Duration::from_secs(3)
        );
        assert_eq!(config.tiles.default_terrain, Terrain::Wild);
        assert_eq!(config.tiles.click_terrain, Terrain::Slime);
    }

    #[test]
    fn test_file_overrides() {
        let config = load_from_toml(
            r#"
            [network]
            endpoint = "ws://game.example:7000/ws"
            reconnect_delay_ms = 500

            [tiles]
            default_terrain = "Slime"
            click_terrain = "Turret"
            "#,
        )
        .expect("config deserializes");

        let settings = config.network.connection_settings();
        assert_eq!(settings.endpoint, "ws://game.example:7000/ws");
        assert_eq!(settings.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.tiles.default_terrain, Terrain::Slime);
        assert_eq!(config.tiles.click_terrain, Terrain::Turret);
    }

    #[test]
    fn test_unknown_terrain_is_an_error() {
        assert!(load_from_toml("[tiles]\nclick_terrain = \"Lava\"").is_err());
    }
}
