use bevy::log::warn;
use bevy::prelude::Resource;
use serde::Deserialize;
use tiles::AuthoritySettings;

use ::config::builder::{ConfigBuilder, DefaultState};
use ::config::{Config, Environment, File, FileFormat};

const CONFIG_BASENAME: &str = "server";

/// Port the original game server listens on; clients default to it too.
const DEFAULT_PORT: u16 = 9001;

#[derive(Debug, Clone, Deserialize, Resource)]
pub struct ServerConfig {
    pub network: ServerNetworkConfig,
    pub grid: AuthoritySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: ServerNetworkConfig { port: DEFAULT_PORT },
            grid: AuthoritySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerNetworkConfig {
    pub port: u16,
}

pub fn load_config() -> ServerConfig {
    match load_config_inner() {
        Ok(config) => config,
        Err(error) => {
            warn!("Failed to load config, using defaults: {error}");
            ServerConfig::default()
        }
    }
}

fn load_config_inner() -> Result<ServerConfig, ::config::ConfigError> {
    let builder = with_defaults()?
        .add_source(File::new(CONFIG_BASENAME, FileFormat::Toml).required(false))
        .add_source(File::new(CONFIG_BASENAME, FileFormat::Ron).required(false))
        .add_source(Environment::with_prefix("HEXMAP_SERVER").separator("__"));

    builder.build()?.try_deserialize()
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ::config::ConfigError> {
    let defaults = ServerConfig::default();

    Config::builder()
        .set_default("network.port", defaults.network.port)?
        .set_default("grid.width", defaults.grid.width)?
        .set_default("grid.height", defaults.grid.height)?
        .set_default("grid.mutation_interval_ms", defaults.grid.mutation_interval_ms)?
        .set_default("grid.mutation_samples", defaults.grid.mutation_samples as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_from_toml(toml: &str) -> Result<ServerConfig, ::config::ConfigError> {
        with_defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    #[test]
    fn test_defaults_match_the_client_endpoint() {
        let config = load_from_toml("").expect("defaults deserialize");
        assert_eq!(config.network.port, 9001);
        assert!(network::DEFAULT_ENDPOINT.contains(":9001/"));
        assert_eq!(config.grid, AuthoritySettings::default());
    }

    #[test]
    fn test_file_overrides() {
        let config = load_from_toml(
            r#"
            [network]
            port = 7000

            [grid]
            width = 8
            height = 6
            mutation_samples = 1
            "#,
        )
        .expect("config deserializes");

        assert_eq!(config.network.port, 7000);
        assert_eq!((config.grid.width, config.grid.height), (8, 6));
        assert_eq!(config.grid.mutation_samples, 1);
        assert_eq!(config.grid.mutation_interval_ms, 5000);
    }

    #[test]
    fn test_negative_port_is_an_error() {
        assert!(load_from_toml("[network]\nport = -1").is_err());
    }
}
