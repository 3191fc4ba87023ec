//! Configuration management for the traffic analysis service.
//!
//! Loads application configuration from a TOML file and environment
//! variable overrides.

use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from `CONFIG_FILE` (default `config/default.toml`)
/// with environment overrides (`SERVER__PORT=9090` style).
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        // No CONFIG_FILE present in the test environment: the loader
        // still produces a complete, valid default configuration.
        let config = load_config().expect("defaults load");
        assert_eq!(config.analysis.detection.window_secs, 60);
        assert!(config.validate().is_ok());
    }
}
