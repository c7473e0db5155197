//! Configuration loader with layered sources.

use crate::{AppConfig, PersistenceBackend};
use config::{Config, ConfigError, Environment, File};
use foreman_core::ForemanError;
use std::path::Path;
use tracing::{debug, info, warn};

/// Configuration loaded once at startup.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: AppConfig,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `FOREMAN__` prefix
    pub fn new(config_dir: impl AsRef<str>) -> Result<Self, ForemanError> {
        let config = Self::load_config(config_dir.as_ref())?;
        Ok(Self { config })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, ForemanError> {
        Self::new("./config")
    }

    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<AppConfig, ForemanError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("FOREMAN_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FOREMAN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_foreman_error)?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_foreman_error)?;
        app_config.app.environment = environment;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    /// Validates the configuration.
    pub fn validate_config(config: &AppConfig) -> Result<(), ForemanError> {
        if config.server.port == 0 && config.app.environment == "production" {
            warn!("Listening on an ephemeral port in production");
        }

        if config.server.max_packet_size == 0 {
            return Err(ForemanError::Configuration(
                "server.max_packet_size must be greater than zero".to_string(),
            ));
        }

        if config.server.max_text_line == 0 {
            return Err(ForemanError::Configuration(
                "server.max_text_line must be greater than zero".to_string(),
            ));
        }

        if config.engine.hostname.is_empty() || config.engine.hostname.contains(':') {
            return Err(ForemanError::Configuration(format!(
                "engine.hostname '{}' must be non-empty and contain no ':'",
                config.engine.hostname
            )));
        }

        if config.engine.long_poll_interval_secs == 0 {
            return Err(ForemanError::Configuration(
                "engine.long_poll_interval_secs must be greater than zero".to_string(),
            ));
        }

        if config.persistence.backend == PersistenceBackend::Redis
            && config.persistence.redis.url.is_empty()
        {
            return Err(ForemanError::Configuration(
                "persistence.redis.url is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}

fn config_error_to_foreman_error(err: ConfigError) -> ForemanError {
    ForemanError::Configuration(err.to_string())
}
