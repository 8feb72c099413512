//! Configuration management.

mod settings;

pub use settings::{
    AppConfig, AppSettings, BrokerSettings, LoggingConfig, PaperSettings, StrategySettings,
};

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use std::path::Path;
use trading_core::error::TradingError;

/// Prefix of environment overrides, e.g. `TRADING__BROKER__PAPER__INITIAL_CASH`.
pub const ENV_PREFIX: &str = "TRADING";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig, TradingError> {
    let mut config: AppConfig = builder
        .build()
        .and_then(Config::try_deserialize::<AppConfig>)
        .map_err(|e: ConfigError| TradingError::Configuration(e.to_string()))?;
    // the trading date follows the exchange's calendar
    config.trader.utc_offset_minutes = config.market_hours.utc_offset_minutes;
    Ok(config)
}

/// Load configuration from file and environment.
pub fn load_config(path: &Path) -> Result<AppConfig, TradingError> {
    finish(
        Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(environment()),
    )
}

/// Load configuration from TOML text, without environment overrides.
pub fn load_config_str(toml: &str) -> Result<AppConfig, TradingError> {
    finish(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
}
