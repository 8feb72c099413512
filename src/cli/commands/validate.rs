//! Validate configuration command.

use anyhow::Result;
use std::path::Path;
use trading_config::load_config;

pub async fn run(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {:?}", config_path);

    let config = load_config(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    });
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let instruments: Vec<String> = config
        .trader
        .instruments
        .iter()
        .map(|i| format!("{} ({:?})", i.symbol, i.kind))
        .collect();

    println!("Configuration is valid!");
    println!();
    println!("App: {}", config.app.name);
    println!("Environment: {}", config.app.environment);
    println!("Log level: {}", config.logging.level);
    println!("Instruments: {}", instruments.join(", "));
    println!("Bar interval: {}", config.trader.timeframe);
    println!("Lookback: {} bars", config.trader.lookback);
    println!(
        "Session: {} - {} (UTC{:+} min)",
        config.market_hours.open, config.market_hours.close, config.market_hours.utc_offset_minutes
    );
    println!(
        "Flatten: {} min before close",
        config.trader.flatten_before_close_minutes
    );
    println!("Strategy: {}", config.strategy.name);
    println!("Paper capital: {}", config.broker.paper.initial_cash);

    Ok(())
}
