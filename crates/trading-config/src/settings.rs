//! Configuration structures.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trading_core::error::TradingError;
use trading_core::types::ListedContract;
use trading_runtime::{
    InstrumentKind, MarketHoursConfig, RetryConfig, SizingConfig, StrategyFactory, TraderConfig,
};
use trading_strategies::StrategyRegistry;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub trader: TraderConfig,
    #[serde(default)]
    pub market_hours: MarketHoursConfig,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Listed futures contracts, used to resolve front months
    #[serde(default)]
    pub contracts: Vec<ListedContract>,
}

/// General app settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub name: String,
    pub environment: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "breakout-trader".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Directory for daily log files; console only when unset
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

/// Brokerage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub paper: PaperSettings,
}

/// Simulated account used by the paper brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub initial_cash: Decimal,
    /// Percentage of the trade price
    pub slippage_pct: Decimal,
    /// Per unit filled
    pub commission: Decimal,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            initial_cash: dec!(100000),
            slippage_pct: dec!(0.05),
            commission: Decimal::ZERO,
        }
    }
}

/// Which strategy to run, and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// Registry key, e.g. `range_breakout`
    pub name: String,
    /// Strategy parameters; missing fields take their defaults
    pub params: serde_json::Value,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            name: "range_breakout".to_string(),
            params: serde_json::Value::Null,
        }
    }
}

impl AppConfig {
    /// Check every section, reporting the first problem found.
    pub fn validate(&self) -> Result<(), TradingError> {
        let invalid = |section: &str, msg: String| {
            TradingError::Configuration(format!("{}: {}", section, msg))
        };

        self.trader.validate().map_err(|e| invalid("trader", e))?;
        self.market_hours
            .validate()
            .map_err(|e| invalid("market_hours", e))?;
        self.retry.validate().map_err(|e| invalid("retry", e))?;
        self.sizing.validate().map_err(|e| invalid("sizing", e))?;

        let paper = &self.broker.paper;
        if paper.initial_cash <= Decimal::ZERO {
            return Err(invalid(
                "broker.paper",
                format!("initial_cash must be positive, got {}", paper.initial_cash),
            ));
        }
        if paper.slippage_pct < Decimal::ZERO || paper.commission < Decimal::ZERO {
            return Err(invalid(
                "broker.paper",
                "slippage and commission must not be negative".into(),
            ));
        }

        let registry = StrategyRegistry::new();
        registry
            .create(&self.strategy.name, self.strategy.params.clone())
            .map_err(|e| invalid("strategy", e.to_string()))?;

        for instrument in &self.trader.instruments {
            if instrument.kind == InstrumentKind::Future
                && !self.contracts.iter().any(|c| c.class == instrument.symbol)
            {
                return Err(invalid(
                    "contracts",
                    format!("no listed contracts for futures class {}", instrument.symbol),
                ));
            }
        }
        for contract in &self.contracts {
            if contract.last_trade_date < contract.listed_date {
                return Err(invalid(
                    "contracts",
                    format!("{} expires before it is listed", contract.code),
                ));
            }
        }

        Ok(())
    }

    /// Factory producing a fresh strategy per instrument.
    pub fn strategy_factory(&self) -> StrategyFactory {
        let name = self.strategy.name.clone();
        let params = self.strategy.params.clone();
        Box::new(move || StrategyRegistry::new().create(&name, params.clone()))
    }
}
