//! Strategy registry for dynamic strategy loading.

use crate::{RangeBreakoutConfig, RangeBreakoutStrategy, TrendBreakoutConfig, TrendBreakoutStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trading_core::{error::StrategyError, traits::Strategy, traits::StrategyConfig};

/// Information about a registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    /// Registry key
    pub key: String,
    /// Strategy name
    pub name: String,
    /// Strategy description
    pub description: String,
    /// Default configuration as JSON
    pub default_config: serde_json::Value,
}

/// Registry for available trading strategies.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, StrategyInfo>,
}

impl StrategyRegistry {
    /// Create a new strategy registry with all built-in strategies.
    pub fn new() -> Self {
        let mut strategies = BTreeMap::new();

        strategies.insert(
            "range_breakout".to_string(),
            StrategyInfo {
                key: "range_breakout".to_string(),
                name: "Range Breakout".to_string(),
                description: "Enters on a break of session open +/- k x range; exits on stop, \
                              target or opposite breakout"
                    .to_string(),
                default_config: serde_json::to_value(RangeBreakoutConfig::default())
                    .unwrap_or_default(),
            },
        );

        strategies.insert(
            "trend_breakout".to_string(),
            StrategyInfo {
                key: "trend_breakout".to_string(),
                name: "Trend Breakout".to_string(),
                description: "Long-only break of the recent high in a rising market".to_string(),
                default_config: serde_json::to_value(TrendBreakoutConfig::default())
                    .unwrap_or_default(),
            },
        );

        Self { strategies }
    }

    /// List all available strategies.
    pub fn list(&self) -> Vec<&StrategyInfo> {
        self.strategies.values().collect()
    }

    /// Get strategy info by name.
    pub fn get(&self, name: &str) -> Option<&StrategyInfo> {
        self.strategies.get(name)
    }

    /// Check if a strategy exists.
    pub fn exists(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Create a strategy instance from configuration.
    ///
    /// A `null` config means defaults; missing fields take their defaults.
    pub fn create(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        let config = if config.is_null() {
            serde_json::json!({})
        } else {
            config
        };

        match name {
            "range_breakout" => {
                let config: RangeBreakoutConfig = serde_json::from_value(config)
                    .map_err(|e| StrategyError::InvalidConfig(e.to_string()))?;
                config.validate()?;
                Ok(Box::new(RangeBreakoutStrategy::new(config)))
            }
            "trend_breakout" => {
                let config: TrendBreakoutConfig = serde_json::from_value(config)
                    .map_err(|e| StrategyError::InvalidConfig(e.to_string()))?;
                config.validate()?;
                Ok(Box::new(TrendBreakoutStrategy::new(config)))
            }
            _ => Err(StrategyError::NotFound(name.to_string())),
        }
    }

    /// Create a strategy with default configuration.
    pub fn create_default(&self, name: &str) -> Result<Box<dyn Strategy>, StrategyError> {
        let info = self
            .get(name)
            .ok_or_else(|| StrategyError::NotFound(name.to_string()))?;
        self.create(name, info.default_config.clone())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_list() {
        let registry = StrategyRegistry::new();
        let keys: Vec<_> = registry.list().iter().map(|s| s.key.as_str()).collect();

        assert_eq!(keys, vec!["range_breakout", "trend_breakout"]);
    }

    #[test]
    fn test_registry_get() {
        let registry = StrategyRegistry::new();

        assert!(registry.get("range_breakout").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_create_default() {
        let registry = StrategyRegistry::new();

        let strategy = registry.create_default("range_breakout").unwrap();
        assert_eq!(strategy.name(), "Range Breakout");

        let strategy = registry.create_default("trend_breakout").unwrap();
        assert_eq!(strategy.warmup_period(), 360);
    }

    #[test]
    fn test_create_with_partial_config() {
        let registry = StrategyRegistry::new();

        let config = serde_json::json!({
            "k": 0.3,
            "range_source": "rolling",
            "exit": { "stop_loss_pct": "1.5" }
        });
        assert!(registry.create("range_breakout", config).is_ok());
        assert!(registry.create("range_breakout", serde_json::Value::Null).is_ok());
    }

    #[test]
    fn test_create_invalid_config() {
        let registry = StrategyRegistry::new();

        let result = registry.create("range_breakout", serde_json::json!({ "k": -1.0 }));
        assert!(matches!(result, Err(StrategyError::InvalidConfig(_))));

        let result = registry.create("range_breakout", serde_json::json!({ "k": "wide" }));
        assert!(matches!(result, Err(StrategyError::InvalidConfig(_))));
    }

    #[test]
    fn test_create_unknown_strategy() {
        let registry = StrategyRegistry::new();

        let result = registry.create_default("unknown");
        assert!(matches!(result, Err(StrategyError::NotFound(_))));
    }
}
