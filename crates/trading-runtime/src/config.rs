//! Runtime settings.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trading_broker::RetryPolicy;
use trading_core::types::Timeframe;
use trading_risk::{PositionSizer, PositionSizingMethod};

/// How an instrument id is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Traded under its own symbol.
    #[default]
    Stock,
    /// A futures class; the front-month contract is resolved each session.
    Future,
}

/// One configured instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    #[serde(default)]
    pub kind: InstrumentKind,
}

impl InstrumentConfig {
    pub fn stock(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: InstrumentKind::Stock,
        }
    }

    pub fn future(class: impl Into<String>) -> Self {
        Self {
            symbol: class.into(),
            kind: InstrumentKind::Future,
        }
    }
}

/// Trader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    pub instruments: Vec<InstrumentConfig>,
    /// Interval ticks are aggregated into
    pub timeframe: Timeframe,
    /// Window length in bars, also the number of history bars seeded
    pub lookback: usize,
    pub timer_interval_ms: u64,
    /// Positions are flattened this long before the close
    pub flatten_before_close_minutes: i64,
    /// How long shutdown waits for cancels before giving up on them
    pub shutdown_timeout_ms: u64,
    pub order_archive_limit: usize,
    /// Shut down once the session has closed
    pub stop_at_close: bool,
    /// Offset of the exchange's local time from UTC, used for the trading date
    pub utc_offset_minutes: i32,
    pub connect_timeout_ms: u64,
    /// Wait before retrying a failed session preparation
    pub session_retry_ms: u64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            timeframe: Timeframe::Minute1,
            lookback: 30,
            timer_interval_ms: 1_000,
            flatten_before_close_minutes: 10,
            shutdown_timeout_ms: 10_000,
            order_archive_limit: 1_000,
            stop_at_close: false,
            utc_offset_minutes: 0,
            connect_timeout_ms: 10_000,
            session_retry_ms: 30_000,
        }
    }
}

impl TraderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.instruments.is_empty() {
            return Err("at least one instrument is required".into());
        }
        if let Some(blank) = self.instruments.iter().find(|i| i.symbol.trim().is_empty()) {
            return Err(format!("instrument with empty symbol: {:?}", blank));
        }
        let mut symbols: Vec<&str> = self.instruments.iter().map(|i| i.symbol.as_str()).collect();
        symbols.sort_unstable();
        if symbols.windows(2).any(|w| w[0] == w[1]) {
            return Err("instruments must be unique".into());
        }
        if self.lookback == 0 {
            return Err("lookback must be positive".into());
        }
        if self.timer_interval_ms == 0 {
            return Err("timer_interval_ms must be positive".into());
        }
        if self.flatten_before_close_minutes < 0 {
            return Err("flatten_before_close_minutes must not be negative".into());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be positive".into());
        }
        Ok(())
    }
}

/// Retry budgets for broker calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Order submission, also used for cancels and resynchronization
    pub submit: RetryPolicy,
    /// Re-establishing a lost connection
    pub reconnect: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            submit: RetryPolicy::default(),
            reconnect: RetryPolicy {
                max_attempts: 10,
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                multiplier: 2.0,
                attempt_timeout_ms: 10_000,
            },
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.submit
            .validate()
            .map_err(|e| format!("retry.submit: {}", e))?;
        self.reconnect
            .validate()
            .map_err(|e| format!("retry.reconnect: {}", e))
    }
}

/// Entry sizing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub method: PositionSizingMethod,
    pub max_shares: Option<Decimal>,
    /// Scale entries by signal strength
    pub use_signal_strength: bool,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: PositionSizingMethod::default(),
            max_shares: None,
            use_signal_strength: true,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<(), String> {
        let amount = match &self.method {
            PositionSizingMethod::Fixed { shares } => *shares,
            PositionSizingMethod::FixedDollar { amount } => *amount,
            PositionSizingMethod::PercentEquity { percent } => {
                if *percent > Decimal::ONE_HUNDRED {
                    return Err(format!("sizing percent {} exceeds 100", percent));
                }
                *percent
            }
        };
        if amount <= Decimal::ZERO {
            return Err("sizing amount must be positive".into());
        }
        if self.max_shares.is_some_and(|max| max <= Decimal::ZERO) {
            return Err("max_shares must be positive".into());
        }
        Ok(())
    }

    pub fn build(&self) -> PositionSizer {
        let mut sizer = PositionSizer::new(self.method.clone());
        if let Some(max) = self.max_shares {
            sizer = sizer.with_max_shares(max);
        }
        if !self.use_signal_strength {
            sizer = sizer.without_signal_strength();
        }
        sizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trader_config_validation() {
        let mut config = TraderConfig::default();
        assert!(config.validate().is_err());

        config.instruments = vec![InstrumentConfig::stock("SPY"), InstrumentConfig::future("ES")];
        assert!(config.validate().is_ok());

        config.instruments.push(InstrumentConfig::stock("SPY"));
        assert!(config.validate().is_err());

        config.instruments.pop();
        config.lookback = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sizing_validation() {
        assert!(SizingConfig::default().validate().is_ok());

        let config = SizingConfig {
            method: PositionSizingMethod::PercentEquity { percent: dec!(150) },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SizingConfig {
            method: PositionSizingMethod::Fixed { shares: dec!(0) },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_defaults_are_patient() {
        let config = RetryConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.reconnect.max_attempts > config.submit.max_attempts);
    }
}
