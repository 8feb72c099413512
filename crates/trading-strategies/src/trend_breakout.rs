//! Trend Breakout Strategy.
//!
//! Long-only. Enters when the price clears the highest high of the recent
//! lookback while the lows and highs of the shorter windows sit above
//! those of the long window, and only once the session has run for a
//! while. Exits when the price breaks the recent low or drops a set
//! percentage from the recent high.

use serde::{Deserialize, Serialize};
use trading_core::{
    error::StrategyError,
    traits::{Strategy, StrategyConfig, StrategyState, StreamingIndicator},
    types::{Bar, DerivedSnapshot, Position, Signal, SignalMetadata, SignalStrength, SignalType},
};
use trading_indicators::{RollingMax, RollingMin};

/// Configuration for the trend breakout strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendBreakoutConfig {
    /// Bars for the breakout high and the trailing low (N)
    pub breakout_period: usize,
    /// Bars for the long support window (M)
    pub support_period: usize,
    /// Bars for the short resistance window (P)
    pub resistance_period: usize,
    /// Percent drop from the breakout high that forces an exit
    pub drop_pct: f64,
    /// Minutes after the session start before entries are allowed
    pub entry_delay_minutes: i64,
}

impl Default for TrendBreakoutConfig {
    fn default() -> Self {
        Self {
            breakout_period: 120,
            support_period: 360,
            resistance_period: 75,
            drop_pct: 4.0,
            entry_delay_minutes: 130,
        }
    }
}

impl StrategyConfig for TrendBreakoutConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if self.breakout_period == 0 || self.resistance_period == 0 {
            return Err(StrategyError::InvalidConfig(
                "Periods must be greater than 0".into(),
            ));
        }
        if self.breakout_period >= self.support_period
            || self.resistance_period >= self.support_period
        {
            return Err(StrategyError::InvalidConfig(
                "Support period must be the longest window".into(),
            ));
        }
        if !(0.0..100.0).contains(&self.drop_pct) || self.drop_pct == 0.0 {
            return Err(StrategyError::InvalidConfig(format!(
                "drop_pct must be in (0, 100), got {}",
                self.drop_pct
            )));
        }
        if self.entry_delay_minutes < 0 {
            return Err(StrategyError::InvalidConfig(
                "entry_delay_minutes must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Levels {
    breakout_high: f64,
    trailing_low: f64,
    support_low: f64,
    resistance_high: f64,
    support_high: f64,
}

/// Trend Breakout Strategy.
pub struct TrendBreakoutStrategy {
    config: TrendBreakoutConfig,
    high_max_n: RollingMax,
    low_min_n: RollingMin,
    low_min_m: RollingMin,
    high_min_p: RollingMin,
    high_min_m: RollingMin,
    bars_processed: usize,
    signals_generated: usize,
}

impl TrendBreakoutStrategy {
    /// Create a new trend breakout strategy.
    pub fn new(config: TrendBreakoutConfig) -> Self {
        Self {
            high_max_n: RollingMax::new(config.breakout_period),
            low_min_n: RollingMin::new(config.breakout_period),
            low_min_m: RollingMin::new(config.support_period),
            high_min_p: RollingMin::new(config.resistance_period),
            high_min_m: RollingMin::new(config.support_period),
            config,
            bars_processed: 0,
            signals_generated: 0,
        }
    }

    fn levels(&self) -> Option<Levels> {
        Some(Levels {
            breakout_high: self.high_max_n.current()?,
            trailing_low: self.low_min_n.current()?,
            support_low: self.low_min_m.current()?,
            resistance_high: self.high_min_p.current()?,
            support_high: self.high_min_m.current()?,
        })
    }

    fn signal(
        &mut self,
        snapshot: &DerivedSnapshot,
        signal_type: SignalType,
        levels: &Levels,
        reason: String,
    ) -> Signal {
        self.signals_generated += 1;
        Signal::new(
            snapshot.symbol.clone(),
            signal_type,
            snapshot.last_price,
            snapshot.timestamp,
        )
        .with_strength(SignalStrength::Moderate)
        .with_metadata(SignalMetadata {
            strategy_name: self.name().to_string(),
            indicators: [
                ("breakout_high".to_string(), levels.breakout_high),
                ("trailing_low".to_string(), levels.trailing_low),
                ("support_low".to_string(), levels.support_low),
                ("resistance_high".to_string(), levels.resistance_high),
            ]
            .into_iter()
            .collect(),
            reason,
        })
    }
}

impl Strategy for TrendBreakoutStrategy {
    fn name(&self) -> &str {
        "Trend Breakout"
    }

    fn description(&self) -> &str {
        "Long-only breakout above the recent high while short-window lows and highs trend up"
    }

    fn evaluate(
        &mut self,
        snapshot: &DerivedSnapshot,
        position: Option<&Position>,
    ) -> Option<Signal> {
        let levels = self.levels()?;
        let price = snapshot.last_price;

        match position {
            Some(position) if position.is_long() => {
                let stop = levels.breakout_high * (1.0 - self.config.drop_pct / 100.0);
                if price < levels.trailing_low {
                    let reason = format!(
                        "Price {:.4} below trailing low {:.4}",
                        price, levels.trailing_low
                    );
                    Some(self.signal(snapshot, SignalType::Exit, &levels, reason))
                } else if price < stop {
                    let reason = format!(
                        "Price {:.4} more than {}% below high {:.4}",
                        price, self.config.drop_pct, levels.breakout_high
                    );
                    Some(self.signal(snapshot, SignalType::Exit, &levels, reason))
                } else {
                    None
                }
            }
            Some(position) if position.is_short() => None,
            _ => {
                let delayed = snapshot
                    .minutes_into_session()
                    .is_some_and(|m| m >= self.config.entry_delay_minutes);
                let trending = levels.trailing_low > levels.support_low
                    && levels.resistance_high > levels.support_high;

                if delayed && trending && price > levels.breakout_high {
                    let reason = format!(
                        "Price {:.4} above {}-bar high {:.4}",
                        price, self.config.breakout_period, levels.breakout_high
                    );
                    Some(self.signal(snapshot, SignalType::EnterLong, &levels, reason))
                } else {
                    None
                }
            }
        }
    }

    fn on_bar(&mut self, bar: &Bar) {
        self.bars_processed += 1;
        self.high_max_n.update(bar.high);
        self.low_min_n.update(bar.low);
        self.low_min_m.update(bar.low);
        self.high_min_p.update(bar.high);
        self.high_min_m.update(bar.high);
    }

    fn reset(&mut self) {
        self.high_max_n.reset();
        self.low_min_n.reset();
        self.low_min_m.reset();
        self.high_min_p.reset();
        self.high_min_m.reset();
        self.bars_processed = 0;
        self.signals_generated = 0;
    }

    fn state(&self) -> StrategyState {
        let indicators = self
            .levels()
            .map(|l| {
                [
                    ("breakout_high".to_string(), l.breakout_high),
                    ("trailing_low".to_string(), l.trailing_low),
                    ("support_low".to_string(), l.support_low),
                    ("resistance_high".to_string(), l.resistance_high),
                    ("support_high".to_string(), l.support_high),
                ]
                .into_iter()
                .collect()
            })
            .unwrap_or_default();

        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.bars_processed),
            bars_processed: self.bars_processed,
            signals_generated: self.signals_generated,
            indicators,
            custom: serde_json::to_value(&self.config).unwrap_or_default(),
        }
    }

    fn warmup_period(&self) -> usize {
        self.config.support_period
    }
}
