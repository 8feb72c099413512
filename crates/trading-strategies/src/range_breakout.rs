//! Moving Range Breakout Strategy.
//!
//! At the start of each session a breakout range is taken from the prior
//! lookback. A long entry fires when the price exceeds
//! `session_open + k * range`; a short entry when it falls below
//! `session_open - k * range`. Open positions exit on the stop-loss or
//! take-profit threshold, or on a breakout in the opposite direction. The
//! reverse entry is left to a later evaluation once the position is flat.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trading_core::{
    error::StrategyError,
    traits::{Strategy, StrategyConfig, StrategyState},
    types::{
        Bar, DerivedSnapshot, Order, OrderPurpose, Position, Side, Signal, SignalMetadata,
        SignalStrength, SignalType,
    },
};
use trading_risk::ExitRules;

/// Where the breakout range comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RangeSource {
    /// Window range captured when the session began
    #[default]
    PriorSession,
    /// Window range at the time of evaluation
    Rolling,
}

/// Configuration for the range breakout strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeBreakoutConfig {
    /// Range multiplier for the entry thresholds
    pub k: f64,
    /// Source of the breakout range
    pub range_source: RangeSource,
    /// Allow short entries
    pub allow_short: bool,
    /// Ranges narrower than this produce no entries
    pub min_range: f64,
    /// Allow a second entry in a direction already traded this session
    pub allow_reentry: bool,
    /// Stop-loss / take-profit thresholds
    pub exit: ExitRules,
}

impl Default for RangeBreakoutConfig {
    fn default() -> Self {
        Self {
            k: 0.5,
            range_source: RangeSource::PriorSession,
            allow_short: true,
            min_range: 0.0,
            allow_reentry: false,
            exit: ExitRules::default(),
        }
    }
}

impl StrategyConfig for RangeBreakoutConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if !self.k.is_finite() || self.k <= 0.0 {
            return Err(StrategyError::InvalidConfig(format!(
                "k must be positive, got {}",
                self.k
            )));
        }
        if !self.min_range.is_finite() || self.min_range < 0.0 {
            return Err(StrategyError::InvalidConfig(format!(
                "min_range must be non-negative, got {}",
                self.min_range
            )));
        }
        self.exit.validate().map_err(StrategyError::InvalidConfig)
    }
}

/// Moving Range Breakout Strategy.
pub struct RangeBreakoutStrategy {
    config: RangeBreakoutConfig,
    long_taken: bool,
    short_taken: bool,
    last_levels: Option<(f64, f64)>,
    bars_processed: usize,
    signals_generated: usize,
}

impl RangeBreakoutStrategy {
    /// Create a new range breakout strategy.
    pub fn new(config: RangeBreakoutConfig) -> Self {
        Self {
            config,
            long_taken: false,
            short_taken: false,
            last_levels: None,
            bars_processed: 0,
            signals_generated: 0,
        }
    }

    pub fn config(&self) -> &RangeBreakoutConfig {
        &self.config
    }

    /// Entry thresholds `(upper, lower)` for the snapshot, if it has a
    /// session open and a usable range.
    pub fn levels(&self, snapshot: &DerivedSnapshot) -> Option<(f64, f64)> {
        let range = match self.config.range_source {
            RangeSource::PriorSession => snapshot.session_range?,
            RangeSource::Rolling => snapshot.range?,
        };
        if !range.is_finite() || range < self.config.min_range {
            return None;
        }
        let open = snapshot.session_open?;
        let offset = self.config.k * range;
        Some((open + offset, open - offset))
    }

    fn classify_strength(excess: f64, range: f64) -> SignalStrength {
        let ratio = if range > 0.0 { excess / range } else { 0.0 };
        if ratio > 0.5 {
            SignalStrength::Strong
        } else if ratio > 0.1 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        }
    }

    fn signal(
        &mut self,
        snapshot: &DerivedSnapshot,
        signal_type: SignalType,
        strength: SignalStrength,
        reason: String,
    ) -> Signal {
        self.signals_generated += 1;
        let mut indicators = std::collections::HashMap::new();
        if let Some((upper, lower)) = self.last_levels {
            indicators.insert("upper".to_string(), upper);
            indicators.insert("lower".to_string(), lower);
        }
        if let Some(open) = snapshot.session_open {
            indicators.insert("session_open".to_string(), open);
        }
        Signal::new(
            snapshot.symbol.clone(),
            signal_type,
            snapshot.last_price,
            snapshot.timestamp,
        )
        .with_strength(strength)
        .with_metadata(SignalMetadata {
            strategy_name: self.name().to_string(),
            indicators,
            reason,
        })
    }

    fn evaluate_open(
        &mut self,
        snapshot: &DerivedSnapshot,
        position: &Position,
    ) -> Option<Signal> {
        let price = snapshot.last_price;

        if let Ok(mark) = Decimal::try_from(price) {
            if let Some(trigger) = self.config.exit.evaluate(position, mark) {
                return Some(self.signal(
                    snapshot,
                    SignalType::Exit,
                    SignalStrength::Moderate,
                    trigger.to_string(),
                ));
            }
        }

        let (upper, lower) = self.last_levels?;
        if position.is_long() && price < lower {
            return Some(self.signal(
                snapshot,
                SignalType::Exit,
                SignalStrength::Moderate,
                format!("Opposite breakout: {:.4} below {:.4}", price, lower),
            ));
        }
        if position.is_short() && price > upper {
            return Some(self.signal(
                snapshot,
                SignalType::Exit,
                SignalStrength::Moderate,
                format!("Opposite breakout: {:.4} above {:.4}", price, upper),
            ));
        }

        // Same-direction breakouts while holding are suppressed.
        None
    }

    fn evaluate_flat(&mut self, snapshot: &DerivedSnapshot) -> Option<Signal> {
        let (upper, lower) = self.last_levels?;
        let price = snapshot.last_price;
        let range = (upper - lower) / 2.0 / self.config.k;

        if price > upper && (self.config.allow_reentry || !self.long_taken) {
            let strength = Self::classify_strength(price - upper, range);
            return Some(self.signal(
                snapshot,
                SignalType::EnterLong,
                strength,
                format!("Breakout: {:.4} above {:.4}", price, upper),
            ));
        }

        if price < lower
            && self.config.allow_short
            && (self.config.allow_reentry || !self.short_taken)
        {
            let strength = Self::classify_strength(lower - price, range);
            return Some(self.signal(
                snapshot,
                SignalType::EnterShort,
                strength,
                format!("Breakdown: {:.4} below {:.4}", price, lower),
            ));
        }

        None
    }
}

impl Strategy for RangeBreakoutStrategy {
    fn name(&self) -> &str {
        "Range Breakout"
    }

    fn description(&self) -> &str {
        "Enters when price leaves session open +/- k x range, exits on stop, target or reversal"
    }

    fn evaluate(
        &mut self,
        snapshot: &DerivedSnapshot,
        position: Option<&Position>,
    ) -> Option<Signal> {
        self.last_levels = self.levels(snapshot);

        match position {
            Some(position) if !position.is_flat() => self.evaluate_open(snapshot, position),
            _ => self.evaluate_flat(snapshot),
        }
    }

    fn on_bar(&mut self, _bar: &Bar) {
        self.bars_processed += 1;
    }

    fn on_fill(&mut self, order: &Order) {
        if order.purpose == OrderPurpose::Entry {
            match order.side {
                Side::Buy => self.long_taken = true,
                Side::Sell => self.short_taken = true,
            }
        }
    }

    fn begin_session(&mut self) {
        self.long_taken = false;
        self.short_taken = false;
        self.last_levels = None;
    }

    fn reset(&mut self) {
        self.begin_session();
        self.bars_processed = 0;
        self.signals_generated = 0;
    }

    fn state(&self) -> StrategyState {
        let mut indicators = std::collections::HashMap::new();
        if let Some((upper, lower)) = self.last_levels {
            indicators.insert("upper".to_string(), upper);
            indicators.insert("lower".to_string(), lower);
        }
        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.bars_processed),
            bars_processed: self.bars_processed,
            signals_generated: self.signals_generated,
            indicators,
            custom: serde_json::json!({
                "k": self.config.k,
                "range_source": self.config.range_source,
                "long_taken": self.long_taken,
                "short_taken": self.short_taken,
            }),
        }
    }

    fn warmup_period(&self) -> usize {
        1
    }
}
