//! Strategy trait definitions.

use crate::error::StrategyError;
use crate::types::{Bar, DerivedSnapshot, Order, Position, Signal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration trait for strategies.
pub trait StrategyConfig: Send + Sync + Clone + 'static {
    /// Validate the configuration.
    fn validate(&self) -> Result<(), StrategyError>;
}

/// State of a strategy for monitoring and serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    /// Strategy name
    pub name: String,
    /// Whether the strategy has processed enough bars to generate signals
    pub is_warmed_up: bool,
    /// Number of completed bars processed
    pub bars_processed: usize,
    /// Number of signals generated
    pub signals_generated: usize,
    /// Current indicator values
    pub indicators: HashMap<String, f64>,
    /// Custom strategy-specific state
    pub custom: serde_json::Value,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self {
            name: String::new(),
            is_warmed_up: false,
            bars_processed: 0,
            signals_generated: 0,
            indicators: HashMap::new(),
            custom: serde_json::Value::Null,
        }
    }
}

/// Signal-evaluation contract.
///
/// One instance serves one instrument. The runtime feeds every completed
/// bar through [`Strategy::on_bar`] regardless of market hours, and calls
/// [`Strategy::evaluate`] only while trading is allowed. Any implementation
/// is substitutable.
pub trait Strategy: Send + Sync {
    /// Get the unique name of this strategy.
    fn name(&self) -> &str;

    /// Decide whether to enter, exit, or hold.
    ///
    /// # Arguments
    /// * `snapshot` - Derived state of the instrument after the latest update
    /// * `position` - Current position, if any
    ///
    /// # Returns
    /// * `Some(Signal)` if a trading action should be taken
    /// * `None` to hold
    fn evaluate(&mut self, snapshot: &DerivedSnapshot, position: Option<&Position>)
        -> Option<Signal>;

    /// Called for every completed bar, including seeded history.
    fn on_bar(&mut self, _bar: &Bar) {}

    /// Called when one of this instrument's orders receives a fill.
    fn on_fill(&mut self, _order: &Order) {}

    /// Called at the start of each trading session.
    fn begin_session(&mut self) {}

    /// Reset all state.
    fn reset(&mut self);

    /// Get the current strategy state for monitoring.
    fn state(&self) -> StrategyState;

    /// Number of completed bars needed before generating signals.
    fn warmup_period(&self) -> usize;

    /// Check if the strategy is warmed up (has enough data).
    fn is_warmed_up(&self, bars_available: usize) -> bool {
        bars_available >= self.warmup_period()
    }

    /// Get a description of the strategy.
    fn description(&self) -> &str {
        ""
    }
}
