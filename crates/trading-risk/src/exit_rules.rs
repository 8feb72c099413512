//! Stop-loss and take-profit thresholds.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::types::Position;

/// Which threshold closed the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitTrigger {
    StopLoss { stop_price: Decimal },
    TakeProfit { target_price: Decimal },
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::StopLoss { stop_price } => write!(f, "stop-loss at {}", stop_price),
            ExitTrigger::TakeProfit { target_price } => {
                write!(f, "take-profit at {}", target_price)
            }
        }
    }
}

/// Percent thresholds measured from the average entry price.
///
/// For a long position the stop sits below entry and the target above;
/// a short position mirrors both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    /// Loss from entry, in percent, that closes the position
    pub stop_loss_pct: Option<Decimal>,
    /// Gain from entry, in percent, that closes the position
    pub take_profit_pct: Option<Decimal>,
}

impl ExitRules {
    pub fn new(stop_loss_pct: Option<Decimal>, take_profit_pct: Option<Decimal>) -> Self {
        Self {
            stop_loss_pct,
            take_profit_pct,
        }
    }

    /// Check that thresholds are positive.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
        ] {
            if let Some(pct) = value {
                if pct <= Decimal::ZERO {
                    return Err(format!("{} must be positive, got {}", name, pct));
                }
            }
        }
        if let Some(pct) = self.stop_loss_pct {
            if pct >= dec!(100) {
                return Err(format!("stop_loss_pct must be below 100, got {}", pct));
            }
        }
        Ok(())
    }

    /// Stop price for the position, if a stop is configured.
    pub fn stop_price(&self, position: &Position) -> Option<Decimal> {
        let pct = self.stop_loss_pct?;
        let offset = position.avg_entry_price * (pct / dec!(100));
        if position.is_long() {
            Some(position.avg_entry_price - offset)
        } else if position.is_short() {
            Some(position.avg_entry_price + offset)
        } else {
            None
        }
    }

    /// Target price for the position, if a target is configured.
    pub fn target_price(&self, position: &Position) -> Option<Decimal> {
        let pct = self.take_profit_pct?;
        let offset = position.avg_entry_price * (pct / dec!(100));
        if position.is_long() {
            Some(position.avg_entry_price + offset)
        } else if position.is_short() {
            Some(position.avg_entry_price - offset)
        } else {
            None
        }
    }

    /// Check the current price against both thresholds.
    ///
    /// The stop is checked first so a gap through both levels reports a stop.
    pub fn evaluate(&self, position: &Position, price: Decimal) -> Option<ExitTrigger> {
        if position.is_flat() {
            return None;
        }

        if let Some(stop_price) = self.stop_price(position) {
            let hit = if position.is_long() {
                price <= stop_price
            } else {
                price >= stop_price
            };
            if hit {
                return Some(ExitTrigger::StopLoss { stop_price });
            }
        }

        if let Some(target_price) = self.target_price(position) {
            let hit = if position.is_long() {
                price >= target_price
            } else {
                price <= target_price
            };
            if hit {
                return Some(ExitTrigger::TakeProfit { target_price });
            }
        }

        None
    }
}
