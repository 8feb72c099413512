//! Order quantity from account balance.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use trading_core::types::{Signal, SignalStrength};

/// Position sizing method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum PositionSizingMethod {
    /// Fixed number of shares or contracts
    Fixed { shares: Decimal },
    /// Fixed dollar amount
    FixedDollar { amount: Decimal },
    /// Percentage of the account balance
    PercentEquity { percent: Decimal },
}

impl Default for PositionSizingMethod {
    fn default() -> Self {
        PositionSizingMethod::PercentEquity { percent: dec!(10) }
    }
}

/// Position sizer calculates the entry quantity.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    method: PositionSizingMethod,
    max_shares: Option<Decimal>,
    use_signal_strength: bool,
}

impl PositionSizer {
    /// Create a new position sizer.
    pub fn new(method: PositionSizingMethod) -> Self {
        Self {
            method,
            max_shares: None,
            use_signal_strength: true,
        }
    }

    /// Set maximum shares per position.
    pub fn with_max_shares(mut self, max: Decimal) -> Self {
        self.max_shares = Some(max);
        self
    }

    /// Disable signal strength adjustment.
    pub fn without_signal_strength(mut self) -> Self {
        self.use_signal_strength = false;
        self
    }

    pub fn method(&self) -> &PositionSizingMethod {
        &self.method
    }

    /// Calculate the quantity for an entry at `current_price`.
    ///
    /// The result is capped by what `balance` can pay for and rounded down
    /// to whole units, so it may be zero.
    pub fn calculate(&self, balance: Decimal, signal: &Signal, current_price: Decimal) -> Decimal {
        if current_price <= Decimal::ZERO || balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let base_size = match &self.method {
            PositionSizingMethod::Fixed { shares } => *shares,
            PositionSizingMethod::FixedDollar { amount } => *amount / current_price,
            PositionSizingMethod::PercentEquity { percent } => {
                balance * (*percent / dec!(100)) / current_price
            }
        };

        let adjusted_size = if self.use_signal_strength {
            let multiplier = match signal.strength {
                SignalStrength::Weak => dec!(0.5),
                SignalStrength::Moderate => dec!(1.0),
                SignalStrength::Strong => dec!(1.5),
            };
            base_size * multiplier
        } else {
            base_size
        };

        let mut final_size = adjusted_size;

        if let Some(max) = self.max_shares {
            final_size = final_size.min(max);
        }

        let max_affordable = balance / current_price;
        final_size = final_size.min(max_affordable);

        final_size.floor().max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::types::SignalType;

    fn create_signal() -> Signal {
        Signal::new("TEST", SignalType::EnterLong, 100.0, 0)
    }

    #[test]
    fn test_fixed_shares() {
        let sizer = PositionSizer::new(PositionSizingMethod::Fixed { shares: dec!(100) })
            .without_signal_strength();

        let size = sizer.calculate(dec!(100000), &create_signal(), dec!(50));
        assert_eq!(size, dec!(100));
    }

    #[test]
    fn test_percent_equity() {
        let sizer = PositionSizer::new(PositionSizingMethod::PercentEquity { percent: dec!(5) })
            .without_signal_strength();

        // 5% of 100000 = 5000, at $100/share = 50 shares
        let size = sizer.calculate(dec!(100000), &create_signal(), dec!(100));
        assert_eq!(size, dec!(50));
    }

    #[test]
    fn test_fixed_dollar_rounds_down() {
        let sizer = PositionSizer::new(PositionSizingMethod::FixedDollar { amount: dec!(1050) })
            .without_signal_strength();

        let size = sizer.calculate(dec!(100000), &create_signal(), dec!(100));
        assert_eq!(size, dec!(10));
    }

    #[test]
    fn test_signal_strength_adjustment() {
        let sizer = PositionSizer::new(PositionSizingMethod::Fixed { shares: dec!(100) });

        let weak = create_signal().with_strength(SignalStrength::Weak);
        let strong = create_signal().with_strength(SignalStrength::Strong);

        assert_eq!(sizer.calculate(dec!(100000), &weak, dec!(50)), dec!(50));
        assert_eq!(sizer.calculate(dec!(100000), &strong, dec!(50)), dec!(150));
    }

    #[test]
    fn test_max_shares_limit() {
        let sizer = PositionSizer::new(PositionSizingMethod::Fixed { shares: dec!(1000) })
            .with_max_shares(dec!(100))
            .without_signal_strength();

        let size = sizer.calculate(dec!(1000000), &create_signal(), dec!(50));
        assert_eq!(size, dec!(100));
    }

    #[test]
    fn test_balance_limit() {
        let sizer = PositionSizer::new(PositionSizingMethod::Fixed { shares: dec!(1000) })
            .without_signal_strength();

        // Only $5000 available
        let size = sizer.calculate(dec!(5000), &create_signal(), dec!(100));
        assert_eq!(size, dec!(50));
    }

    #[test]
    fn test_zero_inputs() {
        let sizer = PositionSizer::new(PositionSizingMethod::default());
        assert_eq!(sizer.calculate(dec!(0), &create_signal(), dec!(100)), dec!(0));
        assert_eq!(sizer.calculate(dec!(1000), &create_signal(), dec!(0)), dec!(0));
    }
}
