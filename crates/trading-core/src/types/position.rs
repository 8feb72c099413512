//! Position type.

use num_traits::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Net holding in a single instrument.
///
/// Mutated only by the order manager in response to confirmed fills, or
/// replaced wholesale from the broker during resynchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Symbol
    pub symbol: String,
    /// Net quantity (positive for long, negative for short)
    pub quantity: Decimal,
    /// Average entry price
    pub avg_entry_price: Decimal,
    /// Realized profit/loss from closed portions
    pub realized_pnl: Decimal,
}

impl Position {
    /// Create a new position.
    pub fn new(symbol: impl Into<String>, quantity: Decimal, avg_entry_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            avg_entry_price,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Create an empty position.
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Decimal::ZERO, Decimal::ZERO)
    }

    /// Check if this is a long position.
    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    /// Check if this is a short position.
    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    /// Check if the position is flat.
    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    /// Get the absolute quantity.
    pub fn abs_quantity(&self) -> Decimal {
        self.quantity.abs()
    }

    /// Side of the order that would close this position.
    pub fn closing_side(&self) -> Option<Side> {
        if self.is_long() {
            Some(Side::Sell)
        } else if self.is_short() {
            Some(Side::Buy)
        } else {
            None
        }
    }

    /// Unrealized P&L at the given mark price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        self.quantity * (mark - self.avg_entry_price)
    }

    /// Apply a fill to the position.
    /// Returns the realized P&L if the position is being reduced.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let fill_qty = side.sign() * quantity;
        let mut realized = Decimal::ZERO;

        let same_direction = (self.quantity > Decimal::ZERO && fill_qty > Decimal::ZERO)
            || (self.quantity < Decimal::ZERO && fill_qty < Decimal::ZERO);

        if same_direction || self.is_flat() {
            let total_cost = self.quantity * self.avg_entry_price + fill_qty * price;
            let new_quantity = self.quantity + fill_qty;

            if new_quantity != Decimal::ZERO {
                self.avg_entry_price = total_cost / new_quantity;
            }
            self.quantity = new_quantity;
        } else {
            let close_qty = fill_qty.abs().min(self.quantity.abs());

            realized = if self.is_long() {
                close_qty * (price - self.avg_entry_price)
            } else {
                close_qty * (self.avg_entry_price - price)
            };
            self.realized_pnl += realized;

            let remaining = fill_qty.abs() - close_qty;
            if remaining > Decimal::ZERO {
                // Reversed through zero
                self.quantity = fill_qty.signum() * remaining;
                self.avg_entry_price = price;
            } else {
                self.quantity += fill_qty;
                if self.quantity == Decimal::ZERO {
                    self.avg_entry_price = Decimal::ZERO;
                }
            }
        }

        realized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_apply_fill_increase() {
        let mut position = Position::new("AAPL", dec!(100), dec!(150.00));

        let realized = position.apply_fill(Side::Buy, dec!(100), dec!(160.00));
        assert_eq!(realized, Decimal::ZERO);
        assert_eq!(position.quantity, dec!(200));
        assert_eq!(position.avg_entry_price, dec!(155.00));
    }

    #[test]
    fn test_position_apply_fill_close() {
        let mut position = Position::new("AAPL", dec!(100), dec!(150.00));

        let realized = position.apply_fill(Side::Sell, dec!(100), dec!(160.00));
        assert_eq!(realized, dec!(1000.00));
        assert!(position.is_flat());
        assert_eq!(position.closing_side(), None);
    }

    #[test]
    fn test_position_short_round_trip() {
        let mut position = Position::flat("ES");
        position.apply_fill(Side::Sell, dec!(2), dec!(4500));
        assert!(position.is_short());
        assert_eq!(position.closing_side(), Some(Side::Buy));
        assert_eq!(position.unrealized_pnl(dec!(4490)), dec!(20));

        let realized = position.apply_fill(Side::Buy, dec!(2), dec!(4490));
        assert_eq!(realized, dec!(20));
        assert!(position.is_flat());
    }

    #[test]
    fn test_position_reversal() {
        let mut position = Position::new("AAPL", dec!(10), dec!(100));
        let realized = position.apply_fill(Side::Sell, dec!(15), dec!(110));

        assert_eq!(realized, dec!(100));
        assert_eq!(position.quantity, dec!(-5));
        assert_eq!(position.avg_entry_price, dec!(110));
    }
}
