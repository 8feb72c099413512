//! Trading strategy implementations.
//!
//! - Range Breakout: session open +/- k x range, with stop-loss and take-profit
//! - Trend Breakout: long-only break of the recent high in a rising market

mod range_breakout;
mod registry;
mod trend_breakout;

pub use range_breakout::{RangeBreakoutConfig, RangeBreakoutStrategy, RangeSource};
pub use registry::{StrategyInfo, StrategyRegistry};
pub use trend_breakout::{TrendBreakoutConfig, TrendBreakoutStrategy};
