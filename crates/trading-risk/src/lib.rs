//! Position sizing and exit thresholds.

mod exit_rules;
mod position_sizer;

pub use exit_rules::{ExitRules, ExitTrigger};
pub use position_sizer::{PositionSizer, PositionSizingMethod};
