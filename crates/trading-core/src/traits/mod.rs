//! Core traits for the trading runtime.

mod broker;
mod clock;
mod collaborators;
mod indicator;
mod strategy;

pub use broker::{BrokerSession, Brokerage, CallbackId, MarketCallback, OrderCallback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{AccountBalance, ChartData, ContractResolver, MarketHours};
pub use indicator::{Indicator, StreamingIndicator};
pub use strategy::{Strategy, StrategyConfig, StrategyState};
