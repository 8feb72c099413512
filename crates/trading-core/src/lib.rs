//! Core types and traits for the breakout trader.
//!
//! This crate provides the foundational building blocks including:
//! - Market data types (Bar, Tick, MarketEvent)
//! - Order, fill and position types owned by the order manager
//! - Trading signals and the derived per-instrument snapshot
//! - Traits for strategies, indicators and the external collaborators
//!   (brokerage session, market hours, chart data, account balance,
//!   contract resolution, clock)

pub mod error;
pub mod traits;
pub mod types;

pub use error::{TradingError, TradingResult};
pub use traits::*;
pub use types::*;
