//! The trading runtime.
//!
//! [`TraderEngine`] holds every decision: instrument state, strategy
//! evaluation, order bookkeeping, the connection state machine and the
//! session clock. It performs no I/O; each input yields [`Command`]s.
//! [`TraderRuntime`] owns the brokerage session and market streams, runs
//! those commands and feeds their results back through one queue.

pub mod config;
pub mod engine;
pub mod event;
pub mod hours;
pub mod runtime;

pub use config::{InstrumentConfig, InstrumentKind, RetryConfig, SizingConfig, TraderConfig};
pub use engine::{EngineStats, ExitReason, RunReport, StrategyFactory, TraderEngine};
pub use event::{Command, RuntimeEvent, SessionPlan};
pub use hours::{
    trading_date, FixedMarketHours, MarketHoursConfig, OffsetMarketHours, SessionWindow,
};
pub use runtime::{Collaborators, TraderHandle, TraderRuntime};
