//! Derived per-instrument view handed to strategies.

use serde::{Deserialize, Serialize};

use super::Bar;

/// Snapshot of an instrument's rolling window after an update.
///
/// Rolling fields cover completed bars only, so they describe the
/// lookback that precedes the current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSnapshot {
    /// Instrument id
    pub symbol: String,
    /// Timestamp of the update (Unix milliseconds)
    pub timestamp: i64,
    /// Latest traded price
    pub last_price: f64,
    /// Highest high over the window
    pub rolling_high: Option<f64>,
    /// Lowest low over the window
    pub rolling_low: Option<f64>,
    /// `rolling_high - rolling_low`
    pub range: Option<f64>,
    /// Summed volume over the window
    pub window_volume: f64,
    /// Bars currently in the window
    pub window_len: usize,
    /// Configured window capacity
    pub capacity: usize,
    /// First accepted price of the current session
    pub session_open: Option<f64>,
    /// Session start (market open) timestamp
    pub session_start: Option<i64>,
    /// Window range captured at session start
    pub session_range: Option<f64>,
    /// Bar completed by this update, if any
    pub completed_bar: Option<Bar>,
}

impl DerivedSnapshot {
    /// Check if the window is full.
    pub fn is_warm(&self) -> bool {
        self.window_len >= self.capacity
    }

    /// Minutes elapsed since the session start.
    pub fn minutes_into_session(&self) -> Option<i64> {
        self.session_start
            .map(|start| (self.timestamp - start).max(0) / 60_000)
    }
}
