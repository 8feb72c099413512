//! Per-instrument rolling state.
//!
//! `InstrumentState` keeps a fixed-capacity FIFO window of completed bars
//! and the rolling high, low and volume over it. Ticks are aggregated into
//! the forming bar of the configured interval; the bar enters the window
//! once a tick from a later interval arrives.

use std::collections::VecDeque;
use trading_core::error::DataError;
use trading_core::traits::StreamingIndicator;
use trading_core::types::{Bar, DerivedSnapshot, MarketEvent, Timeframe};

use crate::rolling::{RollingMax, RollingMin};

/// Rolling window and derived fields for one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    symbol: String,
    timeframe: Timeframe,
    capacity: usize,
    window: VecDeque<Bar>,
    highs: RollingMax,
    lows: RollingMin,
    window_volume: f64,
    forming: Option<Bar>,
    last_timestamp: Option<i64>,
    last_price: Option<f64>,
    session_open: Option<f64>,
    session_start: Option<i64>,
    session_range: Option<f64>,
}

impl InstrumentState {
    /// Create a new state with a window of `capacity` bars.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, capacity: usize) -> Self {
        assert!(capacity > 0, "Window capacity must be greater than 0");
        Self {
            symbol: symbol.into(),
            timeframe,
            capacity,
            window: VecDeque::with_capacity(capacity),
            highs: RollingMax::new(capacity),
            lows: RollingMin::new(capacity),
            window_volume: 0.0,
            forming: None,
            last_timestamp: None,
            last_price: None,
            session_open: None,
            session_start: None,
            session_range: None,
        }
    }

    /// Apply a market event and return the derived snapshot.
    ///
    /// Events at or before the last accepted timestamp are rejected with
    /// [`DataError::StaleData`] and leave the state untouched.
    pub fn update(&mut self, event: &MarketEvent) -> Result<DerivedSnapshot, DataError> {
        let timestamp = event.timestamp();
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                return Err(DataError::StaleData {
                    symbol: self.symbol.clone(),
                    timestamp,
                    last,
                });
            }
        }

        let completed = match event {
            MarketEvent::Tick(tick) => self.apply_trade(tick.timestamp, tick.price, tick.volume),
            MarketEvent::Bar { bar, .. } => {
                // A delivered bar supersedes any partial bar built from ticks.
                self.forming = None;
                self.push_bar(*bar);
                Some(*bar)
            }
        };

        let opening_price = match event {
            MarketEvent::Tick(tick) => tick.price,
            MarketEvent::Bar { bar, .. } => bar.open,
        };
        // pre-open prints do not set the session open
        let in_session = self.session_start.map_or(true, |start| timestamp >= start);
        if in_session && self.session_open.is_none() {
            self.session_open = Some(opening_price);
        }
        if self.session_start.is_none() {
            self.session_start = Some(timestamp);
        }

        self.last_timestamp = Some(timestamp);
        self.last_price = Some(event.price());

        Ok(self.snapshot(completed))
    }

    /// Load historical bars into the window.
    ///
    /// Bars at or before the last accepted timestamp are skipped. Returns
    /// the bars that were accepted.
    pub fn seed(&mut self, bars: &[Bar]) -> Vec<Bar> {
        let mut accepted = Vec::with_capacity(bars.len());
        for bar in bars {
            if self.last_timestamp.is_some_and(|last| bar.timestamp <= last) {
                continue;
            }
            self.push_bar(*bar);
            self.last_timestamp = Some(bar.timestamp);
            self.last_price = Some(bar.close);
            accepted.push(*bar);
        }
        accepted
    }

    /// Start a new trading session.
    ///
    /// Completes any forming bar, captures the current window range as the
    /// session breakout range and clears the session open. The window is
    /// kept so the prior session remains visible. Returns the bar completed
    /// here, if any.
    pub fn begin_session(&mut self, session_start: i64) -> Option<Bar> {
        let completed = self.forming.take();
        if let Some(bar) = completed {
            self.push_bar(bar);
        }
        self.session_range = self.range();
        self.session_open = None;
        self.session_start = Some(session_start);
        completed
    }

    /// Clear everything, including the window.
    pub fn reset(&mut self) {
        self.window.clear();
        self.highs.reset();
        self.lows.reset();
        self.window_volume = 0.0;
        self.forming = None;
        self.last_timestamp = None;
        self.last_price = None;
        self.session_open = None;
        self.session_start = None;
        self.session_range = None;
    }

    /// Build a snapshot of the current state without updating it.
    pub fn snapshot(&self, completed_bar: Option<Bar>) -> DerivedSnapshot {
        DerivedSnapshot {
            symbol: self.symbol.clone(),
            timestamp: self.last_timestamp.unwrap_or_default(),
            last_price: self.last_price.unwrap_or_default(),
            rolling_high: self.highs.value(),
            rolling_low: self.lows.value(),
            range: self.range(),
            window_volume: self.window_volume,
            window_len: self.window.len(),
            capacity: self.capacity,
            session_open: self.session_open,
            session_start: self.session_start,
            session_range: self.session_range,
            completed_bar,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Completed bars in the window, oldest first.
    pub fn window(&self) -> &VecDeque<Bar> {
        &self.window
    }

    /// The bar currently being built from ticks.
    pub fn forming_bar(&self) -> Option<&Bar> {
        self.forming.as_ref()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    /// `rolling_high - rolling_low` over the window.
    pub fn range(&self) -> Option<f64> {
        match (self.highs.value(), self.lows.value()) {
            (Some(high), Some(low)) => Some(high - low),
            _ => None,
        }
    }

    fn apply_trade(&mut self, timestamp: i64, price: f64, volume: f64) -> Option<Bar> {
        let bucket = self.timeframe.bucket_start(timestamp);
        match self.forming.as_mut() {
            Some(bar) if bar.timestamp == bucket => {
                bar.absorb(price, volume);
                None
            }
            _ => {
                let completed = self.forming.replace(Bar::from_trade(bucket, price, volume));
                if let Some(bar) = completed {
                    self.push_bar(bar);
                }
                completed
            }
        }
    }

    fn push_bar(&mut self, bar: Bar) {
        if self.window.len() >= self.capacity {
            if let Some(evicted) = self.window.pop_front() {
                self.window_volume -= evicted.volume;
            }
        }
        self.window.push_back(bar);
        self.window_volume += bar.volume;
        self.highs.update(bar.high);
        self.lows.update(bar.low);
    }
}
