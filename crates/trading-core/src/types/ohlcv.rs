//! Market data types: bars, ticks and the normalized feed event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compact OHLCV bar.
/// Uses f64 for fast rolling-window calculations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Unix timestamp in milliseconds (start of the bar interval)
    pub timestamp: i64,
    /// Opening price
    pub open: f64,
    /// Highest price
    pub high: f64,
    /// Lowest price
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Trading volume
    pub volume: f64,
}

impl Bar {
    /// Create a new bar.
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Start a bar from a single trade.
    pub fn from_trade(timestamp: i64, price: f64, volume: f64) -> Self {
        Self::new(timestamp, price, price, price, price, volume)
    }

    /// Fold another trade into the bar.
    pub fn absorb(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    /// Calculate the bar's range (high - low).
    #[inline]
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Check if all prices are finite and positive.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.high >= self.low
            && self.volume.is_finite()
    }

    /// Get the timestamp as a DateTime.
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }
}

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument id
    pub symbol: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Trade price
    pub price: f64,
    /// Trade size
    pub volume: f64,
}

impl Tick {
    /// Create a new tick.
    pub fn new(symbol: impl Into<String>, timestamp: i64, price: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            volume,
        }
    }
}

/// Canonical normalized market event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Tick(Tick),
    Bar { symbol: String, bar: Bar },
}

impl MarketEvent {
    /// Instrument id the event belongs to.
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Tick(tick) => &tick.symbol,
            MarketEvent::Bar { symbol, .. } => symbol,
        }
    }

    /// Event timestamp in milliseconds.
    pub fn timestamp(&self) -> i64 {
        match self {
            MarketEvent::Tick(tick) => tick.timestamp,
            MarketEvent::Bar { bar, .. } => bar.timestamp,
        }
    }

    /// Latest traded price carried by the event.
    pub fn price(&self) -> f64 {
        match self {
            MarketEvent::Tick(tick) => tick.price,
            MarketEvent::Bar { bar, .. } => bar.close,
        }
    }
}

/// Item yielded by a market data subscription.
///
/// A subscription ends with exactly one `ConnectionLost` when the
/// transport drops; it never stalls silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedMessage {
    Event(MarketEvent),
    ConnectionLost { symbol: String },
}
