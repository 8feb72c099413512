//! Trading signals emitted by strategies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Side;

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    EnterLong,
    EnterShort,
    Exit,
}

impl SignalType {
    /// Check if the signal opens a position.
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalType::EnterLong | SignalType::EnterShort)
    }

    /// Order side an entry signal translates to.
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            SignalType::EnterLong => Some(Side::Buy),
            SignalType::EnterShort => Some(Side::Sell),
            SignalType::Exit => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::EnterLong => write!(f, "enter-long"),
            SignalType::EnterShort => write!(f, "enter-short"),
            SignalType::Exit => write!(f, "exit"),
        }
    }
}

/// Size hint carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    Weak,
    #[default]
    Moderate,
    Strong,
}

/// Context attached to a signal for logging and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalMetadata {
    /// Name of the strategy that produced the signal
    pub strategy_name: String,
    /// Indicator values at the time of the signal
    pub indicators: HashMap<String, f64>,
    /// Human-readable reason
    pub reason: String,
}

/// A trading signal. Ephemeral: consumed once by the order manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Instrument id
    pub symbol: String,
    /// Direction
    pub signal_type: SignalType,
    /// Size hint
    pub strength: SignalStrength,
    /// Price that triggered the signal
    pub price: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Context
    pub metadata: SignalMetadata,
}

impl Signal {
    /// Create a new signal with moderate strength.
    pub fn new(
        symbol: impl Into<String>,
        signal_type: SignalType,
        price: f64,
        timestamp: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            signal_type,
            strength: SignalStrength::default(),
            price,
            timestamp,
            metadata: SignalMetadata::default(),
        }
    }

    /// Set the strength.
    pub fn with_strength(mut self, strength: SignalStrength) -> Self {
        self.strength = strength;
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: SignalMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
