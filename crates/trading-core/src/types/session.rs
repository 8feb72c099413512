//! Connection state and trading session bounds.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Brokerage connectivity as seen by the runtime.
///
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting`,
/// with `ShuttingDown` terminal and reachable from `Connected` or
/// `Reconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (_, ShuttingDown) => *self != ShuttingDown,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", s)
    }
}

/// Market open and close for one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBounds {
    /// Local trading date
    pub date: NaiveDate,
    /// Market open
    pub open: DateTime<Utc>,
    /// Market close
    pub close: DateTime<Utc>,
}

impl SessionBounds {
    /// Market open as Unix milliseconds.
    pub fn open_millis(&self) -> i64 {
        self.open.timestamp_millis()
    }

    /// Market close as Unix milliseconds.
    pub fn close_millis(&self) -> i64 {
        self.close.timestamp_millis()
    }

    /// Check if the timestamp is inside `[open, close)`.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.open_millis() && timestamp < self.close_millis()
    }
}
