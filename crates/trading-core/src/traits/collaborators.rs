//! External collaborators consumed by the runtime.
//!
//! These are specified only at their interface; the runtime never assumes
//! anything about how they are implemented.

use crate::error::{BrokerError, DataError};
use crate::types::{Bar, SessionBounds};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Market calendar lookup.
#[async_trait]
pub trait MarketHours: Send + Sync {
    /// Open and close for the given local trading date.
    ///
    /// Returns [`DataError::NoSession`] when the market does not trade.
    async fn current_session_bounds(&self, date: NaiveDate) -> Result<SessionBounds, DataError>;
}

/// Historical chart data retrieval.
#[async_trait]
pub trait ChartData: Send + Sync {
    /// The most recent `lookback` completed bars, oldest first.
    async fn historical_bars(&self, symbol: &str, lookback: usize) -> Result<Vec<Bar>, DataError>;
}

/// Account balance query.
#[async_trait]
pub trait AccountBalance: Send + Sync {
    /// Current account equity available for sizing.
    async fn current_balance(&self) -> Result<Decimal, BrokerError>;
}

/// Picks the tradable futures contract for a class on a given day.
#[async_trait]
pub trait ContractResolver: Send + Sync {
    /// Contract code of the front-month contract.
    async fn resolve_front_month(
        &self,
        instrument_class: &str,
        date: NaiveDate,
    ) -> Result<String, DataError>;
}
