//! Futures contract listings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A listed futures contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedContract {
    /// Contract class, e.g. `ES`
    pub class: String,
    /// Tradable contract code
    pub code: String,
    /// First trading day
    pub listed_date: NaiveDate,
    /// Last trading day
    pub last_trade_date: NaiveDate,
}

impl ListedContract {
    /// Whether the contract trades on `date`.
    pub fn is_active(&self, date: NaiveDate) -> bool {
        self.listed_date <= date && date <= self.last_trade_date
    }
}
