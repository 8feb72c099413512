//! Front-month resolution from a static contract list.

use async_trait::async_trait;
use chrono::NaiveDate;
use trading_core::error::DataError;
use trading_core::traits::ContractResolver;
use trading_core::types::ListedContract;

/// Resolves the front month as the longest-listed contract still trading.
///
/// The oldest active listing is the nearest expiry and carries the most
/// volume.
#[derive(Debug, Clone, Default)]
pub struct ListedContractResolver {
    contracts: Vec<ListedContract>,
}

impl ListedContractResolver {
    pub fn new(contracts: Vec<ListedContract>) -> Self {
        Self { contracts }
    }

    /// Resolve synchronously.
    pub fn front_month(&self, class: &str, date: NaiveDate) -> Option<&ListedContract> {
        self.contracts
            .iter()
            .filter(|c| c.class == class && c.is_active(date))
            .min_by_key(|c| (c.listed_date, c.last_trade_date))
    }
}

#[async_trait]
impl ContractResolver for ListedContractResolver {
    async fn resolve_front_month(
        &self,
        instrument_class: &str,
        date: NaiveDate,
    ) -> Result<String, DataError> {
        self.front_month(instrument_class, date)
            .map(|c| c.code.clone())
            .ok_or_else(|| {
                DataError::SymbolNotFound(format!("{} front month on {}", instrument_class, date))
            })
    }
}
