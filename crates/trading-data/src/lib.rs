//! Market data subscriptions and chart data sources.

mod contracts;
mod csv_source;
mod feed;
mod normalize;

pub use contracts::ListedContractResolver;
pub use csv_source::CsvDataSource;
pub use feed::{MarketDataFeed, MarketStream};
pub use normalize::normalize;
