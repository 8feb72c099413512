//! Core data types for the trading runtime.

mod execution;
mod instrument;
mod ohlcv;
mod order;
mod position;
mod session;
mod signal;
mod snapshot;
mod timeframe;

pub use execution::{BrokerEvent, BrokerEventKind, BrokerOrder, RawMarketEvent};
pub use instrument::ListedContract;
pub use ohlcv::{Bar, FeedMessage, MarketEvent, Tick};
pub use order::{Fill, Order, OrderPurpose, OrderRequest, OrderStatus, OrderType, Side};
pub use position::Position;
pub use session::{ConnectionState, SessionBounds};
pub use signal::{Signal, SignalMetadata, SignalStrength, SignalType};
pub use snapshot::DerivedSnapshot;
pub use timeframe::Timeframe;
