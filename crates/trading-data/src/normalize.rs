//! Raw vendor events to canonical feed messages.

use tracing::warn;
use trading_core::types::{FeedMessage, MarketEvent, RawMarketEvent, Tick};

/// Normalize a raw event for the subscription on `symbol`.
///
/// Returns `None` for events that must be dropped: prices that are not
/// finite and positive, malformed bars, or events for another instrument.
pub fn normalize(symbol: &str, raw: RawMarketEvent) -> Option<FeedMessage> {
    match raw {
        RawMarketEvent::Trade {
            symbol: event_symbol,
            timestamp,
            price,
            volume,
        } => {
            if event_symbol != symbol {
                warn!(symbol = %symbol, event_symbol = %event_symbol, "Dropping trade for another instrument");
                return None;
            }
            if !price.is_finite() || price <= 0.0 {
                warn!(symbol = %symbol, price, timestamp, "Dropping trade with invalid price");
                return None;
            }
            let volume = if volume.is_finite() { volume.max(0.0) } else { 0.0 };
            Some(FeedMessage::Event(MarketEvent::Tick(Tick::new(
                event_symbol,
                timestamp,
                price,
                volume,
            ))))
        }
        RawMarketEvent::Bar {
            symbol: event_symbol,
            bar,
        } => {
            if event_symbol != symbol {
                warn!(symbol = %symbol, event_symbol = %event_symbol, "Dropping bar for another instrument");
                return None;
            }
            if !bar.is_valid() {
                warn!(symbol = %symbol, timestamp = bar.timestamp, "Dropping malformed bar");
                return None;
            }
            Some(FeedMessage::Event(MarketEvent::Bar {
                symbol: event_symbol,
                bar,
            }))
        }
        RawMarketEvent::Disconnected => Some(FeedMessage::ConnectionLost {
            symbol: symbol.to_string(),
        }),
    }
}
