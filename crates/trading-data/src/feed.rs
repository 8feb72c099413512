//! Per-instrument market data subscriptions.
//!
//! Each subscription registers a callback with the brokerage session. The
//! callback normalizes raw events and forwards them to an unbounded channel
//! drained by a [`MarketStream`]. A stream ends after yielding a single
//! `ConnectionLost` and is never resubscribed automatically.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};
use trading_core::error::BrokerError;
use trading_core::traits::{BrokerSession, CallbackId, MarketCallback};
use trading_core::types::FeedMessage;

use crate::normalize::normalize;

struct Subscription {
    callback: CallbackId,
    active: Arc<AtomicBool>,
}

/// Market data subscriptions over one brokerage session.
pub struct MarketDataFeed {
    session: Arc<dyn BrokerSession>,
    subscriptions: HashMap<String, Subscription>,
}

impl MarketDataFeed {
    pub fn new(session: Arc<dyn BrokerSession>) -> Self {
        Self {
            session,
            subscriptions: HashMap::new(),
        }
    }

    /// Start receiving normalized events for `symbol`.
    pub fn subscribe(&mut self, symbol: &str) -> Result<MarketStream, BrokerError> {
        if self.subscriptions.contains_key(symbol) {
            return Err(BrokerError::AlreadySubscribed(symbol.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let callback_active = Arc::clone(&active);
        let callback_symbol = symbol.to_string();
        let callback: MarketCallback = Box::new(move |raw| {
            if !callback_active.load(Ordering::Acquire) {
                return;
            }
            if let Some(message) = normalize(&callback_symbol, raw) {
                let _ = tx.send(message);
            }
        });

        let callback = self.session.register_market_callback(symbol, callback)?;
        self.subscriptions.insert(
            symbol.to_string(),
            Subscription {
                callback,
                active: Arc::clone(&active),
            },
        );
        info!(symbol = %symbol, "Subscribed to market data");

        Ok(MarketStream {
            symbol: symbol.to_string(),
            rx,
            active,
            terminated: false,
        })
    }

    /// Stop receiving events for `symbol`.
    ///
    /// Once this returns, the stream yields nothing further, including
    /// events already buffered. Unknown symbols are ignored.
    pub fn unsubscribe(&mut self, symbol: &str) {
        if let Some(subscription) = self.subscriptions.remove(symbol) {
            subscription.active.store(false, Ordering::Release);
            self.session.deregister(subscription.callback);
            info!(symbol = %symbol, "Unsubscribed from market data");
        } else {
            debug!(symbol = %symbol, "Unsubscribe for unknown instrument ignored");
        }
    }

    /// Drop every subscription.
    pub fn unsubscribe_all(&mut self) {
        let symbols: Vec<String> = self.subscriptions.keys().cloned().collect();
        for symbol in symbols {
            self.unsubscribe(&symbol);
        }
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions.contains_key(symbol)
    }

    /// Subscribed instruments, in no particular order.
    pub fn subscribed(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }
}

/// Lazy, non-restartable stream of normalized events for one instrument.
pub struct MarketStream {
    symbol: String,
    rx: mpsc::UnboundedReceiver<FeedMessage>,
    active: Arc<AtomicBool>,
    terminated: bool,
}

impl MarketStream {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Whether the stream has ended.
    pub fn is_terminated(&self) -> bool {
        self.terminated || !self.active.load(Ordering::Acquire)
    }
}

impl Stream for MarketStream {
    type Item = FeedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedMessage>> {
        if self.is_terminated() {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                if matches!(message, FeedMessage::ConnectionLost { .. }) {
                    self.terminated = true;
                    self.rx.close();
                }
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;
    use trading_core::types::{
        BrokerOrder, MarketEvent, OrderRequest, Position, RawMarketEvent, Tick,
    };

    /// Session that only stores market callbacks so tests can fire them.
    #[derive(Default)]
    struct CallbackSession {
        next_id: Mutex<u64>,
        callbacks: Mutex<HashMap<u64, (String, MarketCallback)>>,
    }

    impl CallbackSession {
        fn fire(&self, symbol: &str, raw: RawMarketEvent) {
            let callbacks = self.callbacks.lock().unwrap();
            for (sym, callback) in callbacks.values() {
                if sym == symbol {
                    callback(raw.clone());
                }
            }
        }

        fn callback_count(&self) -> usize {
            self.callbacks.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BrokerSession for CallbackSession {
        fn is_alive(&self) -> bool {
            true
        }

        async fn submit_order(&self, _request: &OrderRequest) -> Result<String, BrokerError> {
            Err(BrokerError::Configuration("not supported".into()))
        }

        async fn cancel_order(&self, _id: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
            Ok(vec![])
        }

        async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
            Ok(vec![])
        }

        fn register_market_callback(
            &self,
            symbol: &str,
            callback: MarketCallback,
        ) -> Result<CallbackId, BrokerError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.callbacks
                .lock()
                .unwrap()
                .insert(*next, (symbol.to_string(), callback));
            Ok(CallbackId(*next))
        }

        fn register_order_callback(
            &self,
            _callback: trading_core::traits::OrderCallback,
        ) -> Result<CallbackId, BrokerError> {
            Ok(CallbackId(0))
        }

        fn deregister(&self, id: CallbackId) {
            self.callbacks.lock().unwrap().remove(&id.0);
        }
    }

    fn trade(symbol: &str, timestamp: i64, price: f64) -> RawMarketEvent {
        RawMarketEvent::Trade {
            symbol: symbol.into(),
            timestamp,
            price,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_normalized_events() {
        let session = Arc::new(CallbackSession::default());
        let mut feed = MarketDataFeed::new(session.clone());
        let mut stream = feed.subscribe("SPY").unwrap();

        session.fire("SPY", trade("SPY", 1, 100.0));
        session.fire("SPY", trade("SPY", 2, -1.0));
        session.fire("SPY", trade("SPY", 3, 101.0));

        let first = stream.next().await.unwrap();
        assert_eq!(
            first,
            FeedMessage::Event(MarketEvent::Tick(Tick::new("SPY", 1, 100.0, 1.0)))
        );
        let second = stream.next().await.unwrap();
        assert!(matches!(second, FeedMessage::Event(e) if e.timestamp() == 3));
    }

    #[tokio::test]
    async fn test_connection_lost_terminates_stream() {
        let session = Arc::new(CallbackSession::default());
        let mut feed = MarketDataFeed::new(session.clone());
        let mut stream = feed.subscribe("ES").unwrap();

        session.fire("ES", RawMarketEvent::Disconnected);
        session.fire("ES", trade("ES", 5, 4500.0));

        assert_eq!(
            stream.next().await,
            Some(FeedMessage::ConnectionLost { symbol: "ES".into() })
        );
        assert_eq!(stream.next().await, None);
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let session = Arc::new(CallbackSession::default());
        let mut feed = MarketDataFeed::new(session.clone());
        let mut stream = feed.subscribe("SPY").unwrap();

        session.fire("SPY", trade("SPY", 1, 100.0));
        feed.unsubscribe("SPY");
        session.fire("SPY", trade("SPY", 2, 100.0));

        assert_eq!(stream.next().await, None);
        assert_eq!(session.callback_count(), 0);
        assert!(!feed.is_subscribed("SPY"));

        // unknown symbol is a no-op
        feed.unsubscribe("QQQ");
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let session = Arc::new(CallbackSession::default());
        let mut feed = MarketDataFeed::new(session.clone());
        let _stream = feed.subscribe("SPY").unwrap();

        assert!(matches!(
            feed.subscribe("SPY"),
            Err(BrokerError::AlreadySubscribed(_))
        ));

        feed.subscribe("QQQ").unwrap();
        feed.unsubscribe_all();
        assert!(feed.subscribed().is_empty());
        assert_eq!(session.callback_count(), 0);
    }
}
