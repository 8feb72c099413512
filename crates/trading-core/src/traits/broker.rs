//! Brokerage session traits.

use crate::error::BrokerError;
use crate::types::{BrokerEvent, BrokerOrder, OrderRequest, Position, RawMarketEvent};
use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked by the session for each raw market event.
pub type MarketCallback = Box<dyn Fn(RawMarketEvent) + Send + Sync>;

/// Callback invoked by the session for each order-status update.
pub type OrderCallback = Box<dyn Fn(BrokerEvent) + Send + Sync>;

/// Handle for a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Entry point to a brokerage. Produces sessions.
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Log in and open a new session.
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;

    /// Get the brokerage name.
    fn name(&self) -> &str;
}

/// A live brokerage connection.
///
/// Callbacks may fire on any thread. Implementations must not invoke a
/// callback after `deregister` for its id has returned.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Check whether the connection is still usable.
    fn is_alive(&self) -> bool;

    /// Submit a new order and return the broker order id.
    ///
    /// Submitting the same client order id twice must not create a
    /// second order.
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, BrokerError>;

    /// Cancel an existing order by broker order id.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    /// All orders the broker knows for the current trading day.
    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// All open positions.
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Register a market data callback for one instrument.
    fn register_market_callback(
        &self,
        symbol: &str,
        callback: MarketCallback,
    ) -> Result<CallbackId, BrokerError>;

    /// Register an order-status callback.
    fn register_order_callback(&self, callback: OrderCallback) -> Result<CallbackId, BrokerError>;

    /// Remove a previously registered callback.
    fn deregister(&self, id: CallbackId);
}
