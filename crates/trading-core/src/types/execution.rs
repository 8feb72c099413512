//! Vendor-facing events: raw market data and order-status updates.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Bar, OrderStatus, Side};

/// Market data as delivered by a brokerage callback, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawMarketEvent {
    Trade {
        symbol: String,
        timestamp: i64,
        price: f64,
        volume: f64,
    },
    Bar {
        symbol: String,
        bar: Bar,
    },
    /// The transport under this subscription dropped.
    Disconnected,
}

/// Order-status update delivered by the brokerage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEvent {
    /// Client order id the order was submitted with
    pub client_order_id: Uuid,
    /// Broker-assigned order id
    pub broker_order_id: String,
    /// What happened
    pub kind: BrokerEventKind,
    /// Broker timestamp (Unix milliseconds)
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Acknowledged,
    /// An execution. `seq` increases strictly per order; redelivery of a
    /// sequence number already seen is a duplicate.
    Fill {
        seq: u64,
        quantity: Decimal,
        price: Decimal,
    },
    Rejected {
        reason: String,
    },
    Cancelled,
}

/// The broker's view of an order, used for resynchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub client_order_id: Uuid,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub last_fill_seq: Option<u64>,
}
