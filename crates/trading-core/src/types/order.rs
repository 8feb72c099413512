//! Order types and the order status state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Get the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Get the sign for position calculations (+1 for buy, -1 for sell).
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute immediately at best available price
    Market,
    /// Execute at specified price or better
    Limit,
}

/// Order status.
///
/// `Pending -> Acked -> PartiallyFilled -> Filled`. `Rejected` and
/// `Cancelled` are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the broker
    Pending,
    /// Acknowledged by the broker, broker order id assigned
    Acked,
    /// Some but not all quantity executed
    PartiallyFilled,
    /// Completely executed
    Filled,
    /// Refused by the broker
    Rejected,
    /// Cancelled before completion
    Cancelled,
}

impl OrderStatus {
    /// Check if the order is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Check if the order can still execute.
    pub fn is_working(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Acked) => true,
            (Pending | Acked | PartiallyFilled, PartiallyFilled | Filled) => true,
            (Pending | Acked | PartiallyFilled, Rejected | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Acked => "acked",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why the runtime placed an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    /// Opens a position from flat
    Entry,
    /// Closes a position on a strategy exit signal
    Exit,
    /// Pre-close forced exit
    Flatten,
    /// Working order found at the broker during resynchronization
    Adopted,
}

/// Order request for submitting new orders.
///
/// The client order id is generated once and reused on every retry so the
/// broker can deduplicate resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency key, also the local order handle
    pub client_order_id: Uuid,
    /// Symbol to trade
    pub symbol: String,
    /// Buy or sell
    pub side: Side,
    /// Type of order
    pub order_type: OrderType,
    /// Quantity to trade
    pub quantity: Decimal,
    /// Limit price (for limit orders)
    pub limit_price: Option<Decimal>,
}

impl OrderRequest {
    /// Create a market order request.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
        }
    }

    /// Create a limit order request.
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
        }
    }

    /// Set the client order id.
    pub fn with_client_order_id(mut self, id: Uuid) -> Self {
        self.client_order_id = id;
        self
    }
}

/// A partial or complete execution of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Per-order fill sequence number, strictly increasing
    pub seq: u64,
    /// Quantity filled
    pub quantity: Decimal,
    /// Price at which the fill occurred
    pub price: Decimal,
    /// Broker timestamp of the fill (Unix milliseconds)
    pub timestamp: i64,
}

/// An order tracked by the order manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Local handle, sent to the broker as the client order id
    pub client_order_id: Uuid,
    /// Broker order id, absent until acknowledged
    pub broker_order_id: Option<String>,
    /// Symbol traded
    pub symbol: String,
    /// Buy or sell
    pub side: Side,
    /// Type of order
    pub order_type: OrderType,
    /// Original quantity
    pub quantity: Decimal,
    /// Limit price
    pub limit_price: Option<Decimal>,
    /// Why the order was placed
    pub purpose: OrderPurpose,
    /// Current status
    pub status: OrderStatus,
    /// Quantity filled so far
    pub filled_quantity: Decimal,
    /// Average fill price
    pub avg_fill_price: Option<Decimal>,
    /// Highest fill sequence number applied
    pub last_fill_seq: Option<u64>,
    /// Every fill sequence number applied so far
    #[serde(default)]
    pub applied_fill_seqs: BTreeSet<u64>,
    /// A cancel has been requested but not confirmed
    pub cancel_requested: bool,
    /// Rejection reason, if rejected
    pub reject_reason: Option<String>,
    /// When the order was submitted
    pub submitted_at: DateTime<Utc>,
    /// When the order was last updated
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new pending order from a request.
    pub fn from_request(request: &OrderRequest, purpose: OrderPurpose, now: DateTime<Utc>) -> Self {
        Self {
            client_order_id: request.client_order_id,
            broker_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            limit_price: request.limit_price,
            purpose,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            last_fill_seq: None,
            applied_fill_seqs: BTreeSet::new(),
            cancel_requested: false,
            reject_reason: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the request that created this order.
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.client_order_id,
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            limit_price: self.limit_price,
        }
    }

    /// Get the remaining quantity to be filled.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Check if the order can still execute.
    pub fn is_working(&self) -> bool {
        self.status.is_working()
    }

    /// Whether the fill with sequence number `seq` was already applied.
    pub fn has_applied_fill(&self, seq: u64) -> bool {
        self.applied_fill_seqs.contains(&seq)
    }

    /// Sequence numbers below the highest applied one that never arrived.
    pub fn missing_fill_seqs(&self) -> Vec<u64> {
        let Some(last) = self.last_fill_seq else {
            return Vec::new();
        };
        (1..last)
            .filter(|seq| !self.applied_fill_seqs.contains(seq))
            .collect()
    }

    /// Treat fills `1..=seq` as applied. Used when the broker's fill state
    /// replaces the local one.
    pub fn assume_fills_through(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            self.applied_fill_seqs.extend(1..=seq);
            self.last_fill_seq = self.last_fill_seq.max(Some(seq));
        }
    }

    /// Record an execution, updating average price and status.
    ///
    /// The caller is responsible for sequence and overfill checks.
    pub fn record_fill(&mut self, fill: &Fill, now: DateTime<Utc>) {
        let total_qty = self.filled_quantity + fill.quantity;
        let total_value = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity
            + fill.price * fill.quantity;

        if total_qty > Decimal::ZERO {
            self.avg_fill_price = Some(total_value / total_qty);
        }
        self.filled_quantity = total_qty;
        self.applied_fill_seqs.insert(fill.seq);
        self.last_fill_seq = self.last_fill_seq.max(Some(fill.seq));
        self.updated_at = now;

        self.status = if self.filled_quantity >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_request_market() {
        let request = OrderRequest::market("AAPL", Side::Buy, dec!(100));
        assert_eq!(request.symbol, "AAPL");
        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.order_type, OrderType::Market);
        assert_eq!(request.quantity, dec!(100));
    }

    #[test]
    fn test_order_from_request_keeps_client_id() {
        let request = OrderRequest::limit("AAPL", Side::Sell, dec!(50), dec!(150.00));
        let order = Order::from_request(&request, OrderPurpose::Exit, Utc::now());

        assert_eq!(order.client_order_id, request.client_order_id);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.broker_order_id.is_none());
        assert_eq!(order.to_request(), request);
    }

    #[test]
    fn test_record_fill_partial_then_complete() {
        let request = OrderRequest::market("AAPL", Side::Buy, dec!(100));
        let mut order = Order::from_request(&request, OrderPurpose::Entry, Utc::now());

        let first = Fill {
            seq: 1,
            quantity: dec!(50),
            price: dec!(150.00),
            timestamp: 0,
        };
        order.record_fill(&first, Utc::now());
        assert_eq!(order.filled_quantity, dec!(50));
        assert_eq!(order.avg_fill_price, Some(dec!(150.00)));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        let second = Fill {
            seq: 2,
            quantity: dec!(50),
            price: dec!(151.00),
            timestamp: 0,
        };
        order.record_fill(&second, Utc::now());
        assert_eq!(order.filled_quantity, dec!(100));
        assert_eq!(order.avg_fill_price, Some(dec!(150.50)));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.last_fill_seq, Some(2));
    }

    #[test]
    fn test_fill_sequence_tracking() {
        let request = OrderRequest::market("SPY", Side::Buy, dec!(10));
        let mut order = Order::from_request(&request, OrderPurpose::Entry, Utc::now());
        let fill = |seq| Fill {
            seq,
            quantity: dec!(2),
            price: dec!(100),
            timestamp: 0,
        };

        order.record_fill(&fill(3), Utc::now());
        assert_eq!(order.last_fill_seq, Some(3));
        assert_eq!(order.missing_fill_seqs(), vec![1, 2]);

        order.record_fill(&fill(1), Utc::now());
        assert_eq!(order.last_fill_seq, Some(3));
        assert!(order.has_applied_fill(1));
        assert!(!order.has_applied_fill(2));
        assert_eq!(order.missing_fill_seqs(), vec![2]);

        order.assume_fills_through(Some(4));
        assert!(order.missing_fill_seqs().is_empty());
        assert_eq!(order.last_fill_seq, Some(4));
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Acked));
        assert!(Acked.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Rejected));
        assert!(PartiallyFilled.can_transition_to(Cancelled));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Acked));
        assert!(!Acked.can_transition_to(Pending));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
