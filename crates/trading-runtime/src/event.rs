//! Engine inputs and outputs.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use trading_broker::RetryError;
use trading_core::error::BrokerError;
use trading_core::types::{
    Bar, BrokerEvent, BrokerOrder, MarketEvent, OrderRequest, Position, SessionBounds,
};
use uuid::Uuid;

/// Everything prepared for a trading day.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    pub bounds: SessionBounds,
    /// `(configured id, tradable symbol)`; equal for stocks, the front-month
    /// contract for futures classes
    pub instruments: Vec<(String, String)>,
    /// Completed bars preceding the session, per tradable symbol
    pub history: HashMap<String, Vec<Bar>>,
    /// Account balance for sizing, if it could be fetched
    pub balance: Option<Decimal>,
}

/// One input to the engine. All inputs are serialized through a single queue.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A normalized market event from a subscription.
    Market(MarketEvent),
    /// An order-status update from the broker.
    Broker(BrokerEvent),
    /// Periodic timer.
    Timer,
    /// A brokerage session was opened.
    Connected,
    /// A connection attempt failed.
    ConnectFailed { attempt: u32, error: BrokerError },
    /// The session or one of its streams died.
    ConnectionLost { reason: String },
    /// Outcome of a submission, after retries.
    Submitted {
        client_order_id: Uuid,
        result: Result<String, RetryError>,
    },
    /// Outcome of a cancel request.
    CancelSent {
        client_order_id: Uuid,
        result: Result<(), RetryError>,
    },
    /// Broker orders and positions fetched for resynchronization.
    Resynced(Result<(Vec<BrokerOrder>, Vec<Position>), RetryError>),
    SessionPrepared(SessionPlan),
    /// The market does not trade on this date.
    NoSession { date: NaiveDate },
    SessionFailed { date: NaiveDate, reason: String },
    /// Operator stop.
    Stop,
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::Market(_) => "market",
            RuntimeEvent::Broker(_) => "broker",
            RuntimeEvent::Timer => "timer",
            RuntimeEvent::Connected => "connected",
            RuntimeEvent::ConnectFailed { .. } => "connect_failed",
            RuntimeEvent::ConnectionLost { .. } => "connection_lost",
            RuntimeEvent::Submitted { .. } => "submitted",
            RuntimeEvent::CancelSent { .. } => "cancel_sent",
            RuntimeEvent::Resynced(_) => "resynced",
            RuntimeEvent::SessionPrepared(_) => "session_prepared",
            RuntimeEvent::NoSession { .. } => "no_session",
            RuntimeEvent::SessionFailed { .. } => "session_failed",
            RuntimeEvent::Stop => "stop",
        }
    }
}

/// I/O the engine asks the runtime to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open a brokerage session after `delay`.
    Connect { attempt: u32, delay: Duration },
    /// Drop the current session and its subscriptions.
    Disconnect,
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
    Submit { request: OrderRequest },
    Cancel {
        client_order_id: Uuid,
        broker_order_id: String,
    },
    /// Fetch broker orders and positions.
    Resync,
    PrepareSession { date: NaiveDate },
    /// Stop the event loop.
    Finish,
}
