//! Error types for the trading runtime.
//!
//! [`TradingError`] is the taxonomy the runtime reasons about. Component
//! errors ([`BrokerError`], [`DataError`], [`OrderError`], [`StrategyError`])
//! are converted into it at the component boundary.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::types::OrderStatus;

/// Top-level trading error.
#[derive(Error, Debug)]
pub enum TradingError {
    /// Network or I/O failure that is worth retrying.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The broker refused an order. Terminal for that order.
    #[error("Broker rejected order: {0}")]
    BrokerRejection(String),

    /// Market data older than what was already accepted.
    #[error("Stale data ignored for {symbol}: timestamp {timestamp} <= last accepted {last}")]
    StaleDataIgnored {
        symbol: String,
        timestamp: i64,
        last: i64,
    },

    /// The brokerage connection dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Submission retries were exhausted.
    #[error("Submission of order {client_order_id} failed after {attempts} attempts: {reason}")]
    SubmissionFailed {
        client_order_id: Uuid,
        attempts: u32,
        reason: String,
    },

    /// Invalid configuration detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data error: {0}")]
    Data(DataError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Broker error: {0}")]
    Broker(BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradingError {
    /// Errors that must reach the operator surface.
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            TradingError::SubmissionFailed { .. } | TradingError::Configuration(_)
        )
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TradingError::TransientIo(_) => "transient_io",
            TradingError::BrokerRejection(_) => "broker_rejection",
            TradingError::StaleDataIgnored { .. } => "stale_data_ignored",
            TradingError::ConnectionLost(_) => "connection_lost",
            TradingError::SubmissionFailed { .. } => "submission_failed",
            TradingError::Configuration(_) => "configuration",
            TradingError::Data(_) => "data",
            TradingError::Order(_) => "order",
            TradingError::Broker(_) => "broker",
            TradingError::Io(_) => "io",
            TradingError::Internal(_) => "internal",
        }
    }
}

impl From<BrokerError> for TradingError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::OrderRejected(reason) => TradingError::BrokerRejection(reason),
            BrokerError::Disconnected => TradingError::ConnectionLost("session closed".into()),
            BrokerError::Configuration(msg) => TradingError::Configuration(msg),
            err if err.is_transient() => TradingError::TransientIo(err.to_string()),
            err => TradingError::Broker(err),
        }
    }
}

impl From<DataError> for TradingError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::StaleData {
                symbol,
                timestamp,
                last,
            } => TradingError::StaleDataIgnored {
                symbol,
                timestamp,
                last,
            },
            DataError::ConnectionError(msg) => TradingError::TransientIo(msg),
            err => TradingError::Data(err),
        }
    }
}

/// Strategy-specific errors.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Strategy not found: {0}")]
    NotFound(String),
}

impl From<StrategyError> for TradingError {
    fn from(err: StrategyError) -> Self {
        TradingError::Configuration(err.to_string())
    }
}

/// Broker-specific errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session is disconnected")]
    Disconnected,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl BrokerError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Timeout(_)
                | BrokerError::RateLimited { .. }
                | BrokerError::NetworkError(_)
        )
    }
}

/// Data source errors.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("No data available for the requested range")]
    NoDataAvailable,

    #[error("No trading session on {0}")]
    NoSession(NaiveDate),

    #[error("Stale data for {symbol}: timestamp {timestamp} <= last accepted {last}")]
    StaleData {
        symbol: String,
        timestamp: i64,
        last: i64,
    },

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Data source error: {0}")]
    Internal(String),
}

/// Order table errors. None of these leave an order partially updated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Unknown order: {0}")]
    UnknownOrder(Uuid),

    #[error("Invalid transition for order {client_order_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        client_order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Fill of {attempted} would overfill order {client_order_id} ({filled} of {quantity} filled)")]
    Overfill {
        client_order_id: Uuid,
        quantity: Decimal,
        filled: Decimal,
        attempted: Decimal,
    },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(Decimal),
}

/// Indicator calculation errors.
#[derive(Error, Debug)]
pub enum IndicatorError {
    #[error("Insufficient data: need {required} points, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type alias for trading operations.
pub type TradingResult<T> = Result<T, TradingError>;
