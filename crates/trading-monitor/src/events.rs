//! Observability events emitted by the trader.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use trading_core::types::{ConnectionState, Order, OrderStatus, Signal};
use uuid::Uuid;

/// Something an operator or external monitor may want to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraderEvent {
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
        timestamp: i64,
    },
    SessionStarted {
        date: NaiveDate,
        open: i64,
        close: i64,
        instruments: Vec<String>,
    },
    SessionEnded {
        date: NaiveDate,
        timestamp: i64,
    },
    SignalFired {
        signal: Signal,
    },
    OrderChanged {
        previous: OrderStatus,
        order: Order,
    },
    FillApplied {
        client_order_id: Uuid,
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        position: Decimal,
        realized_pnl: Decimal,
    },
    Flatten {
        symbol: String,
        quantity: Decimal,
        timestamp: i64,
    },
    ReconnectAttempt {
        attempt: u32,
        delay_ms: u64,
    },
    Resynchronized {
        status_changes: usize,
        adopted: usize,
        position_changes: usize,
    },
    /// Requires operator attention.
    OperatorAlert {
        kind: String,
        message: String,
        timestamp: i64,
    },
}

impl TraderEvent {
    /// Short name of the variant, matching its serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            TraderEvent::ConnectionChanged { .. } => "connection_changed",
            TraderEvent::SessionStarted { .. } => "session_started",
            TraderEvent::SessionEnded { .. } => "session_ended",
            TraderEvent::SignalFired { .. } => "signal_fired",
            TraderEvent::OrderChanged { .. } => "order_changed",
            TraderEvent::FillApplied { .. } => "fill_applied",
            TraderEvent::Flatten { .. } => "flatten",
            TraderEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            TraderEvent::Resynchronized { .. } => "resynchronized",
            TraderEvent::OperatorAlert { .. } => "operator_alert",
        }
    }
}

/// Receives trader events. Called from the trader's event loop, so
/// implementations must return quickly.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &TraderEvent);
}

/// Writes events as structured tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, event: &TraderEvent) {
        match event {
            TraderEvent::ConnectionChanged { from, to, .. } => {
                info!(from = %from, to = %to, "Connection state changed");
            }
            TraderEvent::SessionStarted {
                date, instruments, ..
            } => {
                info!(date = %date, instruments = ?instruments, "Trading session started");
            }
            TraderEvent::SessionEnded { date, .. } => {
                info!(date = %date, "Trading session ended");
            }
            TraderEvent::SignalFired { signal } => {
                info!(
                    symbol = %signal.symbol,
                    signal = %signal.signal_type,
                    price = signal.price,
                    reason = %signal.metadata.reason,
                    "Signal fired"
                );
            }
            TraderEvent::OrderChanged { previous, order } => {
                debug!(
                    order_id = %order.client_order_id,
                    symbol = %order.symbol,
                    from = %previous,
                    to = %order.status,
                    "Order status changed"
                );
            }
            TraderEvent::FillApplied {
                symbol,
                quantity,
                price,
                position,
                ..
            } => {
                info!(symbol = %symbol, quantity = %quantity, price = %price, position = %position, "Fill applied");
            }
            TraderEvent::Flatten {
                symbol, quantity, ..
            } => {
                warn!(symbol = %symbol, quantity = %quantity, "Flattening before close");
            }
            TraderEvent::ReconnectAttempt { attempt, delay_ms } => {
                warn!(attempt, delay_ms, "Reconnecting");
            }
            TraderEvent::Resynchronized {
                status_changes,
                adopted,
                position_changes,
            } => {
                info!(status_changes, adopted, position_changes, "Resynchronized with broker");
            }
            TraderEvent::OperatorAlert { kind, message, .. } => {
                error!(kind = %kind, "{}", message);
            }
        }
    }
}

/// Forwards events to a broadcast channel for external monitors.
///
/// Slow receivers lose the oldest events; the trader never blocks.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<TraderEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<TraderEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Open another receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<TraderEvent> {
        self.tx.subscribe()
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &TraderEvent) {
        // no receivers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TraderEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<TraderEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded events matching `predicate`.
    pub fn matching(&self, predicate: impl Fn(&TraderEvent) -> bool) -> Vec<TraderEvent> {
        self.events()
            .into_iter()
            .filter(|e| predicate(e))
            .collect()
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &TraderEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fans events out to several observers in order.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl EventObserver for CompositeObserver {
    fn on_event(&self, event: &TraderEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
