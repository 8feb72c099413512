//! Simulated brokerage for paper trading and tests.
//!
//! Prices are pushed in with [`PaperBrokerage::publish_trade`] or
//! [`PaperBrokerage::publish_bar`]. Each publish fills working orders for
//! that instrument, then forwards the market event and the resulting order
//! events to the live session. Orders rest at the brokerage across
//! disconnects, so fills can happen while no session is listening.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};
use trading_core::error::BrokerError;
use trading_core::traits::{
    AccountBalance, BrokerSession, Brokerage, CallbackId, MarketCallback, OrderCallback,
};
use trading_core::types::{
    Bar, BrokerEvent, BrokerEventKind, BrokerOrder, OrderRequest, OrderStatus, OrderType,
    Position, RawMarketEvent, Side,
};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Settings {
    slippage_pct: Decimal,
    commission_per_unit: Decimal,
    max_fill_quantity: Option<Decimal>,
    duplicate_fills: bool,
}

struct SimOrder {
    order: BrokerOrder,
    order_type: OrderType,
    limit_price: Option<Decimal>,
    number: u64,
}

struct Account {
    settings: Settings,
    cash: Decimal,
    orders: HashMap<Uuid, SimOrder>,
    by_broker_id: HashMap<String, Uuid>,
    order_count: u64,
    positions: HashMap<String, Position>,
    marks: HashMap<String, Decimal>,
}

struct Shared {
    account: Mutex<Account>,
    live: Mutex<Option<Weak<PaperSession>>>,
    fail_connects: AtomicU32,
    fail_submissions: AtomicU32,
    lost_responses: AtomicU32,
    next_callback: AtomicU64,
}

/// Decrement `counter` if positive. Returns whether it was.
fn consume(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Paper trading brokerage.
///
/// Cloning yields another handle to the same simulated account.
#[derive(Clone)]
pub struct PaperBrokerage {
    shared: Arc<Shared>,
}

impl PaperBrokerage {
    /// Create a paper account holding `initial_cash`.
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            shared: Arc::new(Shared {
                account: Mutex::new(Account {
                    settings: Settings {
                        slippage_pct: dec!(0.05),
                        commission_per_unit: Decimal::ZERO,
                        max_fill_quantity: None,
                        duplicate_fills: false,
                    },
                    cash: initial_cash,
                    orders: HashMap::new(),
                    by_broker_id: HashMap::new(),
                    order_count: 0,
                    positions: HashMap::new(),
                    marks: HashMap::new(),
                }),
                live: Mutex::new(None),
                fail_connects: AtomicU32::new(0),
                fail_submissions: AtomicU32::new(0),
                lost_responses: AtomicU32::new(0),
                next_callback: AtomicU64::new(1),
            }),
        }
    }

    /// Set slippage as a percentage of the trade price.
    pub fn with_slippage(self, slippage_pct: Decimal) -> Self {
        self.account().settings.slippage_pct = slippage_pct;
        self
    }

    /// Set commission charged per unit filled.
    pub fn with_commission(self, commission_per_unit: Decimal) -> Self {
        self.account().settings.commission_per_unit = commission_per_unit;
        self
    }

    /// Fill at most `quantity` per order on each published price.
    pub fn with_max_fill_quantity(self, quantity: Decimal) -> Self {
        self.account().settings.max_fill_quantity = Some(quantity);
        self
    }

    /// Deliver every fill event twice.
    pub fn with_duplicate_fills(self) -> Self {
        self.account().settings.duplicate_fills = true;
        self
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` submissions fail before reaching the book.
    pub fn fail_next_submissions(&self, n: u32) {
        self.shared.fail_submissions.store(n, Ordering::SeqCst);
    }

    /// Accept the next `n` submissions but report a timeout to the caller.
    pub fn lose_next_submission_responses(&self, n: u32) {
        self.shared.lost_responses.store(n, Ordering::SeqCst);
    }

    /// Kill the live session. Its market callbacks see `Disconnected`.
    pub fn drop_connection(&self) {
        let session = self
            .live()
            .take()
            .and_then(|weak| weak.upgrade());
        if let Some(session) = session {
            warn!(session = session.id, "Paper session disconnected");
            session.disconnect();
        }
    }

    /// Publish a trade print for `symbol`.
    pub fn publish_trade(&self, symbol: &str, timestamp: i64, price: f64, volume: f64) {
        let events = match Decimal::try_from(price) {
            Ok(price) if price > Decimal::ZERO => self.match_orders(symbol, price, timestamp),
            _ => Vec::new(),
        };
        let raw = RawMarketEvent::Trade {
            symbol: symbol.to_string(),
            timestamp,
            price,
            volume,
        };
        self.deliver(symbol, raw, events);
    }

    /// Publish a completed bar for `symbol`. Working orders fill at its open.
    pub fn publish_bar(&self, symbol: &str, bar: Bar) {
        let events = match Decimal::try_from(bar.open) {
            Ok(open) if open > Decimal::ZERO && bar.is_valid() => {
                self.match_orders(symbol, open, bar.timestamp)
            }
            _ => Vec::new(),
        };
        let raw = RawMarketEvent::Bar {
            symbol: symbol.to_string(),
            bar,
        };
        self.deliver(symbol, raw, events);
    }

    /// Cash balance.
    pub fn cash(&self) -> Decimal {
        self.account().cash
    }

    /// Cash plus open positions at their last published price.
    pub fn equity(&self) -> Decimal {
        let account = self.account();
        let holdings: Decimal = account
            .positions
            .values()
            .map(|p| {
                let mark = account
                    .marks
                    .get(&p.symbol)
                    .copied()
                    .unwrap_or(p.avg_entry_price);
                p.quantity * mark
            })
            .sum();
        account.cash + holdings
    }

    /// Non-flat positions held at the brokerage, sorted by symbol.
    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.account().open_positions()
    }

    /// Every order the brokerage has accepted, in submission order.
    pub fn orders_snapshot(&self) -> Vec<BrokerOrder> {
        self.account().all_orders()
    }

    fn account(&self) -> MutexGuard<'_, Account> {
        self.shared.account.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> MutexGuard<'_, Option<Weak<PaperSession>>> {
        self.shared.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn match_orders(&self, symbol: &str, price: Decimal, timestamp: i64) -> Vec<BrokerEvent> {
        let mut account = self.account();
        account.marks.insert(symbol.to_string(), price);
        let settings = account.settings.clone();

        let mut ids: Vec<(u64, Uuid)> = account
            .orders
            .values()
            .filter(|o| o.order.symbol == symbol && o.order.status.is_working())
            .map(|o| (o.number, o.order.client_order_id))
            .collect();
        ids.sort();

        let mut events = Vec::new();
        for (_, id) in ids {
            let Some(sim) = account.orders.get_mut(&id) else {
                continue;
            };
            let side = sim.order.side;
            let slip = price * settings.slippage_pct / dec!(100);
            let fill_price = match side {
                Side::Buy => price + slip,
                Side::Sell => price - slip,
            };

            if sim.order_type == OrderType::Limit {
                let marketable = match (side, sim.limit_price) {
                    (Side::Buy, Some(limit)) => fill_price <= limit,
                    (Side::Sell, Some(limit)) => fill_price >= limit,
                    (_, None) => false,
                };
                if !marketable {
                    continue;
                }
            }

            let remaining = sim.order.quantity - sim.order.filled_quantity;
            let quantity = settings
                .max_fill_quantity
                .map_or(remaining, |max| max.min(remaining));
            if quantity <= Decimal::ZERO {
                continue;
            }

            let order = &mut sim.order;
            let prior_value = order.avg_fill_price.unwrap_or(Decimal::ZERO) * order.filled_quantity;
            order.filled_quantity += quantity;
            order.avg_fill_price =
                Some((prior_value + fill_price * quantity) / order.filled_quantity);
            let seq = order.last_fill_seq.map_or(1, |s| s + 1);
            order.last_fill_seq = Some(seq);
            order.status = if order.filled_quantity >= order.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };

            let event = BrokerEvent {
                client_order_id: id,
                broker_order_id: order.broker_order_id.clone(),
                kind: BrokerEventKind::Fill {
                    seq,
                    quantity,
                    price: fill_price,
                },
                timestamp,
            };
            debug!(order_id = %id, seq, quantity = %quantity, price = %fill_price, "Paper fill");

            let commission = settings.commission_per_unit * quantity;
            let notional = fill_price * quantity;
            match side {
                Side::Buy => account.cash -= notional + commission,
                Side::Sell => account.cash += notional - commission,
            }
            account
                .positions
                .entry(symbol.to_string())
                .or_insert_with(|| Position::flat(symbol))
                .apply_fill(side, quantity, fill_price);

            if settings.duplicate_fills {
                events.push(event.clone());
            }
            events.push(event);
        }
        events
    }

    fn deliver(&self, symbol: &str, raw: RawMarketEvent, events: Vec<BrokerEvent>) {
        let session = self.live().as_ref().and_then(Weak::upgrade);
        match session {
            Some(session) if session.is_alive() => {
                session.dispatch_market(symbol, raw);
                for event in events {
                    session.dispatch_order(event);
                }
            }
            _ => {
                if !events.is_empty() {
                    debug!(symbol = %symbol, fills = events.len(), "Fills while no session is connected");
                }
            }
        }
    }
}

impl Account {
    fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    fn all_orders(&self) -> Vec<BrokerOrder> {
        let mut orders: Vec<&SimOrder> = self.orders.values().collect();
        orders.sort_by_key(|o| o.number);
        orders.into_iter().map(|o| o.order.clone()).collect()
    }
}

#[async_trait]
impl Brokerage for PaperBrokerage {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if consume(&self.shared.fail_connects) {
            return Err(BrokerError::Connection("simulated connect failure".into()));
        }

        let id = self.shared.next_callback.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(PaperSession {
            id,
            shared: Arc::clone(&self.shared),
            alive: AtomicBool::new(true),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let previous = self.live().replace(Arc::downgrade(&session));
        if let Some(old) = previous.and_then(|weak| weak.upgrade()) {
            old.alive.store(false, Ordering::SeqCst);
        }
        info!(session = id, "Paper session opened");
        Ok(session)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[async_trait]
impl AccountBalance for PaperBrokerage {
    async fn current_balance(&self) -> Result<Decimal, BrokerError> {
        Ok(self.equity())
    }
}

#[derive(Default)]
struct Callbacks {
    market: HashMap<u64, (String, MarketCallback)>,
    order: HashMap<u64, OrderCallback>,
}

/// One connection to a [`PaperBrokerage`].
///
/// Callbacks run under the session's callback lock and must not call back
/// into the session.
pub struct PaperSession {
    id: u64,
    shared: Arc<Shared>,
    alive: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl PaperSession {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn account(&self) -> MutexGuard<'_, Account> {
        self.shared.account.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_alive(&self) -> Result<(), BrokerError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let callbacks = self.callbacks();
        for (_, callback) in callbacks.market.values() {
            callback(RawMarketEvent::Disconnected);
        }
    }

    fn dispatch_market(&self, symbol: &str, raw: RawMarketEvent) {
        let callbacks = self.callbacks();
        for (subscribed, callback) in callbacks.market.values() {
            if subscribed == symbol {
                callback(raw.clone());
            }
        }
    }

    fn dispatch_order(&self, event: BrokerEvent) {
        let callbacks = self.callbacks();
        for callback in callbacks.order.values() {
            callback(event.clone());
        }
    }

    fn next_callback_id(&self) -> u64 {
        self.shared.next_callback.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSession for PaperSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        self.ensure_alive()?;
        if consume(&self.shared.fail_submissions) {
            return Err(BrokerError::NetworkError("simulated submission failure".into()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(BrokerError::OrderRejected(format!(
                "invalid quantity {}",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Err(BrokerError::OrderRejected("limit order without a price".into()));
        }

        let ack = {
            let mut account = self.account();
            if let Some(existing) = account.orders.get(&request.client_order_id) {
                debug!(order_id = %request.client_order_id, "Duplicate submission returns existing order");
                return Ok(existing.order.broker_order_id.clone());
            }

            account.order_count += 1;
            let number = account.order_count;
            let broker_order_id = format!("PAPER-{}", number);
            account.orders.insert(
                request.client_order_id,
                SimOrder {
                    order: BrokerOrder {
                        client_order_id: request.client_order_id,
                        broker_order_id: broker_order_id.clone(),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        quantity: request.quantity,
                        status: OrderStatus::Acked,
                        filled_quantity: Decimal::ZERO,
                        avg_fill_price: None,
                        last_fill_seq: None,
                    },
                    order_type: request.order_type,
                    limit_price: request.limit_price,
                    number,
                },
            );
            account
                .by_broker_id
                .insert(broker_order_id.clone(), request.client_order_id);

            BrokerEvent {
                client_order_id: request.client_order_id,
                broker_order_id,
                kind: BrokerEventKind::Acknowledged,
                timestamp: chrono::Utc::now().timestamp_millis(),
            }
        };

        let broker_order_id = ack.broker_order_id.clone();
        self.dispatch_order(ack);

        if consume(&self.shared.lost_responses) {
            return Err(BrokerError::Timeout("simulated lost submission response".into()));
        }
        Ok(broker_order_id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.ensure_alive()?;

        let event = {
            let mut account = self.account();
            let id = account
                .by_broker_id
                .get(broker_order_id)
                .copied()
                .ok_or_else(|| BrokerError::OrderNotFound(broker_order_id.to_string()))?;
            let sim = account
                .orders
                .get_mut(&id)
                .ok_or_else(|| BrokerError::OrderNotFound(broker_order_id.to_string()))?;

            if sim.order.status.is_terminal() {
                return Err(BrokerError::OrderRejected(format!(
                    "order already {}",
                    sim.order.status
                )));
            }
            sim.order.status = OrderStatus::Cancelled;

            BrokerEvent {
                client_order_id: id,
                broker_order_id: broker_order_id.to_string(),
                kind: BrokerEventKind::Cancelled,
                timestamp: chrono::Utc::now().timestamp_millis(),
            }
        };

        self.dispatch_order(event);
        Ok(())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.ensure_alive()?;
        Ok(self.account().all_orders())
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.ensure_alive()?;
        Ok(self.account().open_positions())
    }

    fn register_market_callback(
        &self,
        symbol: &str,
        callback: MarketCallback,
    ) -> Result<CallbackId, BrokerError> {
        self.ensure_alive()?;
        let id = self.next_callback_id();
        self.callbacks()
            .market
            .insert(id, (symbol.to_string(), callback));
        Ok(CallbackId(id))
    }

    fn register_order_callback(&self, callback: OrderCallback) -> Result<CallbackId, BrokerError> {
        self.ensure_alive()?;
        let id = self.next_callback_id();
        self.callbacks().order.insert(id, callback);
        Ok(CallbackId(id))
    }

    fn deregister(&self, id: CallbackId) {
        let mut callbacks = self.callbacks();
        callbacks.market.remove(&id.0);
        callbacks.order.remove(&id.0);
    }
}
