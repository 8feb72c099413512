//! Serialized trading logic.
//!
//! [`TraderEngine`] owns the instrument windows, one strategy per
//! instrument, the order manager and the connection state machine. It
//! handles one [`RuntimeEvent`] at a time and returns the [`Command`]s the
//! runtime must carry out. It never performs I/O, so every decision it
//! makes can be replayed in a test by feeding it events.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trading_broker::{OrderManager, OrderUpdate, RetryError, RetryPolicy};
use trading_core::error::{BrokerError, StrategyError, TradingError};
use trading_core::traits::Strategy;
use trading_core::types::{
    BrokerEvent, BrokerEventKind, BrokerOrder, ConnectionState, DerivedSnapshot, MarketEvent,
    Order, OrderPurpose, OrderRequest, Position, Signal,
};
use trading_indicators::InstrumentState;
use trading_monitor::{EventObserver, TraderEvent};
use trading_risk::PositionSizer;
use uuid::Uuid;

use crate::config::{RetryConfig, SizingConfig, TraderConfig};
use crate::event::{Command, RuntimeEvent, SessionPlan};
use crate::hours::{trading_date, SessionWindow};

/// Builds a fresh strategy for each instrument.
pub type StrategyFactory =
    Box<dyn Fn() -> Result<Box<dyn Strategy>, StrategyError> + Send + Sync>;

/// Why the trader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    OperatorStop,
    MarketClose,
    ReconnectExhausted,
    /// The brokerage refused the configured credentials or account.
    ConfigurationError,
}

/// Counters kept over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub events: u64,
    pub signals: u64,
    pub orders_submitted: u64,
    pub fills_applied: u64,
    pub duplicate_fills: u64,
    pub stale_events: u64,
    pub rejections: u64,
    pub submission_failures: u64,
    pub reconnects: u64,
    pub flattens: u64,
}

/// Final state handed back when the runtime stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub exit_reason: Option<ExitReason>,
    /// Non-flat positions at exit
    pub positions: Vec<Position>,
    /// Orders still working at exit, normally none
    pub working_orders: Vec<Order>,
    pub archived_orders: Vec<Order>,
    pub realized_pnl: Decimal,
    pub stats: EngineStats,
}

struct Instrument {
    /// Configured id; the futures class for futures
    configured: String,
    state: InstrumentState,
    strategy: Box<dyn Strategy>,
    /// Not part of today's session; kept until flat and idle
    retired: bool,
}

/// The trader's state machine.
pub struct TraderEngine {
    config: TraderConfig,
    reconnect: RetryPolicy,
    sizer: PositionSizer,
    factory: StrategyFactory,
    observer: Arc<dyn EventObserver>,
    orders: OrderManager,
    instruments: BTreeMap<String, Instrument>,

    connection: ConnectionState,
    /// A live brokerage session exists
    has_session: bool,
    ever_connected: bool,
    /// Local orders and positions match the broker's after a connect
    synced: bool,
    resync_in_flight: bool,
    cancels_sent: HashSet<Uuid>,

    session: Option<SessionWindow>,
    /// Date whose preparation completed, with or without a session
    session_date: Option<NaiveDate>,
    prepare_in_flight: Option<NaiveDate>,
    prepare_retry_at: Option<i64>,
    session_ended: bool,
    flattened: bool,
    /// Symbols to flatten once their working orders are done
    flatten_pending: BTreeSet<String>,
    balance: Option<Decimal>,

    shutdown_deadline: Option<i64>,
    exit_reason: Option<ExitReason>,
    finished: bool,
    stats: EngineStats,
}

impl TraderEngine {
    /// Validate settings and create an engine in `Disconnected`.
    ///
    /// The factory is called once here so a misconfigured strategy fails
    /// at startup rather than at the first session.
    pub fn new(
        config: TraderConfig,
        retry: RetryConfig,
        sizing: SizingConfig,
        factory: StrategyFactory,
        observer: Arc<dyn EventObserver>,
    ) -> Result<Self, TradingError> {
        config.validate().map_err(TradingError::Configuration)?;
        retry.validate().map_err(TradingError::Configuration)?;
        sizing.validate().map_err(TradingError::Configuration)?;
        factory().map_err(|e| TradingError::Configuration(e.to_string()))?;

        Ok(Self {
            orders: OrderManager::new(config.order_archive_limit),
            reconnect: retry.reconnect,
            sizer: sizing.build(),
            config,
            factory,
            observer,
            instruments: BTreeMap::new(),
            connection: ConnectionState::Disconnected,
            has_session: false,
            ever_connected: false,
            synced: false,
            resync_in_flight: false,
            cancels_sent: HashSet::new(),
            session: None,
            session_date: None,
            prepare_in_flight: None,
            prepare_retry_at: None,
            session_ended: false,
            flattened: false,
            flatten_pending: BTreeSet::new(),
            balance: None,
            shutdown_deadline: None,
            exit_reason: None,
            finished: false,
            stats: EngineStats::default(),
        })
    }

    /// Begin connecting and prepare today's session.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.connection != ConnectionState::Disconnected {
            warn!(state = %self.connection, "Engine already started");
            return commands;
        }
        self.set_connection(ConnectionState::Connecting, now);
        commands.push(Command::Connect {
            attempt: 1,
            delay: Duration::ZERO,
        });
        self.maybe_prepare(now, &mut commands);
        commands
    }

    /// Apply one event and return the I/O it calls for.
    pub fn handle(&mut self, event: RuntimeEvent, now: DateTime<Utc>) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.finished {
            debug!(event = event.name(), "Event after finish ignored");
            return commands;
        }
        self.stats.events += 1;

        match event {
            RuntimeEvent::Market(event) => self.on_market(event, now, &mut commands),
            RuntimeEvent::Broker(event) => self.on_broker(event, now, &mut commands),
            RuntimeEvent::Timer => self.on_timer(now, &mut commands),
            RuntimeEvent::Connected => self.on_connected(now, &mut commands),
            RuntimeEvent::ConnectFailed { attempt, error } => {
                self.on_connect_failed(attempt, error, now, &mut commands)
            }
            RuntimeEvent::ConnectionLost { reason } => {
                self.on_connection_lost(&reason, now, &mut commands)
            }
            RuntimeEvent::Submitted {
                client_order_id,
                result,
            } => self.on_submitted(client_order_id, result, now, &mut commands),
            RuntimeEvent::CancelSent {
                client_order_id,
                result,
            } => self.on_cancel_sent(client_order_id, result, &mut commands),
            RuntimeEvent::Resynced(result) => self.on_resynced(result, now, &mut commands),
            RuntimeEvent::SessionPrepared(plan) => {
                self.on_session_prepared(plan, now, &mut commands)
            }
            RuntimeEvent::NoSession { date } => {
                info!(date = %date, "Market closed today");
                self.prepare_in_flight = None;
                self.session_date = Some(date);
                self.session = None;
            }
            RuntimeEvent::SessionFailed { date, reason } => {
                warn!(date = %date, reason = %reason, "Session preparation failed");
                self.prepare_in_flight = None;
                self.prepare_retry_at =
                    Some(now.timestamp_millis() + self.config.session_retry_ms as i64);
            }
            RuntimeEvent::Stop => self.shutdown(ExitReason::OperatorStop, now, &mut commands),
        }

        if self.connection == ConnectionState::ShuttingDown
            && !self.orders.has_working_orders()
        {
            self.finished = true;
            info!(reason = ?self.exit_reason, "Shutdown complete");
            commands.push(Command::Finish);
        }
        commands
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether local state has been reconciled since the last connect.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn session(&self) -> Option<&SessionWindow> {
        self.session.as_ref()
    }

    /// Non-flat positions.
    pub fn positions(&self) -> Vec<Position> {
        self.orders.positions()
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    /// Copy of an instrument's derived state.
    pub fn snapshot(&self, symbol: &str) -> Option<DerivedSnapshot> {
        self.instruments
            .get(symbol)
            .map(|instrument| instrument.state.snapshot(None))
    }

    /// Tradable symbols currently tracked.
    pub fn instruments(&self) -> Vec<String> {
        self.instruments.keys().cloned().collect()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn report(&self) -> RunReport {
        let mut working_orders: Vec<Order> = self.orders.working_orders().cloned().collect();
        working_orders.sort_by_key(|o| o.submitted_at);
        RunReport {
            exit_reason: self.exit_reason,
            positions: self.orders.positions(),
            working_orders,
            archived_orders: self.orders.archived().cloned().collect(),
            realized_pnl: self.orders.realized_pnl(),
            stats: self.stats.clone(),
        }
    }

    fn emit(&self, event: TraderEvent) {
        self.observer.on_event(&event);
    }

    fn alert(&self, kind: &str, message: String, now: DateTime<Utc>) {
        self.emit(TraderEvent::OperatorAlert {
            kind: kind.to_string(),
            message,
            timestamp: now.timestamp_millis(),
        });
    }

    fn set_connection(&mut self, to: ConnectionState, now: DateTime<Utc>) {
        let from = self.connection;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Illegal connection transition ignored");
            return;
        }
        self.connection = to;
        self.emit(TraderEvent::ConnectionChanged {
            from,
            to,
            timestamp: now.timestamp_millis(),
        });
    }

    fn on_connected(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.connection != ConnectionState::Connecting {
            debug!(state = %self.connection, "Late connection ignored");
            return;
        }
        if self.ever_connected {
            self.stats.reconnects += 1;
        }
        self.ever_connected = true;
        self.has_session = true;
        self.synced = false;
        self.set_connection(ConnectionState::Connected, now);

        self.request_resync(commands);
        for symbol in self.instruments.keys() {
            commands.push(Command::Subscribe {
                symbol: symbol.clone(),
            });
        }
    }

    fn on_connect_failed(
        &mut self,
        attempt: u32,
        error: BrokerError,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        if self.connection != ConnectionState::Connecting {
            return;
        }
        if matches!(error, BrokerError::Configuration(_)) {
            let err = TradingError::from(error);
            self.alert(err.kind(), err.to_string(), now);
            self.shutdown(ExitReason::ConfigurationError, now, commands);
            return;
        }
        if attempt >= self.reconnect.max_attempts {
            self.alert(
                "reconnect_exhausted",
                format!("gave up connecting after {} attempts: {}", attempt, error),
                now,
            );
            self.shutdown(ExitReason::ReconnectExhausted, now, commands);
            return;
        }

        let delay = self.reconnect.backoff(attempt);
        warn!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "Connect failed");
        self.emit(TraderEvent::ReconnectAttempt {
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
        });
        commands.push(Command::Connect {
            attempt: attempt + 1,
            delay,
        });
    }

    /// In-flight orders are left alone; new submissions wait for the
    /// reconnect and resynchronization.
    fn on_connection_lost(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        if self.connection != ConnectionState::Connected {
            debug!(state = %self.connection, reason = %reason, "Connection loss ignored");
            return;
        }
        let err = TradingError::ConnectionLost(reason.to_string());
        warn!(error = %err, working_orders = self.orders.working_orders().count(), "Reconnecting");

        self.set_connection(ConnectionState::Reconnecting, now);
        self.has_session = false;
        self.synced = false;
        self.resync_in_flight = false;
        commands.push(Command::Disconnect);

        self.set_connection(ConnectionState::Connecting, now);
        let delay = self.reconnect.backoff(1);
        self.emit(TraderEvent::ReconnectAttempt {
            attempt: 1,
            delay_ms: delay.as_millis() as u64,
        });
        commands.push(Command::Connect { attempt: 1, delay });
    }

    fn request_resync(&mut self, commands: &mut Vec<Command>) {
        if !self.resync_in_flight {
            self.resync_in_flight = true;
            commands.push(Command::Resync);
        }
    }

    fn on_market(&mut self, event: MarketEvent, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let timestamp = event.timestamp();
        let symbol = event.symbol().to_string();
        let Some(instrument) = self.instruments.get_mut(&symbol) else {
            debug!(symbol = %symbol, "Event for untracked instrument ignored");
            return;
        };

        let snapshot = match instrument.state.update(&event) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.stats.stale_events += 1;
                let err = TradingError::from(err);
                warn!(symbol = %symbol, error = %err, "Market event dropped");
                return;
            }
        };
        if let Some(bar) = &snapshot.completed_bar {
            instrument.strategy.on_bar(bar);
        }

        self.check_flatten(timestamp, now, commands);
        self.check_close(timestamp, now, commands);

        if let Some(reason) = self.evaluation_blocked(&symbol, timestamp) {
            debug!(symbol = %symbol, price = snapshot.last_price, reason, "Signal evaluation skipped");
            return;
        }

        let position = self.orders.position(&symbol).cloned();
        let Some(instrument) = self.instruments.get_mut(&symbol) else {
            return;
        };
        if !instrument.strategy.is_warmed_up(snapshot.window_len) {
            debug!(symbol = %symbol, bars = snapshot.window_len, "Strategy warming up");
            return;
        }
        let retired = instrument.retired;
        if let Some(signal) = instrument.strategy.evaluate(&snapshot, position.as_ref()) {
            self.on_signal(signal, position, retired, now, commands);
        }
    }

    /// Why signals may not be evaluated for `symbol` at `timestamp`.
    fn evaluation_blocked(&self, symbol: &str, timestamp: i64) -> Option<&'static str> {
        if self.connection != ConnectionState::Connected {
            return Some("not connected");
        }
        if !self.synced {
            return Some("awaiting resynchronization");
        }
        match &self.session {
            None => return Some("no session"),
            Some(window) if !window.allows_trading(timestamp) => {
                return Some("outside trading window")
            }
            Some(_) => {}
        }
        if self.flattened || self.session_ended {
            return Some("session flattened");
        }
        if self.orders.has_working_order(symbol) || self.flatten_pending.contains(symbol) {
            return Some("order working");
        }
        None
    }

    fn on_signal(
        &mut self,
        signal: Signal,
        position: Option<Position>,
        retired: bool,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        self.stats.signals += 1;
        self.emit(TraderEvent::SignalFired {
            signal: signal.clone(),
        });
        let open_position = position.filter(|p| !p.is_flat());

        match signal.signal_type.entry_side() {
            Some(side) => {
                if open_position.is_some() {
                    debug!(symbol = %signal.symbol, "Entry while holding ignored");
                    return;
                }
                if retired {
                    debug!(symbol = %signal.symbol, "Entry for retired instrument ignored");
                    return;
                }
                let Some(balance) = self.balance else {
                    warn!(symbol = %signal.symbol, "No account balance, entry skipped");
                    return;
                };
                let Ok(price) = Decimal::try_from(signal.price) else {
                    warn!(symbol = %signal.symbol, price = signal.price, "Unpriceable signal");
                    return;
                };
                let quantity = self.sizer.calculate(balance, &signal, price);
                if quantity <= Decimal::ZERO {
                    info!(symbol = %signal.symbol, balance = %balance, "Entry sized to zero, skipped");
                    return;
                }
                self.place(
                    OrderRequest::market(&signal.symbol, side, quantity),
                    OrderPurpose::Entry,
                    now,
                    commands,
                );
            }
            None => {
                let Some(position) = open_position else {
                    debug!(symbol = %signal.symbol, "Exit while flat ignored");
                    return;
                };
                let Some(side) = position.closing_side() else {
                    return;
                };
                self.place(
                    OrderRequest::market(&position.symbol, side, position.abs_quantity()),
                    OrderPurpose::Exit,
                    now,
                    commands,
                );
            }
        }
    }

    fn place(
        &mut self,
        request: OrderRequest,
        purpose: OrderPurpose,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        match self.orders.submit(request.clone(), purpose, now) {
            Ok(_) => {
                self.stats.orders_submitted += 1;
                commands.push(Command::Submit { request });
            }
            Err(err) => warn!(symbol = %request.symbol, error = %err, "Order not placed"),
        }
    }

    fn on_broker(&mut self, event: BrokerEvent, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let rejected = matches!(event.kind, BrokerEventKind::Rejected { .. });
        match self.orders.on_broker_event(&event, now) {
            Ok(update) => {
                if rejected && update.order().is_some() {
                    self.stats.rejections += 1;
                }
                // a skipped fill may be lost rather than late; ask the broker
                let gap = update
                    .order()
                    .is_some_and(|o| o.is_working() && !o.missing_fill_seqs().is_empty());
                if gap && self.connection == ConnectionState::Connected {
                    self.request_resync(commands);
                }
                self.apply_update(update);
            }
            Err(err) => {
                warn!(order_id = %event.client_order_id, error = %err, "Broker event not applied");
            }
        }
        self.after_order_changes(now, commands);
    }

    fn apply_update(&mut self, update: OrderUpdate) {
        match update {
            OrderUpdate::Applied {
                order,
                previous,
                fill,
            } => {
                if let Some(applied) = &fill {
                    self.stats.fills_applied += 1;
                    self.emit(TraderEvent::FillApplied {
                        client_order_id: order.client_order_id,
                        symbol: order.symbol.clone(),
                        quantity: applied.fill.quantity,
                        price: applied.fill.price,
                        position: applied.position.quantity,
                        realized_pnl: applied.realized_pnl,
                    });
                    if let Some(instrument) = self.instruments.get_mut(&order.symbol) {
                        instrument.strategy.on_fill(&order);
                    }
                }
                if order.status != previous {
                    self.emit(TraderEvent::OrderChanged { previous, order });
                }
            }
            OrderUpdate::Duplicate {
                client_order_id,
                seq,
            } => {
                self.stats.duplicate_fills += 1;
                debug!(order_id = %client_order_id, seq, "Duplicate fill");
            }
            OrderUpdate::Ignored {
                client_order_id,
                reason,
            } => {
                debug!(order_id = %client_order_id, reason = %reason, "Broker event ignored");
            }
        }
    }

    fn on_submitted(
        &mut self,
        client_order_id: Uuid,
        result: Result<String, RetryError>,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        let update = match result {
            Ok(broker_order_id) => self.orders.acknowledge(client_order_id, &broker_order_id, now),
            Err(RetryError::Fatal(BrokerError::OrderRejected(reason))) => {
                self.stats.rejections += 1;
                let err = TradingError::BrokerRejection(reason.clone());
                warn!(order_id = %client_order_id, error = %err, "Order rejected");
                self.orders.reject(client_order_id, &reason, now)
            }
            Err(err) => {
                self.stats.submission_failures += 1;
                let failure = TradingError::SubmissionFailed {
                    client_order_id,
                    attempts: err.attempts().unwrap_or(1),
                    reason: err.last_error().to_string(),
                };
                self.alert(failure.kind(), failure.to_string(), now);
                // the broker may hold the order even though we never heard back
                if self.connection == ConnectionState::Connected {
                    self.request_resync(commands);
                }
                self.orders
                    .mark_submission_failed(client_order_id, &err.last_error().to_string(), now)
            }
        };
        match update {
            Ok(update) => self.apply_update(update),
            Err(err) => warn!(order_id = %client_order_id, error = %err, "Submission result not applied"),
        }
        self.after_order_changes(now, commands);
    }

    fn on_cancel_sent(
        &mut self,
        client_order_id: Uuid,
        result: Result<(), RetryError>,
        commands: &mut Vec<Command>,
    ) {
        if let Err(err) = result {
            warn!(order_id = %client_order_id, error = %err, "Cancel failed");
            if self.has_session {
                self.request_resync(commands);
            }
        }
    }

    fn on_resynced(
        &mut self,
        result: Result<(Vec<BrokerOrder>, Vec<Position>), RetryError>,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        self.resync_in_flight = false;
        if !self.has_session {
            debug!("Resync result without a session ignored");
            return;
        }
        let (broker_orders, broker_positions) = match result {
            Ok(view) => view,
            Err(err) => {
                warn!(error = %err, "Resynchronization failed, will retry");
                return;
            }
        };

        let report = self.orders.reconcile(broker_orders, broker_positions, now);
        if !report.is_clean() {
            warn!(
                status_changes = report.status_changes.len(),
                adopted = report.adopted.len(),
                vanished = report.vanished.len(),
                position_changes = report.position_changes.len(),
                "Local state corrected from broker"
            );
        }
        for (client_order_id, from, _) in &report.status_changes {
            if let Some(order) = self.orders.get(*client_order_id) {
                self.emit(TraderEvent::OrderChanged {
                    previous: *from,
                    order: order.clone(),
                });
            }
        }
        self.emit(TraderEvent::Resynchronized {
            status_changes: report.status_changes.len(),
            adopted: report.adopted.len(),
            position_changes: report.position_changes.len(),
        });
        self.synced = true;
        self.after_order_changes(now, commands);
    }

    /// Follow-ups shared by every event that can change orders: deferred
    /// cancels, pending flattens and retired instruments.
    fn after_order_changes(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        self.send_cancels(commands);
        if self.may_flatten() {
            let ready: Vec<String> = self
                .flatten_pending
                .iter()
                .filter(|symbol| !self.orders.has_working_order(symbol))
                .cloned()
                .collect();
            for symbol in ready {
                self.flatten_pending.remove(&symbol);
                self.flatten_symbol(&symbol, now, commands);
            }
        }
        self.drop_idle_retired(commands);
    }

    /// Pending flattens go out while connected and synchronized, and keep
    /// going out while the trader winds down for the market close.
    fn may_flatten(&self) -> bool {
        let open = match self.connection {
            ConnectionState::Connected => true,
            ConnectionState::ShuttingDown => {
                self.has_session && self.exit_reason == Some(ExitReason::MarketClose)
            }
            _ => false,
        };
        open && self.synced
    }

    /// Send cancels for every working order that asked for one and has a
    /// broker id. During shutdown every working order is cancelled, except
    /// flattens at the market close, which drain under the shutdown timeout.
    fn send_cancels(&mut self, commands: &mut Vec<Command>) {
        if self.connection == ConnectionState::ShuttingDown {
            let keep_flattens = self.exit_reason == Some(ExitReason::MarketClose);
            let uncancelled: Vec<Uuid> = self
                .orders
                .working_orders()
                .filter(|o| !o.cancel_requested)
                .filter(|o| !(keep_flattens && o.purpose == OrderPurpose::Flatten))
                .map(|o| o.client_order_id)
                .collect();
            for id in uncancelled {
                if let Err(err) = self.orders.cancel(id) {
                    warn!(order_id = %id, error = %err, "Cancel not recorded");
                }
            }
        }

        let orders = &self.orders;
        self.cancels_sent
            .retain(|id| orders.get(*id).is_some_and(|o| o.is_working()));
        if !self.has_session {
            return;
        }

        let mut due: Vec<(Uuid, String, DateTime<Utc>)> = self
            .orders
            .working_orders()
            .filter(|o| o.cancel_requested && !self.cancels_sent.contains(&o.client_order_id))
            .filter_map(|o| {
                o.broker_order_id
                    .clone()
                    .map(|broker_id| (o.client_order_id, broker_id, o.submitted_at))
            })
            .collect();
        due.sort_by_key(|(_, _, submitted_at)| *submitted_at);
        for (client_order_id, broker_order_id, _) in due {
            self.cancels_sent.insert(client_order_id);
            commands.push(Command::Cancel {
                client_order_id,
                broker_order_id,
            });
        }
    }

    fn flatten_symbol(&mut self, symbol: &str, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let Some(position) = self.orders.position(symbol).filter(|p| !p.is_flat()).cloned() else {
            return;
        };
        let Some(side) = position.closing_side() else {
            return;
        };
        self.stats.flattens += 1;
        self.emit(TraderEvent::Flatten {
            symbol: symbol.to_string(),
            quantity: position.quantity,
            timestamp: now.timestamp_millis(),
        });
        self.place(
            OrderRequest::market(symbol, side, position.abs_quantity()),
            OrderPurpose::Flatten,
            now,
            commands,
        );
    }

    fn drop_idle_retired(&mut self, commands: &mut Vec<Command>) {
        let idle: Vec<String> = self
            .instruments
            .iter()
            .filter(|(symbol, instrument)| {
                instrument.retired
                    && !self.orders.has_working_order(symbol)
                    && self.orders.position(symbol).map_or(true, |p| p.is_flat())
            })
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in idle {
            if let Some(instrument) = self.instruments.remove(&symbol) {
                info!(symbol = %symbol, configured = %instrument.configured, "Instrument dropped");
            }
            if self.has_session {
                commands.push(Command::Unsubscribe { symbol });
            }
        }
    }

    fn on_timer(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let millis = now.timestamp_millis();
        if self.connection == ConnectionState::ShuttingDown {
            self.check_deadline(now);
            return;
        }
        if self.connection == ConnectionState::Connected && !self.synced {
            self.request_resync(commands);
        }
        self.maybe_prepare(now, commands);
        self.check_flatten(millis, now, commands);
        self.check_close(millis, now, commands);
    }

    fn maybe_prepare(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.prepare_in_flight.is_some() || self.connection == ConnectionState::ShuttingDown {
            return;
        }
        let millis = now.timestamp_millis();
        let date = trading_date(millis, self.config.utc_offset_minutes);
        if self.session_date == Some(date) {
            return;
        }
        if self.prepare_retry_at.is_some_and(|at| millis < at) {
            return;
        }
        info!(date = %date, "Preparing trading session");
        self.prepare_in_flight = Some(date);
        self.prepare_retry_at = None;
        commands.push(Command::PrepareSession { date });
    }

    /// Force-exit every open position once the pre-close cutoff passes.
    /// Runs once per session; waits for a synchronized connection.
    fn check_flatten(&mut self, timestamp: i64, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let Some(window) = self.session else {
            return;
        };
        if self.flattened || !window.past_cutoff(timestamp) {
            return;
        }
        if self.connection != ConnectionState::Connected || !self.synced {
            return;
        }
        self.flattened = true;
        info!(date = %window.bounds.date, "Flatten cutoff reached");

        let working: Vec<(Uuid, String)> = self
            .orders
            .working_orders()
            .map(|o| (o.client_order_id, o.symbol.clone()))
            .collect();
        for (id, symbol) in working {
            if let Err(err) = self.orders.cancel(id) {
                warn!(order_id = %id, error = %err, "Cancel not recorded");
            }
            self.flatten_pending.insert(symbol);
        }
        for position in self.orders.positions() {
            self.flatten_pending.insert(position.symbol);
        }
        self.after_order_changes(now, commands);
    }

    fn check_close(&mut self, timestamp: i64, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let Some(window) = self.session else {
            return;
        };
        if self.session_ended || !window.is_closed(timestamp) {
            return;
        }
        self.session_ended = true;
        self.emit(TraderEvent::SessionEnded {
            date: window.bounds.date,
            timestamp,
        });
        if self.config.stop_at_close {
            self.shutdown(ExitReason::MarketClose, now, commands);
        }
    }

    fn on_session_prepared(
        &mut self,
        plan: SessionPlan,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        self.prepare_in_flight = None;
        if self.connection == ConnectionState::ShuttingDown {
            return;
        }

        let bounds = plan.bounds;
        self.session = Some(SessionWindow::new(
            bounds,
            self.config.flatten_before_close_minutes,
        ));
        self.session_date = Some(bounds.date);
        self.session_ended = false;
        self.flattened = false;
        if let Some(balance) = plan.balance {
            self.balance = Some(balance);
        } else {
            warn!(date = %bounds.date, "Account balance unavailable, keeping last known");
        }

        let open = bounds.open_millis();
        let mut active = Vec::with_capacity(plan.instruments.len());
        for (configured, symbol) in &plan.instruments {
            if !self.instruments.contains_key(symbol) {
                let strategy = match (self.factory)() {
                    Ok(strategy) => strategy,
                    Err(err) => {
                        let err = TradingError::Configuration(err.to_string());
                        self.alert(err.kind(), err.to_string(), now);
                        continue;
                    }
                };
                let mut instrument = Instrument {
                    configured: configured.clone(),
                    state: InstrumentState::new(
                        symbol.as_str(),
                        self.config.timeframe,
                        self.config.lookback,
                    ),
                    strategy,
                    retired: false,
                };
                let history = plan.history.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
                for bar in instrument.state.seed(history) {
                    instrument.strategy.on_bar(&bar);
                }
                debug!(symbol = %symbol, bars = instrument.state.window().len(), "Instrument seeded");
                self.instruments.insert(symbol.clone(), instrument);
                if self.has_session {
                    commands.push(Command::Subscribe {
                        symbol: symbol.clone(),
                    });
                }
            }

            if let Some(instrument) = self.instruments.get_mut(symbol) {
                instrument.retired = false;
                if let Some(bar) = instrument.state.begin_session(open) {
                    instrument.strategy.on_bar(&bar);
                }
                instrument.strategy.begin_session();
                active.push(symbol.clone());
            }
        }

        for (symbol, instrument) in self.instruments.iter_mut() {
            if !instrument.retired && !active.contains(symbol) {
                info!(symbol = %symbol, configured = %instrument.configured, "Instrument retired");
                instrument.retired = true;
            }
        }
        self.drop_idle_retired(commands);

        self.emit(TraderEvent::SessionStarted {
            date: bounds.date,
            open,
            close: bounds.close_millis(),
            instruments: active,
        });
    }

    fn shutdown(&mut self, reason: ExitReason, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.connection == ConnectionState::ShuttingDown {
            return;
        }
        info!(reason = ?reason, "Shutting down");
        self.exit_reason = Some(reason);
        self.set_connection(ConnectionState::ShuttingDown, now);
        self.shutdown_deadline =
            Some(now.timestamp_millis() + self.config.shutdown_timeout_ms as i64);

        if self.has_session {
            self.send_cancels(commands);
        } else {
            self.force_cancel_all(now);
        }
    }

    fn check_deadline(&mut self, now: DateTime<Utc>) {
        if self
            .shutdown_deadline
            .is_some_and(|deadline| now.timestamp_millis() >= deadline)
            && self.orders.has_working_orders()
        {
            warn!("Shutdown timeout, force-cancelling unresponsive orders");
            self.force_cancel_all(now);
        }
    }

    fn force_cancel_all(&mut self, now: DateTime<Utc>) {
        let ids: Vec<Uuid> = self
            .orders
            .working_orders()
            .map(|o| o.client_order_id)
            .collect();
        for id in ids {
            let previous = self.orders.get(id).map(|o| o.status);
            if let (Some(previous), Some(order)) = (previous, self.orders.force_cancel(id, now)) {
                self.emit(TraderEvent::OrderChanged { previous, order });
            }
        }
    }
}

impl std::fmt::Debug for TraderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderEngine")
            .field("connection", &self.connection)
            .field("synced", &self.synced)
            .field("instruments", &self.instruments.keys().collect::<Vec<_>>())
            .field("session", &self.session)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use trading_core::types::{Bar, OrderStatus, SessionBounds, Side, Tick, Timeframe};
    use trading_monitor::RecordingObserver;
    use trading_risk::PositionSizingMethod;
    use trading_strategies::{RangeBreakoutConfig, RangeBreakoutStrategy};

    const MINUTE: i64 = 60_000;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn bounds() -> SessionBounds {
        SessionBounds {
            date: NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
            open: Utc.with_ymd_and_hms(2024, 1, 8, 14, 30, 0).unwrap(),
            close: Utc.with_ymd_and_hms(2024, 1, 8, 21, 0, 0).unwrap(),
        }
    }

    fn open() -> i64 {
        bounds().open_millis()
    }

    fn close() -> i64 {
        bounds().close_millis()
    }

    fn engine(observer: Arc<RecordingObserver>) -> TraderEngine {
        let config = TraderConfig {
            instruments: vec![InstrumentConfig::stock("SPY")],
            timeframe: Timeframe::Minute1,
            lookback: 5,
            flatten_before_close_minutes: 10,
            shutdown_timeout_ms: 5_000,
            ..Default::default()
        };
        let sizing = SizingConfig {
            method: PositionSizingMethod::Fixed { shares: dec!(5) },
            max_shares: None,
            use_signal_strength: false,
        };
        let factory: StrategyFactory = Box::new(|| {
            Ok(Box::new(RangeBreakoutStrategy::new(RangeBreakoutConfig::default()))
                as Box<dyn Strategy>)
        });
        TraderEngine::new(config, RetryConfig::default(), sizing, factory, observer).unwrap()
    }

    fn plan() -> SessionPlan {
        // prior range 99..101 = 2
        let history = vec![
            Bar::new(open() - 3 * MINUTE, 100.0, 101.0, 99.5, 100.5, 10.0),
            Bar::new(open() - 2 * MINUTE, 100.5, 100.8, 99.0, 100.0, 10.0),
        ];
        SessionPlan {
            bounds: bounds(),
            instruments: vec![("SPY".into(), "SPY".into())],
            history: HashMap::from([("SPY".to_string(), history)]),
            balance: Some(dec!(100000)),
        }
    }

    fn tick(ts: i64, price: f64) -> RuntimeEvent {
        RuntimeEvent::Market(MarketEvent::Tick(Tick::new("SPY", ts, price, 1.0)))
    }

    /// Started, connected, synchronized and in today's session.
    fn ready_engine() -> (TraderEngine, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::new());
        let mut engine = engine(observer.clone());
        let start = open() - 30 * MINUTE;

        let commands = engine.start(at(start));
        assert_eq!(
            commands,
            vec![
                Command::Connect {
                    attempt: 1,
                    delay: Duration::ZERO
                },
                Command::PrepareSession {
                    date: bounds().date
                },
            ]
        );
        assert_eq!(engine.handle(RuntimeEvent::Connected, at(start)), vec![Command::Resync]);
        engine.handle(RuntimeEvent::Resynced(Ok((vec![], vec![]))), at(start));
        let commands = engine.handle(RuntimeEvent::SessionPrepared(plan()), at(start));
        assert_eq!(
            commands,
            vec![Command::Subscribe {
                symbol: "SPY".into()
            }]
        );
        assert!(engine.is_synced());
        (engine, observer)
    }

    fn submitted(commands: &[Command]) -> Vec<OrderRequest> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Submit { request } => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn fill(request: &OrderRequest, seq: u64, quantity: Decimal, price: Decimal) -> RuntimeEvent {
        RuntimeEvent::Broker(BrokerEvent {
            client_order_id: request.client_order_id,
            broker_order_id: "B-1".into(),
            kind: BrokerEventKind::Fill {
                seq,
                quantity,
                price,
            },
            timestamp: open() + MINUTE,
        })
    }

    /// Enter long and return the entry request.
    fn enter_long(engine: &mut TraderEngine) -> OrderRequest {
        assert!(engine.handle(tick(open() + 1_000, 100.0), at(open() + 1_000)).is_empty());
        let commands = engine.handle(tick(open() + 2_000, 101.1), at(open() + 2_000));
        let requests = submitted(&commands);
        assert_eq!(requests.len(), 1);
        requests[0].clone()
    }

    #[test]
    fn test_breakout_entry_is_sized_and_submitted() {
        let (mut engine, observer) = ready_engine();
        let request = enter_long(&mut engine);

        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.quantity, dec!(5));
        assert_eq!(
            engine.orders().get(request.client_order_id).unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(
            observer
                .matching(|e| matches!(e, TraderEvent::SignalFired { .. }))
                .len(),
            1
        );

        // one working order per instrument
        let commands = engine.handle(tick(open() + 3_000, 101.5), at(open() + 3_000));
        assert!(submitted(&commands).is_empty());
    }

    #[test]
    fn test_partial_fills_build_position() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;

        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Acked);

        engine.handle(fill(&request, 1, dec!(3), dec!(101.1)), at(open() + 4_000));
        assert_eq!(
            engine.orders().get(id).unwrap().status,
            OrderStatus::PartiallyFilled
        );
        // the same fill delivered again changes nothing
        engine.handle(fill(&request, 1, dec!(3), dec!(101.1)), at(open() + 4_500));
        engine.handle(fill(&request, 2, dec!(2), dec!(101.2)), at(open() + 5_000));

        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Filled);
        assert_eq!(engine.positions()[0].quantity, dec!(5));
        assert_eq!(engine.stats().duplicate_fills, 1);
        assert_eq!(engine.stats().fills_applied, 2);
    }

    #[test]
    fn test_out_of_order_fills_resync_and_apply() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );

        let commands = engine.handle(fill(&request, 2, dec!(2), dec!(101.2)), at(open() + 4_000));
        assert_eq!(commands, vec![Command::Resync]);
        assert_eq!(engine.positions()[0].quantity, dec!(2));

        // the earlier fill shows up before the broker answers
        let commands = engine.handle(fill(&request, 1, dec!(3), dec!(101.1)), at(open() + 4_500));
        assert!(commands.is_empty());
        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Filled);
        assert_eq!(engine.positions()[0].quantity, dec!(5));
        assert_eq!(engine.stats().fills_applied, 2);
        assert_eq!(engine.stats().duplicate_fills, 0);
        assert!(!engine.orders().has_working_order("SPY"));
    }

    #[test]
    fn test_connection_loss_keeps_acked_order() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );

        let commands = engine.handle(
            RuntimeEvent::ConnectionLost {
                reason: "socket closed".into(),
            },
            at(open() + 4_000),
        );
        assert_eq!(commands[0], Command::Disconnect);
        assert!(matches!(commands[1], Command::Connect { attempt: 1, .. }));
        assert_eq!(engine.connection_state(), ConnectionState::Connecting);
        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Acked);

        // no signals while disconnected
        let commands = engine.handle(tick(open() + 5_000, 95.0), at(open() + 5_000));
        assert!(commands.is_empty());

        let commands = engine.handle(RuntimeEvent::Connected, at(open() + 6_000));
        assert_eq!(
            commands,
            vec![
                Command::Resync,
                Command::Subscribe {
                    symbol: "SPY".into()
                }
            ]
        );

        let broker_view = BrokerOrder {
            client_order_id: id,
            broker_order_id: "B-1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: dec!(5),
            status: OrderStatus::Acked,
            filled_quantity: dec!(0),
            avg_fill_price: None,
            last_fill_seq: None,
        };
        let commands = engine.handle(
            RuntimeEvent::Resynced(Ok((vec![broker_view], vec![]))),
            at(open() + 7_000),
        );
        assert!(submitted(&commands).is_empty());
        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Acked);
        assert_eq!(engine.orders().working_orders().count(), 1);
        assert_eq!(engine.stats().reconnects, 1);
    }

    #[test]
    fn test_flatten_once_and_no_signal_after_close() {
        let (mut engine, observer) = ready_engine();
        let request = enter_long(&mut engine);
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: request.client_order_id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        engine.handle(fill(&request, 1, dec!(5), dec!(101.1)), at(open() + 4_000));

        let cutoff = close() - 10 * MINUTE;
        assert!(engine.handle(RuntimeEvent::Timer, at(cutoff - 1)).is_empty());

        let commands = engine.handle(RuntimeEvent::Timer, at(cutoff));
        let flatten = submitted(&commands);
        assert_eq!(flatten.len(), 1);
        assert_eq!(flatten[0].side, Side::Sell);
        assert_eq!(flatten[0].quantity, dec!(5));

        // later timers and ticks do not flatten again
        assert!(submitted(&engine.handle(RuntimeEvent::Timer, at(cutoff + 1_000))).is_empty());
        let commands = engine.handle(tick(close() + MINUTE, 90.0), at(close() + MINUTE));
        assert!(submitted(&commands).is_empty());
        assert_eq!(engine.snapshot("SPY").unwrap().last_price, 90.0);

        assert_eq!(engine.stats().flattens, 1);
        assert_eq!(observer.matching(|e| matches!(e, TraderEvent::Flatten { .. })).len(), 1);
        assert_eq!(
            observer
                .matching(|e| matches!(e, TraderEvent::SignalFired { .. }))
                .len(),
            1
        );
        assert_eq!(
            observer
                .matching(|e| matches!(e, TraderEvent::SessionEnded { .. }))
                .len(),
            1
        );
    }

    #[test]
    fn test_flatten_waits_for_working_order() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        engine.handle(fill(&request, 1, dec!(2), dec!(101.1)), at(open() + 4_000));

        let cutoff = close() - 10 * MINUTE;
        let commands = engine.handle(RuntimeEvent::Timer, at(cutoff));
        assert_eq!(
            commands,
            vec![Command::Cancel {
                client_order_id: id,
                broker_order_id: "B-1".into()
            }]
        );

        let commands = engine.handle(
            RuntimeEvent::Broker(BrokerEvent {
                client_order_id: id,
                broker_order_id: "B-1".into(),
                kind: BrokerEventKind::Cancelled,
                timestamp: cutoff + 100,
            }),
            at(cutoff + 100),
        );
        let flatten = submitted(&commands);
        assert_eq!(flatten.len(), 1);
        assert_eq!(flatten[0].quantity, dec!(2));
        assert_eq!(flatten[0].side, Side::Sell);
    }

    #[test]
    fn test_flatten_survives_close_shutdown() {
        let (mut engine, observer) = ready_engine();
        engine.config.stop_at_close = true;
        let request = enter_long(&mut engine);
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: request.client_order_id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        engine.handle(fill(&request, 1, dec!(5), dec!(101.1)), at(open() + 4_000));

        // first timer after the cutoff lands on the close
        let commands = engine.handle(RuntimeEvent::Timer, at(close()));
        let flatten = submitted(&commands);
        assert_eq!(flatten.len(), 1);
        assert_eq!(flatten[0].side, Side::Sell);
        assert_eq!(flatten[0].quantity, dec!(5));
        assert!(!commands.iter().any(|c| matches!(c, Command::Cancel { .. })));
        assert_eq!(engine.connection_state(), ConnectionState::ShuttingDown);

        let commands = engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: flatten[0].client_order_id,
                result: Ok("B-2".into()),
            },
            at(close() + 100),
        );
        assert!(commands.is_empty());
        assert!(!engine.orders().get(flatten[0].client_order_id).unwrap().cancel_requested);

        let commands = engine.handle(fill(&flatten[0], 1, dec!(5), dec!(100.5)), at(close() + 200));
        assert_eq!(commands, vec![Command::Finish]);
        assert!(engine.positions().is_empty());
        assert_eq!(engine.report().exit_reason, Some(ExitReason::MarketClose));
        assert_eq!(observer.matching(|e| matches!(e, TraderEvent::Flatten { .. })).len(), 1);
    }

    #[test]
    fn test_flatten_after_cancel_during_close_shutdown() {
        let (mut engine, _) = ready_engine();
        engine.config.stop_at_close = true;
        let request = enter_long(&mut engine);
        let id = request.client_order_id;
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        engine.handle(fill(&request, 1, dec!(2), dec!(101.1)), at(open() + 4_000));

        let commands = engine.handle(RuntimeEvent::Timer, at(close()));
        assert_eq!(
            commands,
            vec![Command::Cancel {
                client_order_id: id,
                broker_order_id: "B-1".into()
            }]
        );

        let commands = engine.handle(
            RuntimeEvent::Broker(BrokerEvent {
                client_order_id: id,
                broker_order_id: "B-1".into(),
                kind: BrokerEventKind::Cancelled,
                timestamp: close() + 100,
            }),
            at(close() + 100),
        );
        let flatten = submitted(&commands);
        assert_eq!(flatten.len(), 1);
        assert_eq!(flatten[0].quantity, dec!(2));
        assert!(!engine.is_finished());

        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: flatten[0].client_order_id,
                result: Ok("B-2".into()),
            },
            at(close() + 200),
        );
        let commands = engine.handle(fill(&flatten[0], 1, dec!(2), dec!(100.5)), at(close() + 300));
        assert_eq!(commands, vec![Command::Finish]);
        assert!(engine.positions().is_empty());
    }

    #[test]
    fn test_operator_stop_cancels_flatten() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: request.client_order_id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );
        engine.handle(fill(&request, 1, dec!(5), dec!(101.1)), at(open() + 4_000));

        let cutoff = close() - 10 * MINUTE;
        let flatten = submitted(&engine.handle(RuntimeEvent::Timer, at(cutoff)));
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: flatten[0].client_order_id,
                result: Ok("B-2".into()),
            },
            at(cutoff + 100),
        );

        let commands = engine.handle(RuntimeEvent::Stop, at(cutoff + 200));
        assert_eq!(
            commands,
            vec![Command::Cancel {
                client_order_id: flatten[0].client_order_id,
                broker_order_id: "B-2".into()
            }]
        );
    }

    #[test]
    fn test_exhausted_submission_alerts_and_resyncs() {
        let (mut engine, observer) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;

        let commands = engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Err(RetryError::Exhausted {
                    attempts: 3,
                    last: BrokerError::Timeout("no response".into()),
                }),
            },
            at(open() + 3_000),
        );
        assert_eq!(commands, vec![Command::Resync]);
        assert_eq!(engine.orders().get(id).unwrap().status, OrderStatus::Rejected);
        assert!(engine.positions().is_empty());

        let alerts = observer.matching(|e| matches!(e, TraderEvent::OperatorAlert { .. }));
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            &alerts[0],
            TraderEvent::OperatorAlert { kind, .. } if kind == "submission_failed"
        ));
    }

    #[test]
    fn test_rejection_is_not_an_operator_alert() {
        let (mut engine, observer) = ready_engine();
        let request = enter_long(&mut engine);

        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: request.client_order_id,
                result: Err(RetryError::Fatal(BrokerError::OrderRejected(
                    "insufficient buying power".into(),
                ))),
            },
            at(open() + 3_000),
        );
        let order = engine.orders().get(request.client_order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(engine.stats().rejections, 1);
        assert!(observer
            .matching(|e| matches!(e, TraderEvent::OperatorAlert { .. }))
            .is_empty());
    }

    #[test]
    fn test_cancel_deferred_until_acknowledged() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        let id = request.client_order_id;

        // stop before the broker answered the submission
        let commands = engine.handle(RuntimeEvent::Stop, at(open() + 3_000));
        assert!(commands.is_empty());
        assert_eq!(engine.connection_state(), ConnectionState::ShuttingDown);

        let commands = engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_500),
        );
        assert_eq!(
            commands,
            vec![Command::Cancel {
                client_order_id: id,
                broker_order_id: "B-1".into()
            }]
        );

        let commands = engine.handle(
            RuntimeEvent::Broker(BrokerEvent {
                client_order_id: id,
                broker_order_id: "B-1".into(),
                kind: BrokerEventKind::Cancelled,
                timestamp: open() + 4_000,
            }),
            at(open() + 4_000),
        );
        assert_eq!(commands, vec![Command::Finish]);
        assert!(engine.is_finished());
        assert_eq!(engine.report().exit_reason, Some(ExitReason::OperatorStop));
    }

    #[test]
    fn test_shutdown_timeout_force_cancels() {
        let (mut engine, _) = ready_engine();
        let request = enter_long(&mut engine);
        engine.handle(
            RuntimeEvent::Submitted {
                client_order_id: request.client_order_id,
                result: Ok("B-1".into()),
            },
            at(open() + 3_000),
        );

        let commands = engine.handle(RuntimeEvent::Stop, at(open() + 4_000));
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::Cancel { .. }));

        assert!(engine.handle(RuntimeEvent::Timer, at(open() + 5_000)).is_empty());
        let commands = engine.handle(RuntimeEvent::Timer, at(open() + 9_000));
        assert_eq!(commands, vec![Command::Finish]);

        let report = engine.report();
        assert!(report.working_orders.is_empty());
        assert_eq!(report.archived_orders[0].status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_reconnect_backoff_then_give_up() {
        let observer = Arc::new(RecordingObserver::new());
        let mut engine = engine(observer.clone());
        let now = at(open());
        engine.start(now);

        let commands = engine.handle(
            RuntimeEvent::ConnectFailed {
                attempt: 1,
                error: BrokerError::Connection("refused".into()),
            },
            now,
        );
        assert_eq!(
            commands,
            vec![Command::Connect {
                attempt: 2,
                delay: Duration::from_millis(500)
            }]
        );

        let commands = engine.handle(
            RuntimeEvent::ConnectFailed {
                attempt: 10,
                error: BrokerError::Connection("refused".into()),
            },
            now,
        );
        assert_eq!(commands, vec![Command::Finish]);
        assert_eq!(
            engine.report().exit_reason,
            Some(ExitReason::ReconnectExhausted)
        );
        assert_eq!(
            observer
                .matching(|e| matches!(e, TraderEvent::OperatorAlert { kind, .. } if kind == "reconnect_exhausted"))
                .len(),
            1
        );
    }

    #[test]
    fn test_no_signals_before_resync() {
        let observer = Arc::new(RecordingObserver::new());
        let mut engine = engine(observer);
        let start = open() - MINUTE;
        engine.start(at(start));
        engine.handle(RuntimeEvent::Connected, at(start));
        engine.handle(RuntimeEvent::SessionPrepared(plan()), at(start));

        engine.handle(tick(open() + 1_000, 100.0), at(open() + 1_000));
        let commands = engine.handle(tick(open() + 2_000, 102.0), at(open() + 2_000));
        assert!(submitted(&commands).is_empty());
        assert!(!engine.is_synced());

        // the timer retries only once the first resync has returned
        assert!(engine.handle(RuntimeEvent::Timer, at(open() + 3_000)).is_empty());
        engine.handle(
            RuntimeEvent::Resynced(Err(RetryError::Fatal(BrokerError::Disconnected))),
            at(open() + 3_500),
        );
        assert_eq!(
            engine.handle(RuntimeEvent::Timer, at(open() + 4_000)),
            vec![Command::Resync]
        );
    }

    #[test]
    fn test_stale_tick_is_dropped() {
        let (mut engine, _) = ready_engine();
        engine.handle(tick(open() + 2_000, 100.0), at(open() + 2_000));
        let commands = engine.handle(tick(open() + 1_000, 105.0), at(open() + 2_000));
        assert!(commands.is_empty());
        assert_eq!(engine.stats().stale_events, 1);
        assert_eq!(engine.snapshot("SPY").unwrap().last_price, 100.0);
    }

    #[test]
    fn test_contract_roll_retires_idle_instrument() {
        let observer = Arc::new(RecordingObserver::new());
        let mut engine = engine(observer);
        let start = open() - MINUTE;
        engine.start(at(start));
        engine.handle(RuntimeEvent::Connected, at(start));
        engine.handle(RuntimeEvent::Resynced(Ok((vec![], vec![]))), at(start));

        let mut first = plan();
        first.instruments = vec![("ES".into(), "ESH4".into())];
        first.history.clear();
        engine.handle(RuntimeEvent::SessionPrepared(first), at(start));
        assert_eq!(engine.instruments(), vec!["ESH4".to_string()]);

        let mut second = plan();
        second.instruments = vec![("ES".into(), "ESM4".into())];
        second.history.clear();
        let commands = engine.handle(RuntimeEvent::SessionPrepared(second), at(start));
        assert_eq!(
            commands,
            vec![
                Command::Subscribe {
                    symbol: "ESM4".into()
                },
                Command::Unsubscribe {
                    symbol: "ESH4".into()
                },
            ]
        );
        assert_eq!(engine.instruments(), vec!["ESM4".to_string()]);
    }

    #[test]
    fn test_invalid_strategy_is_a_configuration_error() {
        let factory: StrategyFactory =
            Box::new(|| Err(StrategyError::NotFound("nope".into())));
        let result = TraderEngine::new(
            TraderConfig {
                instruments: vec![InstrumentConfig::stock("SPY")],
                ..Default::default()
            },
            RetryConfig::default(),
            SizingConfig::default(),
            factory,
            Arc::new(RecordingObserver::new()),
        );
        assert!(matches!(result, Err(TradingError::Configuration(_))));
    }
}
