//! Async shell around [`TraderEngine`].
//!
//! One control task owns the engine, the brokerage session and the market
//! streams. Order callbacks, spawned I/O results and operator commands are
//! marshalled into a single unbounded queue; market streams and the timer
//! are polled by the same `select!`, so the engine only ever sees one event
//! at a time.

use chrono::NaiveDate;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};
use trading_broker::{retry, submit_with_retry, RetryError};
use trading_core::error::{BrokerError, DataError, TradingError};
use trading_core::traits::{
    AccountBalance, BrokerSession, Brokerage, CallbackId, ChartData, Clock, ContractResolver,
    MarketHours,
};
use trading_core::types::{ConnectionState, FeedMessage};
use trading_data::{MarketDataFeed, MarketStream};
use trading_monitor::EventObserver;

use crate::config::{InstrumentConfig, InstrumentKind, RetryConfig, SizingConfig, TraderConfig};
use crate::engine::{RunReport, StrategyFactory, TraderEngine};
use crate::event::{Command, RuntimeEvent, SessionPlan};

/// The outside world the trader depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub brokerage: Arc<dyn Brokerage>,
    pub market_hours: Arc<dyn MarketHours>,
    pub chart_data: Arc<dyn ChartData>,
    pub balance: Arc<dyn AccountBalance>,
    pub contracts: Arc<dyn ContractResolver>,
    pub clock: Arc<dyn Clock>,
}

enum Message {
    Event(RuntimeEvent),
    /// A connect attempt produced a session.
    Opened {
        attempt: u32,
        session: Arc<dyn BrokerSession>,
    },
}

/// Operator control over a running trader.
#[derive(Clone)]
pub struct TraderHandle {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
}

impl TraderHandle {
    /// Ask the trader to cancel its orders and stop.
    pub fn stop(&self) {
        if self.tx.send(Message::Event(RuntimeEvent::Stop)).is_err() {
            debug!("Stop requested after the trader exited");
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `state`. Returns false if the
    /// trader exits first.
    pub async fn wait_for_state(&mut self, state: ConnectionState) -> bool {
        self.state.wait_for(|current| *current == state).await.is_ok()
    }
}

/// Live session and its subscriptions.
struct Link {
    session: Arc<dyn BrokerSession>,
    feed: MarketDataFeed,
    order_callback: CallbackId,
}

/// Runs a [`TraderEngine`] against real collaborators.
pub struct TraderRuntime {
    engine: TraderEngine,
    collaborators: Collaborators,
    config: TraderConfig,
    retry: RetryConfig,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    state_tx: watch::Sender<ConnectionState>,
}

impl TraderRuntime {
    /// Validate settings and build a runtime ready to [`run`](Self::run).
    pub fn new(
        config: TraderConfig,
        retry: RetryConfig,
        sizing: SizingConfig,
        factory: StrategyFactory,
        observer: Arc<dyn EventObserver>,
        collaborators: Collaborators,
    ) -> Result<Self, TradingError> {
        let engine = TraderEngine::new(config.clone(), retry.clone(), sizing, factory, observer)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(engine.connection_state());
        Ok(Self {
            engine,
            collaborators,
            config,
            retry,
            tx,
            rx,
            state_tx,
        })
    }

    pub fn handle(&self) -> TraderHandle {
        TraderHandle {
            tx: self.tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Run until stopped, the market closes with `stop_at_close`, or
    /// reconnection is exhausted.
    pub async fn run(mut self) -> Result<RunReport, TradingError> {
        let mut link: Option<Link> = None;
        let mut streams: StreamMap<String, MarketStream> = StreamMap::new();
        let mut timer = interval(Duration::from_millis(self.config.timer_interval_ms));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            brokerage = self.collaborators.brokerage.name(),
            instruments = self.config.instruments.len(),
            "Trader starting"
        );
        let commands = self.engine.start(self.collaborators.clock.now());
        self.publish_state();
        let mut finished = self.execute(commands, &mut link, &mut streams);

        while !finished {
            let event = tokio::select! {
                biased;
                message = self.rx.recv() => match message {
                    Some(Message::Event(event)) => event,
                    Some(Message::Opened { attempt, session }) => {
                        self.install(attempt, session, &mut link, &mut streams)
                    }
                    None => {
                        return Err(TradingError::Internal("event queue closed".into()));
                    }
                },
                Some((symbol, message)) = streams.next(), if !streams.is_empty() => match message {
                    FeedMessage::Event(event) => RuntimeEvent::Market(event),
                    FeedMessage::ConnectionLost { .. } => {
                        streams.remove(&symbol);
                        RuntimeEvent::ConnectionLost {
                            reason: format!("market data stream for {} ended", symbol),
                        }
                    }
                },
                _ = timer.tick() => match &link {
                    Some(current) if !current.session.is_alive() => RuntimeEvent::ConnectionLost {
                        reason: "session no longer alive".into(),
                    },
                    _ => RuntimeEvent::Timer,
                },
            };

            let commands = self.engine.handle(event, self.collaborators.clock.now());
            self.publish_state();
            finished = self.execute(commands, &mut link, &mut streams);
        }

        Self::teardown(&mut link, &mut streams);
        let report = self.engine.report();
        info!(
            exit_reason = ?report.exit_reason,
            positions = report.positions.len(),
            realized_pnl = %report.realized_pnl,
            "Trader stopped"
        );
        Ok(report)
    }

    fn publish_state(&self) {
        self.state_tx.send_if_modified(|state| {
            let next = self.engine.connection_state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    /// Wire a fresh session and tell the engine about it.
    fn install(
        &self,
        attempt: u32,
        session: Arc<dyn BrokerSession>,
        link: &mut Option<Link>,
        streams: &mut StreamMap<String, MarketStream>,
    ) -> RuntimeEvent {
        Self::teardown(link, streams);

        let tx = self.tx.clone();
        let registered = session.register_order_callback(Box::new(move |event| {
            let _ = tx.send(Message::Event(RuntimeEvent::Broker(event)));
        }));
        match registered {
            Ok(order_callback) => {
                *link = Some(Link {
                    feed: MarketDataFeed::new(Arc::clone(&session)),
                    session,
                    order_callback,
                });
                RuntimeEvent::Connected
            }
            Err(error) => RuntimeEvent::ConnectFailed { attempt, error },
        }
    }

    fn teardown(link: &mut Option<Link>, streams: &mut StreamMap<String, MarketStream>) {
        if let Some(mut current) = link.take() {
            current.feed.unsubscribe_all();
            current.session.deregister(current.order_callback);
            debug!("Brokerage session released");
        }
        streams.clear();
    }

    /// Carry out engine commands. Returns true once the engine is finished.
    fn execute(
        &self,
        commands: Vec<Command>,
        link: &mut Option<Link>,
        streams: &mut StreamMap<String, MarketStream>,
    ) -> bool {
        let mut finished = false;
        for command in commands {
            match command {
                Command::Connect { attempt, delay } => self.spawn_connect(attempt, delay),
                Command::Disconnect => Self::teardown(link, streams),
                Command::Subscribe { symbol } => {
                    let Some(current) = link.as_mut() else {
                        debug!(symbol = %symbol, "Subscribe without a session skipped");
                        continue;
                    };
                    match current.feed.subscribe(&symbol) {
                        Ok(stream) => {
                            streams.insert(symbol, stream);
                        }
                        Err(BrokerError::AlreadySubscribed(_)) => {}
                        Err(err) => warn!(symbol = %symbol, error = %err, "Subscribe failed"),
                    }
                }
                Command::Unsubscribe { symbol } => {
                    if let Some(current) = link.as_mut() {
                        current.feed.unsubscribe(&symbol);
                    }
                    streams.remove(&symbol);
                }
                Command::Submit { request } => {
                    let client_order_id = request.client_order_id;
                    let Some(session) = link.as_ref().map(|l| Arc::clone(&l.session)) else {
                        self.send(RuntimeEvent::Submitted {
                            client_order_id,
                            result: Err(RetryError::Fatal(BrokerError::Disconnected)),
                        });
                        continue;
                    };
                    let policy = self.retry.submit.clone();
                    self.spawn(async move {
                        let result = submit_with_retry(session, request, &policy).await;
                        RuntimeEvent::Submitted {
                            client_order_id,
                            result,
                        }
                    });
                }
                Command::Cancel {
                    client_order_id,
                    broker_order_id,
                } => {
                    let Some(session) = link.as_ref().map(|l| Arc::clone(&l.session)) else {
                        self.send(RuntimeEvent::CancelSent {
                            client_order_id,
                            result: Err(RetryError::Fatal(BrokerError::Disconnected)),
                        });
                        continue;
                    };
                    let policy = self.retry.submit.clone();
                    self.spawn(async move {
                        let result = retry(&policy, "cancel", |_| {
                            let session = Arc::clone(&session);
                            let broker_order_id = broker_order_id.clone();
                            async move { session.cancel_order(&broker_order_id).await }
                        })
                        .await;
                        RuntimeEvent::CancelSent {
                            client_order_id,
                            result,
                        }
                    });
                }
                Command::Resync => {
                    let Some(session) = link.as_ref().map(|l| Arc::clone(&l.session)) else {
                        self.send(RuntimeEvent::Resynced(Err(RetryError::Fatal(
                            BrokerError::Disconnected,
                        ))));
                        continue;
                    };
                    let policy = self.retry.submit.clone();
                    self.spawn(async move {
                        let result = retry(&policy, "resync", |_| {
                            let session = Arc::clone(&session);
                            async move {
                                let orders = session.orders().await?;
                                let positions = session.positions().await?;
                                Ok::<_, BrokerError>((orders, positions))
                            }
                        })
                        .await;
                        RuntimeEvent::Resynced(result)
                    });
                }
                Command::PrepareSession { date } => {
                    let collaborators = self.collaborators.clone();
                    let instruments = self.config.instruments.clone();
                    let lookback = self.config.lookback;
                    self.spawn(prepare_session(collaborators, instruments, lookback, date));
                }
                Command::Finish => finished = true,
            }
        }
        finished
    }

    fn send(&self, event: RuntimeEvent) {
        let _ = self.tx.send(Message::Event(event));
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = RuntimeEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = task.await;
            // the loop may already have exited
            let _ = tx.send(Message::Event(event));
        });
    }

    fn spawn_connect(&self, attempt: u32, delay: Duration) {
        let brokerage = Arc::clone(&self.collaborators.brokerage);
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            info!(attempt, brokerage = brokerage.name(), "Connecting");
            let message = match timeout(limit, brokerage.connect()).await {
                Ok(Ok(session)) => Message::Opened { attempt, session },
                Ok(Err(error)) => Message::Event(RuntimeEvent::ConnectFailed { attempt, error }),
                Err(_) => Message::Event(RuntimeEvent::ConnectFailed {
                    attempt,
                    error: BrokerError::Timeout(format!("connect exceeded {:?}", limit)),
                }),
            };
            let _ = tx.send(message);
        });
    }
}

/// Fetch everything the engine needs to start a trading day.
///
/// Missing history or balance is tolerated; a calendar or contract lookup
/// failure fails the preparation so it is retried.
fn prepare_session(
    collaborators: Collaborators,
    instruments: Vec<InstrumentConfig>,
    lookback: usize,
    date: NaiveDate,
) -> BoxFuture<'static, RuntimeEvent> {
    async move {
        let bounds = match collaborators.market_hours.current_session_bounds(date).await {
            Ok(bounds) => bounds,
            Err(DataError::NoSession(_)) => return RuntimeEvent::NoSession { date },
            Err(err) => {
                return RuntimeEvent::SessionFailed {
                    date,
                    reason: format!("market hours: {}", err),
                }
            }
        };

        let mut resolved = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let symbol = match instrument.kind {
                InstrumentKind::Stock => instrument.symbol.clone(),
                InstrumentKind::Future => match collaborators
                    .contracts
                    .resolve_front_month(&instrument.symbol, date)
                    .await
                {
                    Ok(code) => {
                        info!(class = %instrument.symbol, contract = %code, "Front month resolved");
                        code
                    }
                    Err(err) => {
                        return RuntimeEvent::SessionFailed {
                            date,
                            reason: format!("front month for {}: {}", instrument.symbol, err),
                        }
                    }
                },
            };
            resolved.push((instrument.symbol, symbol));
        }

        let mut history = HashMap::new();
        for (_, symbol) in &resolved {
            match collaborators.chart_data.historical_bars(symbol, lookback).await {
                Ok(bars) => {
                    history.insert(symbol.clone(), bars);
                }
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "No history, starting with an empty window")
                }
            }
        }

        let balance = match collaborators.balance.current_balance().await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(error = %err, "Account balance unavailable");
                None
            }
        };

        RuntimeEvent::SessionPrepared(SessionPlan {
            bounds,
            instruments: resolved,
            history,
            balance,
        })
    }
    .boxed()
}
