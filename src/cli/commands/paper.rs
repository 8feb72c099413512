//! Paper trading command: replays one trading day of CSV bars through the
//! paper brokerage while the trader runs against it.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use trading_broker::PaperBrokerage;
use trading_config::{load_config, AppConfig};
use trading_core::traits::{Clock, ManualClock};
use trading_core::types::Bar;
use trading_data::{CsvDataSource, ListedContractResolver};
use trading_monitor::{ChannelObserver, CompositeObserver, TraderEvent, TracingObserver};
use trading_runtime::{trading_date, Collaborators, InstrumentConfig, TraderRuntime};

use crate::cli::PaperArgs;

/// Pause between bars when no replay speed is given.
const MIN_STEP: Duration = Duration::from_millis(5);
/// Longest pause between bars, whatever the gap in the data.
const MAX_STEP: Duration = Duration::from_secs(5);

pub async fn run(args: PaperArgs, config_path: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.validate()?;
    if !args.speed.is_finite() || args.speed < 0.0 {
        bail!("--speed must be a non-negative number");
    }

    let data = CsvDataSource::load(&args.data, args.symbol.as_deref())
        .with_context(|| format!("loading {:?}", args.data))?;
    let symbols = data.symbols();
    let replay = replay_bars(&data, &symbols, config.market_hours.utc_offset_minutes);
    let Some(first) = replay.first() else {
        bail!("{:?} contains no bars", args.data);
    };
    let date = trading_date(first.1.timestamp, config.market_hours.utc_offset_minutes);

    let configured: Vec<&str> = config
        .trader
        .instruments
        .iter()
        .map(|i| i.symbol.as_str())
        .collect();
    if configured != symbols.iter().map(String::as_str).collect::<Vec<_>>() {
        warn!(
            configured = ?configured,
            data = ?symbols,
            "Trading the symbols found in the data file"
        );
    }
    config.trader.instruments = symbols.iter().map(InstrumentConfig::stock).collect();
    config.trader.stop_at_close = true;

    info!(
        date = %date,
        symbols = ?symbols,
        bars = replay.len(),
        "Starting paper replay"
    );

    let clock = Arc::new(ManualClock::new(first.1.timestamp));
    let paper = PaperBrokerage::new(config.broker.paper.initial_cash)
        .with_slippage(config.broker.paper.slippage_pct)
        .with_commission(config.broker.paper.commission);
    let (channel, mut events) = ChannelObserver::new(1024);
    let observer = CompositeObserver::new()
        .with(Arc::new(TracingObserver))
        .with(Arc::new(channel));

    let runtime = build_runtime(&config, paper.clone(), clock.clone(), data, Arc::new(observer))?;
    let handle = runtime.handle();
    let trader = tokio::spawn(runtime.run());

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            ctrl_c_handle.stop();
        }
    });

    match wait_until_ready(&mut events).await {
        Some(close) => {
            replay_day(&paper, &clock, &replay, args.speed).await;
            // run the clock past the close so the trader flattens and stops
            clock.set(close.max(clock.now_millis()));
        }
        None => {
            warn!(date = %date, "No trading session started, stopping");
            handle.stop();
        }
    }

    let report = trader.await??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("Paper equity: {}", paper.equity());
    Ok(())
}

fn build_runtime(
    config: &AppConfig,
    paper: PaperBrokerage,
    clock: Arc<ManualClock>,
    data: CsvDataSource,
    observer: Arc<CompositeObserver>,
) -> Result<TraderRuntime> {
    let collaborators = Collaborators {
        brokerage: Arc::new(paper.clone()),
        market_hours: config.market_hours.build(),
        chart_data: Arc::new(data.with_clock(clock.clone())),
        balance: Arc::new(paper),
        contracts: Arc::new(ListedContractResolver::new(config.contracts.clone())),
        clock,
    };
    let runtime = TraderRuntime::new(
        config.trader.clone(),
        config.retry.clone(),
        config.sizing.clone(),
        config.strategy_factory(),
        observer,
        collaborators,
    )?;
    Ok(runtime)
}

/// Bars of the last trading day in the file, in time order. Earlier bars
/// stay behind the clock and serve as history.
fn replay_bars(
    data: &CsvDataSource,
    symbols: &[String],
    utc_offset_minutes: i32,
) -> Vec<(String, Bar)> {
    let mut bars: Vec<(String, Bar)> = symbols
        .iter()
        .flat_map(|symbol| {
            data.bars(symbol)
                .unwrap_or_default()
                .iter()
                .map(move |bar| (symbol.clone(), *bar))
        })
        .collect();
    let Some(last) = bars
        .iter()
        .map(|(_, bar)| trading_date(bar.timestamp, utc_offset_minutes))
        .max()
    else {
        return Vec::new();
    };
    bars.retain(|(_, bar)| trading_date(bar.timestamp, utc_offset_minutes) == last);
    bars.sort_by_key(|(_, bar)| bar.timestamp);
    bars
}

/// Wait for the session to start and orders to be reconciled. Returns the
/// session close in Unix milliseconds.
async fn wait_until_ready(events: &mut broadcast::Receiver<TraderEvent>) -> Option<i64> {
    let mut close = None;
    let mut synced = false;
    let wait = async {
        while close.is_none() || !synced {
            match events.recv().await {
                Ok(TraderEvent::SessionStarted { close: c, .. }) => close = Some(c),
                Ok(TraderEvent::Resynchronized { .. }) => synced = true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), wait).await.is_err() {
        return None;
    }
    // subscriptions are issued right after these events
    tokio::time::sleep(Duration::from_millis(100)).await;
    close.filter(|_| synced)
}

async fn replay_day(
    paper: &PaperBrokerage,
    clock: &ManualClock,
    bars: &[(String, Bar)],
    speed: f64,
) {
    let mut previous: Option<i64> = None;
    for (symbol, bar) in bars {
        let step = match previous {
            Some(prev) if speed > 0.0 => {
                let gap = Duration::from_millis((bar.timestamp - prev).max(0) as u64);
                gap.div_f64(speed).clamp(MIN_STEP, MAX_STEP)
            }
            _ => MIN_STEP,
        };
        tokio::time::sleep(step).await;
        clock.set(bar.timestamp);
        paper.publish_bar(symbol, *bar);
        previous = Some(bar.timestamp);
    }
    info!(bars = bars.len(), "Replay finished");
}
