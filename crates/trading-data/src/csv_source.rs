//! CSV chart data.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use trading_core::error::DataError;
use trading_core::traits::{ChartData, Clock};
use trading_core::types::Bar;

/// CSV record format.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(alias = "Symbol", alias = "code", alias = "Code", default)]
    symbol: Option<String>,
    #[serde(alias = "Date", alias = "date", alias = "timestamp", alias = "Timestamp")]
    date: String,
    #[serde(alias = "Open", alias = "open")]
    open: f64,
    #[serde(alias = "High", alias = "high")]
    high: f64,
    #[serde(alias = "Low", alias = "low")]
    low: f64,
    #[serde(alias = "Close", alias = "close", alias = "Adj Close")]
    close: f64,
    #[serde(alias = "Volume", alias = "volume", default)]
    volume: f64,
}

/// Historical bars loaded from a CSV file.
///
/// Files may hold several instruments in a `symbol` column; rows without
/// one belong to the default symbol. With a clock attached, only bars that
/// started before the current time are served.
pub struct CsvDataSource {
    bars: HashMap<String, Vec<Bar>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CsvDataSource {
    /// Load a CSV file.
    pub fn load(path: impl AsRef<Path>, default_symbol: Option<&str>) -> Result<Self, DataError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::NoDataAvailable);
        }

        let reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DataError::ParseError(e.to_string()))?;

        let source = Self::from_reader(reader, default_symbol)?;
        debug!(path = %path.display(), symbols = source.bars.len(), "Loaded CSV bars");
        Ok(source)
    }

    /// Parse CSV text already in memory.
    pub fn from_csv_str(data: &str, default_symbol: Option<&str>) -> Result<Self, DataError> {
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());
        Self::from_reader(reader, default_symbol)
    }

    fn from_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        default_symbol: Option<&str>,
    ) -> Result<Self, DataError> {
        let mut bars: HashMap<String, Vec<Bar>> = HashMap::new();

        for result in reader.deserialize() {
            let record: CsvRecord = result.map_err(|e| DataError::ParseError(e.to_string()))?;

            let symbol = match record.symbol.filter(|s| !s.is_empty()) {
                Some(symbol) => symbol,
                None => default_symbol
                    .map(str::to_string)
                    .ok_or_else(|| DataError::ParseError("Row without a symbol".into()))?,
            };

            let bar = Bar::new(
                parse_timestamp(&record.date)?,
                record.open,
                record.high,
                record.low,
                record.close,
                record.volume,
            );
            if !bar.is_valid() {
                warn!(symbol = %symbol, timestamp = bar.timestamp, "Skipping invalid CSV bar");
                continue;
            }
            bars.entry(symbol).or_default().push(bar);
        }

        if bars.is_empty() {
            return Err(DataError::NoDataAvailable);
        }

        for series in bars.values_mut() {
            series.sort_by_key(|b| b.timestamp);
            series.dedup_by_key(|b| b.timestamp);
        }

        Ok(Self { bars, clock: None })
    }

    /// Serve only bars that started before `clock`'s current time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Instruments present in the file, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.bars.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Every bar for `symbol`, oldest first.
    pub fn bars(&self, symbol: &str) -> Option<&[Bar]> {
        self.bars.get(symbol).map(Vec::as_slice)
    }
}

#[async_trait]
impl ChartData for CsvDataSource {
    async fn historical_bars(&self, symbol: &str, lookback: usize) -> Result<Vec<Bar>, DataError> {
        let series = self
            .bars
            .get(symbol)
            .ok_or_else(|| DataError::SymbolNotFound(symbol.to_string()))?;

        let end = match &self.clock {
            Some(clock) => {
                let now = clock.now_millis();
                series.partition_point(|b| b.timestamp < now)
            }
            None => series.len(),
        };
        let start = end.saturating_sub(lookback);
        Ok(series[start..end].to_vec())
    }
}

/// Parse the timestamp formats found in exported chart files.
fn parse_timestamp(date_str: &str) -> Result<i64, DataError> {
    let datetime_formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];
    for format in datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(date_str, format) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
    for format in date_formats {
        if let Some(dt) = NaiveDate::parse_from_str(date_str, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }

    // Unix timestamp, milliseconds if more than 10 digits
    if let Ok(ts) = date_str.parse::<i64>() {
        return Ok(if ts > 10_000_000_000 { ts } else { ts * 1000 });
    }

    Err(DataError::ParseError(format!(
        "Could not parse date: {}",
        date_str
    )))
}
