//! Market-hours adapters and the trading window.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trading_core::error::DataError;
use trading_core::traits::MarketHours;
use trading_core::types::SessionBounds;

/// A weekly calendar with fixed local open and close times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHoursConfig {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Offset of local exchange time from UTC
    pub utc_offset_minutes: i32,
    pub trading_days: Vec<Weekday>,
    pub holidays: Vec<NaiveDate>,
    /// Shift applied to the open, e.g. -15 for futures opening earlier
    pub open_offset_minutes: i64,
    /// Shift applied to the close
    pub close_offset_minutes: i64,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            utc_offset_minutes: 0,
            trading_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            holidays: Vec::new(),
            open_offset_minutes: 0,
            close_offset_minutes: 0,
        }
    }
}

impl MarketHoursConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.close <= self.open {
            return Err(format!(
                "market close {} must be after open {}",
                self.close, self.open
            ));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err("utc_offset_minutes must be within a day".into());
        }
        if self.trading_days.is_empty() {
            return Err("at least one trading day is required".into());
        }
        let open = self.open + Duration::minutes(self.open_offset_minutes);
        let close = self.close + Duration::minutes(self.close_offset_minutes);
        if close <= open {
            return Err("offsets leave an empty session".into());
        }
        Ok(())
    }

    /// Build the calendar, wrapped in the configured offsets if any.
    pub fn build(&self) -> Arc<dyn MarketHours> {
        let base: Arc<dyn MarketHours> = Arc::new(FixedMarketHours::new(self.clone()));
        if self.open_offset_minutes == 0 && self.close_offset_minutes == 0 {
            base
        } else {
            Arc::new(OffsetMarketHours::new(
                base,
                self.open_offset_minutes,
                self.close_offset_minutes,
            ))
        }
    }
}

/// Calendar from a [`MarketHoursConfig`], ignoring its offsets.
#[derive(Debug, Clone)]
pub struct FixedMarketHours {
    config: MarketHoursConfig,
}

impl FixedMarketHours {
    pub fn new(config: MarketHoursConfig) -> Self {
        Self { config }
    }

    fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        let utc = local - Duration::minutes(self.config.utc_offset_minutes as i64);
        utc.and_utc()
    }

    pub fn bounds(&self, date: NaiveDate) -> Option<SessionBounds> {
        if !self.config.trading_days.contains(&date.weekday())
            || self.config.holidays.contains(&date)
        {
            return None;
        }
        Some(SessionBounds {
            date,
            open: self.local_to_utc(date, self.config.open),
            close: self.local_to_utc(date, self.config.close),
        })
    }
}

#[async_trait]
impl MarketHours for FixedMarketHours {
    async fn current_session_bounds(&self, date: NaiveDate) -> Result<SessionBounds, DataError> {
        self.bounds(date).ok_or(DataError::NoSession(date))
    }
}

/// Shifts another calendar's open and close.
///
/// Futures trade a session that opens and closes 15 minutes around the
/// stock market's, so they use `OffsetMarketHours::new(hours, -15, 15)`.
pub struct OffsetMarketHours {
    inner: Arc<dyn MarketHours>,
    open_offset: Duration,
    close_offset: Duration,
}

impl OffsetMarketHours {
    pub fn new(
        inner: Arc<dyn MarketHours>,
        open_offset_minutes: i64,
        close_offset_minutes: i64,
    ) -> Self {
        Self {
            inner,
            open_offset: Duration::minutes(open_offset_minutes),
            close_offset: Duration::minutes(close_offset_minutes),
        }
    }
}

#[async_trait]
impl MarketHours for OffsetMarketHours {
    async fn current_session_bounds(&self, date: NaiveDate) -> Result<SessionBounds, DataError> {
        let bounds = self.inner.current_session_bounds(date).await?;
        Ok(SessionBounds {
            date: bounds.date,
            open: bounds.open + self.open_offset,
            close: bounds.close + self.close_offset,
        })
    }
}

/// The current session as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub bounds: SessionBounds,
    /// Positions are flattened from here on
    pub flatten_at: i64,
}

impl SessionWindow {
    pub fn new(bounds: SessionBounds, flatten_before_close_minutes: i64) -> Self {
        let flatten_at = (bounds.close_millis() - flatten_before_close_minutes * 60_000)
            .max(bounds.open_millis());
        Self { bounds, flatten_at }
    }

    /// Whether signals may be evaluated at `timestamp`.
    pub fn allows_trading(&self, timestamp: i64) -> bool {
        timestamp >= self.bounds.open_millis() && timestamp < self.flatten_at
    }

    pub fn past_cutoff(&self, timestamp: i64) -> bool {
        timestamp >= self.flatten_at
    }

    pub fn is_closed(&self, timestamp: i64) -> bool {
        timestamp >= self.bounds.close_millis()
    }
}

/// Local trading date of a Unix-millisecond timestamp.
pub fn trading_date(timestamp: i64, utc_offset_minutes: i32) -> NaiveDate {
    let utc = DateTime::from_timestamp_millis(timestamp).unwrap_or_default();
    match FixedOffset::east_opt(utc_offset_minutes * 60) {
        Some(offset) => utc.with_timezone(&offset).date_naive(),
        None => utc.date_naive(),
    }
}
