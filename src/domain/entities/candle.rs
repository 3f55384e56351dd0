use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{ConfigError, ValidationError};
use crate::domain::value_objects::price::Price;

/// Fixed candle widths accepted by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneMinute,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::OneHour,
        Timeframe::FourHours,
        Timeframe::OneDay,
    ];

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 60,
            Timeframe::FiveMinutes => 300,
            Timeframe::FifteenMinutes => 900,
            Timeframe::OneHour => 3_600,
            Timeframe::FourHours => 14_400,
            Timeframe::OneDay => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Start of the bucket containing `timestamp`, floored to the timeframe width.
    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.seconds();
        let floored = timestamp.timestamp().div_euclid(width) * width;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(timestamp)
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| ConfigError::UnsupportedTimeframe(s.to_string()))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trade print from the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: f64, volume: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp,
        }
    }

    /// Price must be finite and non-negative, volume finite and non-negative.
    pub fn validate(&self) -> Result<(), ValidationError> {
        Price::new(self.price)?;
        if !self.volume.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if self.volume < 0.0 {
            return Err(ValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bucket start.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Builds a candle from stored or replayed OHLCV values, checking bar bounds.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, ValidationError> {
        for value in [open, high, low, close] {
            Price::new(value)?;
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(ValidationError::NegativeVolume(volume));
        }
        if high < open.max(close) || low > open.min(close) || low > high {
            return Err(ValidationError::InvalidCandle(format!(
                "o={} h={} l={} c={}",
                open, high, low, close
            )));
        }
        Ok(Self {
            symbol: symbol.into(),
            timeframe,
            timestamp: timeframe.bucket_start(timestamp),
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Opens a fresh bar from the first tick of a bucket.
    pub(crate) fn open_with(
        symbol: &str,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        price: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    pub(crate) fn apply(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}
