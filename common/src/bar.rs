//! Market bars, timeframes and period-boundary detection

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Bar granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Length of one period in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// How long a derived trend for this timeframe stays fresh.
    ///
    /// One sixtieth of the granularity, clamped to [1s, 30min]: 15s for a
    /// 15-minute frame, 24 minutes for a daily frame.
    pub fn cache_ttl(&self) -> std::time::Duration {
        let secs = (self.seconds() / 60).clamp(1, 30 * 60);
        std::time::Duration::from_secs(secs as u64)
    }

    /// Start of the period containing `ts`
    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let start = secs - secs.rem_euclid(self.seconds());
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown timeframe '{}'", s))
    }
}

/// One OHLCV bar for a (symbol, timeframe) stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl MarketBar {
    /// Check the OHLC relationships of the bar
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidBar {
            symbol: self.symbol.clone(),
            reason: reason.to_string(),
        };

        if self.symbol.is_empty() {
            return Err(invalid("empty symbol"));
        }
        if self.low <= Decimal::ZERO {
            return Err(invalid("non-positive price"));
        }
        if self.high < self.low {
            return Err(invalid("high below low"));
        }
        if self.open > self.high || self.open < self.low {
            return Err(invalid("open outside high/low range"));
        }
        if self.close > self.high || self.close < self.low {
            return Err(invalid("close outside high/low range"));
        }

        Ok(())
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.timeframe.period_start(self.timestamp)
    }

    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }
}

/// Whether a bar opened a new period or revised the open one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarKind {
    Opened,
    Updated,
}

/// Tracks the open period of one (symbol, timeframe) stream.
///
/// A bar in a later period opens a new one and implicitly closes the
/// previous period. A bar in the open period is an update. Anything older is
/// rejected and leaves the clock untouched.
#[derive(Debug, Clone, Default)]
pub struct PeriodClock {
    open_period: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl PeriodClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, bar: &MarketBar) -> Result<BarKind, EngineError> {
        let period = bar.period_start();

        let kind = match self.open_period {
            None => BarKind::Opened,
            Some(open) if period > open => BarKind::Opened,
            Some(open) if period == open => BarKind::Updated,
            Some(open) => {
                return Err(EngineError::OutOfOrderBar {
                    symbol: bar.symbol.clone(),
                    timeframe: bar.timeframe,
                    open_period: open,
                    received: bar.timestamp,
                });
            }
        };

        self.open_period = Some(period);
        self.last_timestamp = Some(bar.timestamp);
        Ok(kind)
    }

    pub fn open_period(&self) -> Option<DateTime<Utc>> {
        self.open_period
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }
}
