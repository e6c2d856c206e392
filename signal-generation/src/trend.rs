//! Higher-timeframe trend sources consulted by the consensus validator

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{decimal_to_f64, BarKind, EngineError, MarketBar, PeriodClock, Timeframe, TradeSide};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::indicators::Ema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl TrendDirection {
    pub fn aligns_with(&self, side: TradeSide) -> bool {
        matches!(
            (self, side),
            (TrendDirection::Up, TradeSide::Long) | (TrendDirection::Down, TradeSide::Short)
        )
    }
}

/// Trend reading for one (symbol, timeframe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: TrendDirection,
    /// Fast/slow EMA separation relative to the slow EMA
    pub strength: f64,
    pub as_of: DateTime<Utc>,
}

/// Per-timeframe trend provider; may be remote and slow
#[async_trait]
pub trait TrendSource: Send + Sync {
    async fn trend(&self, symbol: &str, timeframe: Timeframe) -> anyhow::Result<TrendSnapshot>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarTrendConfig {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,

    #[serde(default = "default_slow_period")]
    pub slow_period: usize,

    /// Separation below which the trend is reported as flat
    #[serde(default = "default_flat_tolerance")]
    pub flat_tolerance: f64,
}

fn default_fast_period() -> usize {
    12
}

fn default_slow_period() -> usize {
    26
}

fn default_flat_tolerance() -> f64 {
    0.0005
}

impl Default for BarTrendConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            flat_tolerance: default_flat_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EmaPair {
    fast: Ema,
    slow: Ema,
    bars: usize,
}

#[derive(Debug, Clone)]
struct TrendState {
    clock: PeriodClock,
    committed: EmaPair,
    tip: EmaPair,
    as_of: DateTime<Utc>,
}

/// Derives trend from the fast/slow EMA of bars fed to it
#[derive(Debug, Clone, Default)]
pub struct BarTrendSource {
    config: BarTrendConfig,
    states: Arc<RwLock<HashMap<(String, Timeframe), TrendState>>>,
}

impl BarTrendSource {
    pub fn new(config: BarTrendConfig) -> Self {
        Self {
            config,
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Feed a new or revised higher-timeframe bar
    pub async fn ingest(&self, bar: &MarketBar) -> Result<BarKind, EngineError> {
        let mut states = self.states.write().await;
        let key = (bar.symbol.clone(), bar.timeframe);
        let fresh = EmaPair {
            fast: Ema::new(self.config.fast_period),
            slow: Ema::new(self.config.slow_period),
            bars: 0,
        };
        let state = states.entry(key).or_insert_with(|| TrendState {
            clock: PeriodClock::new(),
            committed: fresh,
            tip: fresh,
            as_of: bar.timestamp,
        });

        let kind = state.clock.classify(bar)?;
        if kind == BarKind::Opened && state.tip.bars > 0 {
            state.committed = state.tip;
        }

        let close = decimal_to_f64(bar.close);
        let mut next = state.committed;
        next.fast.update(close);
        next.slow.update(close);
        next.bars += 1;
        state.tip = next;
        state.as_of = bar.timestamp;

        debug!(symbol = %bar.symbol, timeframe = %bar.timeframe, ?kind, "Trend bar");
        Ok(kind)
    }

    fn snapshot(&self, symbol: &str, timeframe: Timeframe, state: &TrendState) -> anyhow::Result<TrendSnapshot> {
        if state.tip.bars < self.config.slow_period {
            anyhow::bail!(
                "trend for {} {} not ready: {} of {} bars",
                symbol,
                timeframe,
                state.tip.bars,
                self.config.slow_period
            );
        }

        let fast = state.tip.fast.value();
        let slow = state.tip.slow.value();
        let strength = if slow != 0.0 { (fast - slow) / slow } else { 0.0 };
        let direction = if strength > self.config.flat_tolerance {
            TrendDirection::Up
        } else if strength < -self.config.flat_tolerance {
            TrendDirection::Down
        } else {
            TrendDirection::Flat
        };

        Ok(TrendSnapshot {
            symbol: symbol.to_string(),
            timeframe,
            direction,
            strength: strength.abs(),
            as_of: state.as_of,
        })
    }
}

#[async_trait]
impl TrendSource for BarTrendSource {
    async fn trend(&self, symbol: &str, timeframe: Timeframe) -> anyhow::Result<TrendSnapshot> {
        let states = self.states.read().await;
        let state = states
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| anyhow::anyhow!("no bars for {} {}", symbol, timeframe))?;
        self.snapshot(symbol, timeframe, state)
    }
}

/// Fixed trend readings, optionally delayed per timeframe
#[derive(Debug, Clone, Default)]
pub struct StaticTrendSource {
    trends: HashMap<(String, Timeframe), TrendDirection>,
    delays: HashMap<Timeframe, Duration>,
}

impl StaticTrendSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trend(mut self, symbol: &str, timeframe: Timeframe, direction: TrendDirection) -> Self {
        self.trends.insert((symbol.to_string(), timeframe), direction);
        self
    }

    pub fn with_delay(mut self, timeframe: Timeframe, delay: Duration) -> Self {
        self.delays.insert(timeframe, delay);
        self
    }
}

#[async_trait]
impl TrendSource for StaticTrendSource {
    async fn trend(&self, symbol: &str, timeframe: Timeframe) -> anyhow::Result<TrendSnapshot> {
        if let Some(delay) = self.delays.get(&timeframe) {
            tokio::time::sleep(*delay).await;
        }

        let direction = self
            .trends
            .get(&(symbol.to_string(), timeframe))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no trend for {} {}", symbol, timeframe))?;

        Ok(TrendSnapshot {
            symbol: symbol.to_string(),
            timeframe,
            direction,
            strength: 1.0,
            as_of: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn hourly(symbol: &str, index: i64, close: i64) -> MarketBar {
        let close = Decimal::from(close);
        MarketBar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::H1,
            open: close,
            high: close + Decimal::ONE,
            low: close - Decimal::ONE,
            close,
            volume: 500,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(index),
        }
    }

    #[tokio::test]
    async fn test_rising_bars_trend_up() {
        let source = BarTrendSource::new(BarTrendConfig::default());
        for i in 0..40 {
            source.ingest(&hourly("ETH", i, 100 + i)).await.unwrap();
        }

        let snapshot = source.trend("ETH", Timeframe::H1).await.unwrap();
        assert_eq!(snapshot.direction, TrendDirection::Up);
        assert!(snapshot.direction.aligns_with(TradeSide::Long));
        assert!(!snapshot.direction.aligns_with(TradeSide::Short));
    }

    #[tokio::test]
    async fn test_not_ready_before_slow_period() {
        let source = BarTrendSource::new(BarTrendConfig::default());
        for i in 0..10 {
            source.ingest(&hourly("ETH", i, 100 - i)).await.unwrap();
        }
        assert!(source.trend("ETH", Timeframe::H1).await.is_err());
        assert!(source.trend("BTC", Timeframe::H1).await.is_err());
    }

    #[tokio::test]
    async fn test_revision_does_not_double_count() {
        let source = BarTrendSource::new(BarTrendConfig::default());
        for i in 0..30 {
            source.ingest(&hourly("SOL", i, 200 - i)).await.unwrap();
        }

        // a large provisional print that is then revised back down
        let mut spike = hourly("SOL", 29, 400);
        spike.timestamp += chrono::Duration::minutes(10);
        assert_eq!(source.ingest(&spike).await.unwrap(), BarKind::Updated);
        let mut settle = hourly("SOL", 29, 171);
        settle.timestamp += chrono::Duration::minutes(20);
        source.ingest(&settle).await.unwrap();

        let snapshot = source.trend("SOL", Timeframe::H1).await.unwrap();
        assert_eq!(snapshot.direction, TrendDirection::Down);
    }

    #[tokio::test]
    async fn test_static_source_reports_configured_trend() {
        let source = StaticTrendSource::new().with_trend("BTC", Timeframe::H4, TrendDirection::Down);
        let snapshot = source.trend("BTC", Timeframe::H4).await.unwrap();
        assert_eq!(snapshot.direction, TrendDirection::Down);
        assert!(source.trend("BTC", Timeframe::D1).await.is_err());
    }
}
