//! Multi-timeframe consensus (stage 4)
//!
//! Each configured timeframe is asked for its trend concurrently, each with
//! its own timeout. Timeframes that time out or fail drop out of the
//! denominator. Fresh readings are cached per (symbol, timeframe) for a TTL
//! proportional to the timeframe's granularity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{EngineError, Signal, SignalDirection, Timeframe};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::trend::{TrendDirection, TrendSnapshot, TrendSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// Reporting weights; unlisted timeframes weigh 1.0
    #[serde(default)]
    pub weights: HashMap<Timeframe, f64>,

    #[serde(default = "default_timeframe_timeout_ms")]
    pub timeframe_timeout_ms: u64,

    /// Overruns are logged, never enforced
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,

    #[serde(default = "default_min_aligned")]
    pub min_aligned: usize,
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M15, Timeframe::H1, Timeframe::H4]
}

fn default_timeframe_timeout_ms() -> u64 {
    80
}

fn default_latency_budget_ms() -> u64 {
    150
}

fn default_min_aligned() -> usize {
    2
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            weights: HashMap::new(),
            timeframe_timeout_ms: default_timeframe_timeout_ms(),
            latency_budget_ms: default_latency_budget_ms(),
            min_aligned: default_min_aligned(),
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeframes.is_empty() {
            anyhow::bail!("at least one consensus timeframe is required");
        }
        if self.timeframe_timeout_ms == 0 {
            anyhow::bail!("timeframe_timeout_ms must be positive");
        }
        if self.min_aligned < 2 {
            anyhow::bail!("min_aligned must be at least 2");
        }
        if self.weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("timeframe weights must be non-negative");
        }
        Ok(())
    }

    pub fn weight(&self, timeframe: Timeframe) -> f64 {
        self.weights.get(&timeframe).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeframeStatus {
    Aligned,
    Opposed,
    Flat,
    TimedOut,
    Failed(String),
}

impl TimeframeStatus {
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            TimeframeStatus::Aligned | TimeframeStatus::Opposed | TimeframeStatus::Flat
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeVerdict {
    pub timeframe: Timeframe,
    pub status: TimeframeStatus,
    pub trend: Option<TrendSnapshot>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: SignalDirection,
    pub verdicts: Vec<TimeframeVerdict>,
    pub valid_count: usize,
    pub aligned_count: usize,
    pub consensus_achieved: bool,
    /// aligned / valid
    pub agreement_ratio: f64,
    /// Weighted share of aligned timeframes among valid ones
    pub weighted_agreement: f64,
    pub elapsed: Duration,
    pub failure: Option<EngineError>,
}

#[derive(Debug, Clone)]
struct CachedTrend {
    snapshot: TrendSnapshot,
    fetched_at: Instant,
}

/// Fans trend lookups out over timeframes and tallies agreement
#[derive(Clone)]
pub struct ConsensusValidator {
    config: ConsensusConfig,
    source: Arc<dyn TrendSource>,
    cache: Arc<DashMap<(String, Timeframe), CachedTrend>>,
}

impl ConsensusValidator {
    pub fn new(config: ConsensusConfig, source: Arc<dyn TrendSource>) -> Self {
        Self {
            config,
            source,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Validate against the configured timeframes
    pub async fn validate_signal(&self, signal: &Signal) -> ConsensusResult {
        let timeframes = self.config.timeframes.clone();
        self.validate(&signal.symbol, signal, &timeframes).await
    }

    pub async fn validate(&self, symbol: &str, signal: &Signal, timeframes: &[Timeframe]) -> ConsensusResult {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.timeframe_timeout_ms);

        let mut snapshots: Vec<(Timeframe, Result<TrendSnapshot, TimeframeStatus>, bool)> = Vec::new();
        let mut tasks = JoinSet::new();

        for &timeframe in timeframes {
            if let Some(snapshot) = self.cached(symbol, timeframe) {
                snapshots.push((timeframe, Ok(snapshot), true));
                continue;
            }

            let source = Arc::clone(&self.source);
            let symbol = symbol.to_string();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, source.trend(&symbol, timeframe)).await {
                    Ok(Ok(snapshot)) => Ok(snapshot),
                    Ok(Err(e)) => Err(TimeframeStatus::Failed(e.to_string())),
                    Err(_) => Err(TimeframeStatus::TimedOut),
                };
                (timeframe, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((timeframe, outcome)) => {
                    if let Ok(snapshot) = &outcome {
                        self.cache.insert(
                            (symbol.to_string(), timeframe),
                            CachedTrend {
                                snapshot: snapshot.clone(),
                                fetched_at: Instant::now(),
                            },
                        );
                    }
                    snapshots.push((timeframe, outcome, false));
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Trend task failed"),
            }
        }

        // keep the caller's timeframe order
        snapshots.sort_by_key(|(tf, _, _)| timeframes.iter().position(|t| t == tf));

        let side = signal.direction.bias();
        let verdicts: Vec<TimeframeVerdict> = snapshots
            .into_iter()
            .map(|(timeframe, outcome, cached)| match outcome {
                Ok(snapshot) => {
                    let status = match (snapshot.direction, side) {
                        (TrendDirection::Flat, _) | (_, None) => TimeframeStatus::Flat,
                        (direction, Some(side)) if direction.aligns_with(side) => TimeframeStatus::Aligned,
                        _ => TimeframeStatus::Opposed,
                    };
                    TimeframeVerdict {
                        timeframe,
                        status,
                        trend: Some(snapshot),
                        cached,
                    }
                }
                Err(status) => {
                    warn!(symbol = %symbol, timeframe = %timeframe, ?status, "Timeframe excluded from consensus");
                    TimeframeVerdict {
                        timeframe,
                        status,
                        trend: None,
                        cached,
                    }
                }
            })
            .collect();

        let result = self.tally(symbol, signal, verdicts, started.elapsed());

        if result.elapsed > Duration::from_millis(self.config.latency_budget_ms) {
            warn!(
                symbol = %symbol,
                elapsed_ms = result.elapsed.as_millis() as u64,
                budget_ms = self.config.latency_budget_ms,
                "Consensus over latency budget"
            );
        }

        result
    }

    fn tally(
        &self,
        symbol: &str,
        signal: &Signal,
        verdicts: Vec<TimeframeVerdict>,
        elapsed: Duration,
    ) -> ConsensusResult {
        let valid: Vec<&TimeframeVerdict> = verdicts.iter().filter(|v| v.status.is_valid()).collect();
        let valid_count = valid.len();
        let aligned_count = valid
            .iter()
            .filter(|v| v.status == TimeframeStatus::Aligned)
            .count();

        let agreement_ratio = if valid_count > 0 {
            aligned_count as f64 / valid_count as f64
        } else {
            0.0
        };
        let weighted_agreement = weighted_agreement(&self.config, &valid);

        let required = self.config.min_aligned;
        let (consensus_achieved, failure) = if valid_count < required {
            (
                false,
                Some(EngineError::InsufficientTimeframes {
                    symbol: symbol.to_string(),
                    valid: valid_count,
                    required,
                }),
            )
        } else {
            let majority = valid_count.div_ceil(2);
            (aligned_count >= required && aligned_count >= majority, None)
        };

        debug!(
            symbol = %symbol,
            valid = valid_count,
            aligned = aligned_count,
            consensus_achieved,
            "Consensus tally"
        );

        ConsensusResult {
            signal_id: signal.id,
            symbol: symbol.to_string(),
            direction: signal.direction,
            verdicts,
            valid_count,
            aligned_count,
            consensus_achieved,
            agreement_ratio,
            weighted_agreement,
            elapsed,
            failure,
        }
    }

    fn cached(&self, symbol: &str, timeframe: Timeframe) -> Option<TrendSnapshot> {
        let key = (symbol.to_string(), timeframe);
        let fresh = self
            .cache
            .get(&key)
            .filter(|entry| entry.fetched_at.elapsed() < timeframe.cache_ttl())
            .map(|entry| entry.snapshot.clone());
        if fresh.is_none() {
            self.cache.remove(&key);
        }
        fresh
    }

    pub fn invalidate(&self, symbol: &str) {
        self.cache.retain(|(s, _), _| s != symbol);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn weighted_agreement(config: &ConsensusConfig, valid: &[&TimeframeVerdict]) -> f64 {
    let total: f64 = valid.iter().map(|v| config.weight(v.timeframe)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let aligned: f64 = valid
        .iter()
        .filter(|v| v.status == TimeframeStatus::Aligned)
        .map(|v| config.weight(v.timeframe))
        .sum();
    aligned / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trend::StaticTrendSource;
    use chrono::Utc;
    use common::IndicatorValues;
    use rust_decimal_macros::dec;

    fn buy_signal(symbol: &str) -> Signal {
        let values = IndicatorValues {
            rsi: 28.0,
            stoch_k: 12.0,
            stoch_d: 8.0,
            atr: 1.5,
            volatility_ratio: 1.0,
            dynamic_lower_band: 35.0,
            dynamic_upper_band: 65.0,
            ema_fast: 99.0,
            ema_slow: 100.0,
        };
        Signal::new(symbol, Timeframe::M5, SignalDirection::Buy, 0.6, dec!(100), values, Utc::now())
    }

    fn validator(source: StaticTrendSource) -> ConsensusValidator {
        ConsensusValidator::new(ConsensusConfig::default(), Arc::new(source))
    }

    #[tokio::test]
    async fn test_consensus_with_two_of_three_aligned() {
        let source = StaticTrendSource::new()
            .with_trend("BTC", Timeframe::M15, TrendDirection::Up)
            .with_trend("BTC", Timeframe::H1, TrendDirection::Up)
            .with_trend("BTC", Timeframe::H4, TrendDirection::Down);

        let result = validator(source).validate_signal(&buy_signal("BTC")).await;
        assert_eq!(result.valid_count, 3);
        assert_eq!(result.aligned_count, 2);
        assert!(result.consensus_achieved);
        assert!(result.failure.is_none());
        assert_eq!(result.verdicts[2].status, TimeframeStatus::Opposed);
    }

    #[tokio::test]
    async fn test_single_valid_timeframe_never_achieves_consensus() {
        let source = StaticTrendSource::new().with_trend("BTC", Timeframe::H1, TrendDirection::Up);

        let result = validator(source).validate_signal(&buy_signal("BTC")).await;
        assert_eq!(result.valid_count, 1);
        assert!(!result.consensus_achieved);
        assert!(matches!(
            result.failure,
            Some(EngineError::InsufficientTimeframes { valid: 1, required: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_timed_out_timeframe_leaves_denominator() {
        let source = StaticTrendSource::new()
            .with_trend("ETH", Timeframe::M15, TrendDirection::Up)
            .with_trend("ETH", Timeframe::H1, TrendDirection::Up)
            .with_trend("ETH", Timeframe::H4, TrendDirection::Down)
            .with_delay(Timeframe::H4, Duration::from_millis(500));

        let validator = validator(source);
        let result = validator.validate_signal(&buy_signal("ETH")).await;

        assert_eq!(result.verdicts[2].status, TimeframeStatus::TimedOut);
        assert_eq!(result.valid_count, 2);
        assert!(result.consensus_achieved);
        assert!(result.elapsed < Duration::from_millis(400));
        assert!((result.agreement_ratio - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_flat_trends_count_as_valid_but_not_aligned() {
        let source = StaticTrendSource::new()
            .with_trend("SOL", Timeframe::M15, TrendDirection::Up)
            .with_trend("SOL", Timeframe::H1, TrendDirection::Flat)
            .with_trend("SOL", Timeframe::H4, TrendDirection::Flat);

        let result = validator(source).validate_signal(&buy_signal("SOL")).await;
        assert_eq!(result.valid_count, 3);
        assert_eq!(result.aligned_count, 1);
        assert!(!result.consensus_achieved);
    }

    #[tokio::test]
    async fn test_weighted_agreement() {
        let source = StaticTrendSource::new()
            .with_trend("ADA", Timeframe::M15, TrendDirection::Down)
            .with_trend("ADA", Timeframe::H1, TrendDirection::Up)
            .with_trend("ADA", Timeframe::H4, TrendDirection::Up);
        let mut config = ConsensusConfig::default();
        config.weights.insert(Timeframe::H4, 2.0);

        let result = ConsensusValidator::new(config, Arc::new(source))
            .validate_signal(&buy_signal("ADA"))
            .await;
        assert!((result.weighted_agreement - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_readings_are_cached() {
        let source = StaticTrendSource::new()
            .with_trend("DOT", Timeframe::M15, TrendDirection::Up)
            .with_trend("DOT", Timeframe::H1, TrendDirection::Up)
            .with_trend("DOT", Timeframe::H4, TrendDirection::Up);
        let validator = validator(source);

        let first = validator.validate_signal(&buy_signal("DOT")).await;
        assert!(first.verdicts.iter().all(|v| !v.cached));
        assert_eq!(validator.cache_len(), 3);

        let second = validator.validate_signal(&buy_signal("DOT")).await;
        assert!(second.verdicts.iter().all(|v| v.cached));
        assert!(second.consensus_achieved);

        validator.invalidate("DOT");
        assert_eq!(validator.cache_len(), 0);
    }
}
