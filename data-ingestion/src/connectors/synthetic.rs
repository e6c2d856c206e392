//! Deterministic random-walk bar generator
//!
//! Emits one primary-timeframe bar per symbol per step and, for each
//! aggregate timeframe, the running bar of the open period. Aggregate bars
//! therefore arrive as a stream of same-period updates, the same shape a
//! live exchange feed produces.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MarketBar, Timeframe};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::BarFeed;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticFeedConfig {
    pub symbols: Vec<String>,
    pub primary_timeframe: Timeframe,
    #[serde(default)]
    pub aggregate_timeframes: Vec<Timeframe>,
    pub start_price: f64,
    /// Maximum per-bar move as a fraction of price
    pub volatility: f64,
    pub base_volume: u64,
    /// Probability that a bar carries a 3x volume spike
    #[serde(default = "default_spike_probability")]
    pub spike_probability: f64,
    pub seed: u64,
    /// Stop after this many steps
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Wall-clock delay between steps
    #[serde(default)]
    pub pace_ms: u64,
}

fn default_spike_probability() -> f64 {
    0.05
}

impl Default for SyntheticFeedConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            primary_timeframe: Timeframe::M1,
            aggregate_timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
            start_price: 100.0,
            volatility: 0.004,
            base_volume: 10_000,
            spike_probability: default_spike_probability(),
            seed: 42,
            max_steps: None,
            pace_ms: 0,
        }
    }
}

struct Walk {
    price: f64,
    aggregates: HashMap<Timeframe, MarketBar>,
}

pub struct SyntheticFeed {
    config: SyntheticFeedConfig,
    rng: fastrand::Rng,
    walks: Vec<Walk>,
    step: usize,
    start: DateTime<Utc>,
    queue: VecDeque<MarketBar>,
}

impl SyntheticFeed {
    pub fn new(config: SyntheticFeedConfig, start: DateTime<Utc>) -> Self {
        let walks = config
            .symbols
            .iter()
            .map(|_| Walk {
                price: config.start_price,
                aggregates: HashMap::new(),
            })
            .collect();

        Self {
            rng: fastrand::Rng::with_seed(config.seed),
            start: config.primary_timeframe.period_start(start),
            config,
            walks,
            step: 0,
            queue: VecDeque::new(),
        }
    }

    fn generate_step(&mut self) -> anyhow::Result<()> {
        let ts = self.start + self.config.primary_timeframe.duration() * self.step as i32;

        for (idx, symbol) in self.config.symbols.iter().enumerate() {
            let walk = &mut self.walks[idx];
            let vol = self.config.volatility;

            let open = walk.price;
            let close = open * (1.0 + (self.rng.f64() - 0.5) * 2.0 * vol);
            let high = open.max(close) * (1.0 + self.rng.f64() * vol / 2.0);
            let low = open.min(close) * (1.0 - self.rng.f64() * vol / 2.0);
            walk.price = close;

            let spike = if self.rng.f64() < self.config.spike_probability { 3.0 } else { 1.0 };
            let volume = (self.config.base_volume as f64 * (0.5 + self.rng.f64()) * spike) as u64;

            let open_d = to_price(open)?;
            let close_d = to_price(close)?;
            let bar = MarketBar {
                symbol: symbol.clone(),
                timeframe: self.config.primary_timeframe,
                open: open_d,
                high: to_price(high)?.max(open_d).max(close_d),
                low: to_price(low)?.min(open_d).min(close_d),
                close: close_d,
                volume,
                timestamp: ts,
            };

            for tf in &self.config.aggregate_timeframes {
                let period = tf.period_start(ts);
                let agg = match walk.aggregates.get_mut(tf) {
                    Some(agg) if tf.period_start(agg.timestamp) == period => {
                        agg.high = agg.high.max(bar.high);
                        agg.low = agg.low.min(bar.low);
                        agg.close = bar.close;
                        agg.volume += bar.volume;
                        agg.timestamp = ts;
                        agg.clone()
                    }
                    _ => {
                        let agg = MarketBar {
                            timeframe: *tf,
                            ..bar.clone()
                        };
                        walk.aggregates.insert(*tf, agg.clone());
                        agg
                    }
                };
                self.queue.push_back(agg);
            }

            self.queue.push_back(bar);
        }

        self.step += 1;
        debug!(step = self.step, "Synthetic step generated");
        Ok(())
    }
}

fn to_price(value: f64) -> anyhow::Result<Decimal> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(4))
        .ok_or_else(|| anyhow::anyhow!("price {} not representable", value))
}

#[async_trait]
impl BarFeed for SyntheticFeed {
    async fn next_bar(&mut self) -> anyhow::Result<Option<MarketBar>> {
        if self.queue.is_empty() {
            if self.config.max_steps.is_some_and(|max| self.step >= max) {
                return Ok(None);
            }
            if self.config.pace_ms > 0 && self.step > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.pace_ms)).await;
            }
            self.generate_step()?;
        }

        Ok(self.queue.pop_front())
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
