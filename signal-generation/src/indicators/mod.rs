//! Indicator engine (stage 2)
//!
//! Keeps one `IndicatorState` per symbol and updates it in O(1) per bar:
//! Wilder RSI, Wilder ATR with a rolling ATR average, stochastic RSI and a
//! fast/slow EMA pair. Each snapshot carries the volatility-adaptive bands
//! and the raw signal classified against them.
//!
//! Same-period revisions are handled by keeping the accumulators as of the
//! last closed period (`committed`) next to the ones including the open
//! period (`tip`). A revision recomputes the tip from the committed copy and
//! overwrites the newest window entries instead of appending.

mod atr;
pub mod bands;
mod rsi;
mod window;

pub use atr::{Ema, WilderAtr};
pub use bands::{dynamic_bands, BandConfig};
pub use rsi::WilderRsi;
pub use window::RollingWindow;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    decimal_to_f64, BarKind, EngineError, IndicatorValues, MarketBar, PeriodClock, Signal,
    Timeframe,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::signals;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    /// RSI values in the stochastic min/max window
    #[serde(default = "default_stoch_period")]
    pub stoch_period: usize,

    /// SMA length of %K that forms %D
    #[serde(default = "default_stoch_d_period")]
    pub stoch_d_period: usize,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// ATR values averaged for the volatility ratio
    #[serde(default = "default_atr_average_period")]
    pub atr_average_period: usize,

    #[serde(default = "default_ema_fast_period")]
    pub ema_fast_period: usize,

    #[serde(default = "default_ema_slow_period")]
    pub ema_slow_period: usize,

    /// Bars before snapshots are produced; defaults to rsi + stoch period
    #[serde(default)]
    pub warmup_bars: Option<usize>,

    #[serde(default)]
    pub bands: BandConfig,
}

fn default_rsi_period() -> usize {
    14
}

fn default_stoch_period() -> usize {
    14
}

fn default_stoch_d_period() -> usize {
    3
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_average_period() -> usize {
    20
}

fn default_ema_fast_period() -> usize {
    12
}

fn default_ema_slow_period() -> usize {
    26
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            stoch_period: default_stoch_period(),
            stoch_d_period: default_stoch_d_period(),
            atr_period: default_atr_period(),
            atr_average_period: default_atr_average_period(),
            ema_fast_period: default_ema_fast_period(),
            ema_slow_period: default_ema_slow_period(),
            warmup_bars: None,
            bands: BandConfig::default(),
        }
    }
}

impl IndicatorConfig {
    pub fn warmup(&self) -> usize {
        self.warmup_bars
            .unwrap_or(self.rsi_period + self.stoch_period)
            .max(self.rsi_period + self.stoch_period)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("rsi_period", self.rsi_period),
            ("stoch_period", self.stoch_period),
            ("stoch_d_period", self.stoch_d_period),
            ("atr_period", self.atr_period),
            ("atr_average_period", self.atr_average_period),
            ("ema_fast_period", self.ema_fast_period),
            ("ema_slow_period", self.ema_slow_period),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, p)| *p == 0) {
            anyhow::bail!("{} must be positive", name);
        }
        if self.ema_fast_period >= self.ema_slow_period {
            anyhow::bail!("ema_fast_period must be shorter than ema_slow_period");
        }
        self.bands.validate()
    }
}

/// Scalar accumulators; cheap to copy between committed and tip.
#[derive(Debug, Clone, Copy)]
struct Accumulators {
    rsi: WilderRsi,
    atr: WilderAtr,
    ema_fast: Ema,
    ema_slow: Ema,
    bars: usize,
    /// %K/%D at this bar, once warm
    kd: Option<(f64, f64)>,
}

impl Accumulators {
    fn new(config: &IndicatorConfig) -> Self {
        Self {
            rsi: WilderRsi::new(config.rsi_period),
            atr: WilderAtr::new(config.atr_period),
            ema_fast: Ema::new(config.ema_fast_period),
            ema_slow: Ema::new(config.ema_slow_period),
            bars: 0,
            kd: None,
        }
    }
}

/// Rolling indicator state for one symbol.
///
/// Created on the first bar and only ever mutated through
/// `IndicatorEngine::update`.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    symbol: String,
    timeframe: Timeframe,
    clock: PeriodClock,
    committed: Accumulators,
    tip: Option<Accumulators>,
    rsi_window: RollingWindow,
    k_window: RollingWindow,
    atr_window: RollingWindow,
    stoch_k: f64,
    stoch_d: f64,
    dynamic_lower_band: f64,
    dynamic_upper_band: f64,
    volatility_ratio: f64,
}

impl IndicatorState {
    fn new(symbol: &str, timeframe: Timeframe, config: &IndicatorConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            clock: PeriodClock::new(),
            committed: Accumulators::new(config),
            tip: None,
            rsi_window: RollingWindow::new(config.stoch_period),
            k_window: RollingWindow::new(config.stoch_d_period),
            atr_window: RollingWindow::new(config.atr_average_period),
            stoch_k: f64::NAN,
            stoch_d: f64::NAN,
            dynamic_lower_band: config.bands.base_lower,
            dynamic_upper_band: config.bands.base_upper,
            volatility_ratio: f64::NAN,
        }
    }

    fn apply(
        &mut self,
        bar: &MarketBar,
        config: &IndicatorConfig,
    ) -> Result<Option<IndicatorSnapshot>, EngineError> {
        if bar.timeframe != self.timeframe {
            return Err(EngineError::InvalidBar {
                symbol: bar.symbol.clone(),
                reason: format!("timeframe {} does not match stream {}", bar.timeframe, self.timeframe),
            });
        }

        let kind = self.clock.classify(bar)?;
        if kind == BarKind::Opened {
            if let Some(tip) = self.tip {
                self.committed = tip;
            }
        }
        let revising = kind == BarKind::Updated && self.tip.is_some();

        let high = decimal_to_f64(bar.high);
        let low = decimal_to_f64(bar.low);
        let close = decimal_to_f64(bar.close);

        let mut next = self.committed;
        next.bars += 1;
        let rsi = next.rsi.update(close);
        let atr = next.atr.update(high, low, close);
        next.ema_fast.update(close);
        next.ema_slow.update(close);

        if let Some(rsi) = rsi {
            record(&mut self.rsi_window, rsi, revising);
        }
        record(&mut self.atr_window, atr, revising);

        let atr_average = self.atr_window.mean();
        self.volatility_ratio = atr / atr_average;
        let (lower, upper) = dynamic_bands(&config.bands, self.volatility_ratio);
        self.dynamic_lower_band = lower;
        self.dynamic_upper_band = upper;

        let warm = next.bars >= config.warmup() && self.rsi_window.is_full() && rsi.is_some();
        if !warm {
            self.tip = Some(next);
            debug!(symbol = %self.symbol, bars = next.bars, need = config.warmup(), "Indicator warm-up");
            return Ok(None);
        }

        let rsi = rsi.unwrap_or(f64::NAN);
        let (min, max) = (self.rsi_window.min(), self.rsi_window.max());
        self.stoch_k = if max > min { (rsi - min) / (max - min) * 100.0 } else { f64::NAN };
        record(&mut self.k_window, self.stoch_k, revising);
        self.stoch_d = self.k_window.mean();
        next.kd = Some((self.stoch_k, self.stoch_d));

        let values = IndicatorValues {
            rsi,
            stoch_k: self.stoch_k,
            stoch_d: self.stoch_d,
            atr,
            volatility_ratio: self.volatility_ratio,
            dynamic_lower_band: lower,
            dynamic_upper_band: upper,
            ema_fast: next.ema_fast.value(),
            ema_slow: next.ema_slow.value(),
        };

        // compare against the last closed bar, never against a prior revision
        let previous_kd = self.committed.kd;
        let (direction, strength) = signals::classify(&values, previous_kd);
        if let Some(field) = signals::first_non_finite(&values) {
            let err = EngineError::NonFiniteIndicatorInput {
                symbol: self.symbol.clone(),
                field,
            };
            debug!(error = %err, "Downgrading to neutral signal");
        }

        self.tip = Some(next);

        let signal = Signal::new(
            self.symbol.clone(),
            self.timeframe,
            direction,
            strength,
            bar.close,
            values,
            bar.timestamp,
        );

        Ok(Some(IndicatorSnapshot {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            timestamp: bar.timestamp,
            close: bar.close,
            kind,
            values,
            atr_average,
            bars_seen: next.bars,
            signal,
        }))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Bars seen, counting the open period once
    pub fn bars_seen(&self) -> usize {
        self.tip.map(|t| t.bars).unwrap_or(0)
    }

    pub fn rsi(&self) -> f64 {
        self.tip.map(|t| t.rsi.value()).unwrap_or(f64::NAN)
    }

    pub fn atr(&self) -> f64 {
        self.tip.map(|t| t.atr.value()).unwrap_or(f64::NAN)
    }

    pub fn ema_fast(&self) -> f64 {
        self.tip.map(|t| t.ema_fast.value()).unwrap_or(f64::NAN)
    }

    pub fn ema_slow(&self) -> f64 {
        self.tip.map(|t| t.ema_slow.value()).unwrap_or(f64::NAN)
    }

    pub fn stoch_k(&self) -> f64 {
        self.stoch_k
    }

    pub fn stoch_d(&self) -> f64 {
        self.stoch_d
    }

    pub fn dynamic_lower_band(&self) -> f64 {
        self.dynamic_lower_band
    }

    pub fn dynamic_upper_band(&self) -> f64 {
        self.dynamic_upper_band
    }

    pub fn volatility_ratio(&self) -> f64 {
        self.volatility_ratio
    }

    pub fn open_period(&self) -> Option<DateTime<Utc>> {
        self.clock.open_period()
    }
}

fn record(window: &mut RollingWindow, value: f64, revising: bool) {
    if revising {
        window.replace_last(value);
    } else {
        window.push(value);
    }
}

/// Indicator readings after one bar, with the signal they imply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub close: Decimal,
    pub kind: BarKind,
    pub values: IndicatorValues,
    pub atr_average: f64,
    pub bars_seen: usize,
    pub signal: Signal,
}

/// Per-symbol indicator states behind one `update` entry point
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    states: HashMap<String, IndicatorState>,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Feed one new or revised bar.
    ///
    /// `Ok(None)` while the symbol is warming up. Bars older than the open
    /// period fail with `OutOfOrderBar` and leave the state untouched.
    pub fn update(&mut self, bar: &MarketBar) -> Result<Option<IndicatorSnapshot>, EngineError> {
        let config = &self.config;
        let state = self
            .states
            .entry(bar.symbol.clone())
            .or_insert_with(|| IndicatorState::new(&bar.symbol, bar.timeframe, config));

        state.apply(bar, config).map_err(|e| {
            warn!(symbol = %bar.symbol, error = %e, "Indicator update rejected");
            e
        })
    }

    /// Warm-up progress as an error, for callers that want a reason
    pub fn warmup_status(&self, symbol: &str) -> Result<(), EngineError> {
        let have = self.states.get(symbol).map(|s| s.bars_seen()).unwrap_or(0);
        let need = self.config.warmup();
        if have < need {
            return Err(EngineError::InsufficientWarmup {
                symbol: symbol.to_string(),
                have,
                need,
            });
        }
        Ok(())
    }

    pub fn state(&self, symbol: &str) -> Option<&IndicatorState> {
        self.states.get(symbol)
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }
}
