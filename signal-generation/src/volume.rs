//! Volume confirmation (stage 3)
//!
//! A signal is only worth acting on when the bar that produced it traded
//! meaningfully more than usual. Relative volume is measured against a
//! rolling window of closed bars; the open bar never counts towards its own
//! baseline.

use std::collections::{HashMap, VecDeque};

use common::{
    decimal_to_f64, BarKind, EngineError, MarketBar, PeriodClock, Signal, SignalDirection,
};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Closed bars in the rolling baseline
    #[serde(default = "default_window")]
    pub window: usize,

    /// Relative volume needed for Buy / Oversold
    #[serde(default = "default_buy_threshold")]
    pub buy_threshold: f64,

    /// Relative volume needed for Sell / Overbought
    #[serde(default = "default_sell_threshold")]
    pub sell_threshold: f64,

    /// Closed bars kept for the volume-at-price profile
    #[serde(default = "default_profile_lookback")]
    pub profile_lookback: usize,

    /// Bucket width as a fraction of the latest close
    #[serde(default = "default_bucket_width_pct")]
    pub bucket_width_pct: f64,

    /// Buckets at or above this volume percentile become levels
    #[serde(default = "default_strength_percentile")]
    pub strength_percentile: usize,
}

fn default_window() -> usize {
    20
}

fn default_buy_threshold() -> f64 {
    1.2
}

fn default_sell_threshold() -> f64 {
    1.5
}

fn default_profile_lookback() -> usize {
    100
}

fn default_bucket_width_pct() -> f64 {
    0.005
}

fn default_strength_percentile() -> usize {
    70
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            buy_threshold: default_buy_threshold(),
            sell_threshold: default_sell_threshold(),
            profile_lookback: default_profile_lookback(),
            bucket_width_pct: default_bucket_width_pct(),
            strength_percentile: default_strength_percentile(),
        }
    }
}

impl VolumeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            anyhow::bail!("volume window must be positive");
        }
        if self.buy_threshold <= 0.0 || self.sell_threshold <= 0.0 {
            anyhow::bail!("volume thresholds must be positive");
        }
        if self.bucket_width_pct <= 0.0 {
            anyhow::bail!("bucket_width_pct must be positive");
        }
        if self.strength_percentile > 100 {
            anyhow::bail!("strength_percentile must be within 0..=100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelKind {
    Support,
    Resistance,
}

/// High-volume price bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLevel {
    /// Bucket midpoint
    pub price: f64,
    pub volume: f64,
    pub kind: LevelKind,
}

/// Rolling volume statistics for one symbol.
///
/// Holds the open bar aside until its period closes, so same-period
/// revisions replace it instead of being counted twice.
#[derive(Debug, Clone)]
pub struct VolumeProfile {
    window: usize,
    volumes: VecDeque<f64>,
    /// Welford mean and sum of squared deviations over `volumes`
    mean: f64,
    m2: f64,
    since_resync: usize,
    lookback: usize,
    closed: VecDeque<(f64, f64)>,
    open: Option<(f64, f64)>,
    clock: PeriodClock,
}

impl VolumeProfile {
    pub fn new(config: &VolumeConfig) -> Self {
        let window = config.window.max(1);
        let lookback = config.profile_lookback.max(1);
        Self {
            window,
            volumes: VecDeque::with_capacity(window + 1),
            mean: 0.0,
            m2: 0.0,
            since_resync: 0,
            lookback,
            closed: VecDeque::with_capacity(lookback + 1),
            open: None,
            clock: PeriodClock::new(),
        }
    }

    /// Record a new or revised bar.
    pub fn record(&mut self, bar: &MarketBar) -> Result<BarKind, EngineError> {
        let kind = self.clock.classify(bar)?;
        if kind == BarKind::Opened {
            if let Some((close, volume)) = self.open.take() {
                self.commit(close, volume);
            }
        }
        self.open = Some((decimal_to_f64(bar.close), bar.volume as f64));
        Ok(kind)
    }

    fn commit(&mut self, close: f64, volume: f64) {
        self.volumes.push_back(volume);
        let n = self.volumes.len() as f64;
        let delta = volume - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (volume - self.mean);

        if self.volumes.len() > self.window {
            if let Some(old) = self.volumes.pop_front() {
                let n = self.volumes.len() as f64;
                let delta = old - self.mean;
                self.mean -= delta / n;
                self.m2 -= delta * (old - self.mean);
            }
        }

        self.since_resync += 1;
        if self.since_resync >= self.window {
            self.resync();
        }

        self.closed.push_back((close, volume));
        if self.closed.len() > self.lookback {
            self.closed.pop_front();
        }
    }

    /// Closed bars in the baseline window
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.volumes.len() >= self.window
    }

    pub fn window(&self) -> usize {
        self.window
    }

    // Recompute from the window; bounds drift of the running updates.
    fn resync(&mut self) {
        let n = self.volumes.len() as f64;
        self.mean = self.volumes.iter().sum::<f64>() / n;
        self.m2 = self.volumes.iter().map(|v| (v - self.mean).powi(2)).sum();
        self.since_resync = 0;
    }

    pub fn mean(&self) -> f64 {
        if self.volumes.is_empty() {
            return f64::NAN;
        }
        self.mean
    }

    /// Population variance of the baseline
    pub fn variance(&self) -> f64 {
        if self.volumes.is_empty() {
            return f64::NAN;
        }
        (self.m2 / self.volumes.len() as f64).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// High-volume buckets over the lookback, strongest first
    pub fn levels(&self, config: &VolumeConfig) -> Vec<VolumeLevel> {
        let Some(&(reference, _)) = self.closed.back() else {
            return Vec::new();
        };
        let width = reference * config.bucket_width_pct;
        if !(width.is_finite() && width > 0.0) {
            return Vec::new();
        }

        let mut buckets: HashMap<i64, f64> = HashMap::new();
        for &(close, volume) in &self.closed {
            if close.is_finite() {
                *buckets.entry((close / width).floor() as i64).or_default() += volume;
            }
        }
        if buckets.is_empty() {
            return Vec::new();
        }

        let mut data = Data::new(buckets.values().copied().collect::<Vec<_>>());
        let cutoff = data.percentile(config.strength_percentile);
        let total = self.closed.len();

        let mut levels: Vec<VolumeLevel> = buckets
            .into_iter()
            .filter(|(_, volume)| *volume >= cutoff && *volume > 0.0)
            .map(|(index, volume)| {
                let price = (index as f64 + 0.5) * width;
                let above = self.closed.iter().filter(|(c, _)| *c > price).count();
                let kind = if above * 2 > total {
                    LevelKind::Support
                } else {
                    LevelKind::Resistance
                };
                VolumeLevel { price, volume, kind }
            })
            .collect();

        levels.sort_by(|a, b| b.volume.total_cmp(&a.volume));
        levels
    }
}

/// Verdict of the volume filter for one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfirmation {
    pub signal_id: Uuid,
    pub symbol: String,
    pub confirmed: bool,
    pub relative_volume: f64,
    /// Standard deviations above the baseline mean
    pub volume_zscore: f64,
    pub threshold: f64,
    pub reason: Option<String>,
    /// Advisory; never gates the signal
    pub levels: Vec<VolumeLevel>,
}

#[derive(Debug, Clone)]
pub struct VolumeFilter {
    config: VolumeConfig,
}

impl VolumeFilter {
    pub fn new(config: VolumeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Effective threshold for a direction; never below 1.0
    pub fn threshold(&self, direction: SignalDirection) -> Option<f64> {
        let raw = match direction {
            SignalDirection::Buy | SignalDirection::Oversold => self.config.buy_threshold,
            SignalDirection::Sell | SignalDirection::Overbought => self.config.sell_threshold,
            SignalDirection::Neutral => return None,
        };
        Some(raw.max(1.0))
    }

    /// Check the bar that produced `signal` against the closed-bar baseline.
    ///
    /// Fails closed with `InsufficientVolumeHistory` until the window is full.
    pub fn confirm(
        &self,
        signal: &Signal,
        bar: &MarketBar,
        profile: &VolumeProfile,
    ) -> Result<VolumeConfirmation, EngineError> {
        if !profile.is_ready() {
            return Err(EngineError::InsufficientVolumeHistory {
                symbol: signal.symbol.clone(),
                have: profile.len(),
                need: profile.window(),
            });
        }

        let mean = profile.mean();
        let volume = bar.volume as f64;
        let relative_volume = if mean > 0.0 { volume / mean } else { f64::NAN };
        let std_dev = profile.std_dev();
        let volume_zscore = if std_dev > 0.0 { (volume - mean) / std_dev } else { 0.0 };

        let (confirmed, threshold, reason) = match self.threshold(signal.direction) {
            None => (false, f64::NAN, Some("neutral signal".to_string())),
            Some(threshold) if !relative_volume.is_finite() => {
                (false, threshold, Some("no baseline volume".to_string()))
            }
            Some(threshold) if relative_volume < threshold => (
                false,
                threshold,
                Some(format!(
                    "relative volume {:.2} below {:.2}",
                    relative_volume, threshold
                )),
            ),
            Some(threshold) => (true, threshold, None),
        };

        debug!(
            symbol = %signal.symbol,
            direction = ?signal.direction,
            relative_volume,
            threshold,
            confirmed,
            "Volume check"
        );

        Ok(VolumeConfirmation {
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            confirmed,
            relative_volume,
            volume_zscore,
            threshold,
            reason,
            levels: profile.levels(&self.config),
        })
    }
}
