//! Rolling return correlation between symbols

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;

use crate::config::CorrelationConfig;

#[derive(Debug, Clone)]
struct ReturnSeries {
    period: DateTime<Utc>,
    /// Close of the period before `period`
    base: Option<f64>,
    last_close: f64,
    returns: VecDeque<f64>,
    open_return: bool,
}

/// Pearson correlation of per-period returns.
///
/// A close inside the same period as the previous one revises that period's
/// return instead of adding a new observation. Explicit overrides, such as an
/// externally supplied correlation matrix, take precedence over estimates.
#[derive(Debug, Clone)]
pub struct CorrelationTracker {
    lookback: usize,
    min_observations: usize,
    series: HashMap<String, ReturnSeries>,
    overrides: HashMap<(String, String), f64>,
}

impl CorrelationTracker {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            lookback: config.lookback.max(2),
            min_observations: config.min_observations.max(2),
            series: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Record the latest close of `symbol` for the period starting at `period`
    pub fn record_close(&mut self, symbol: &str, period: DateTime<Utc>, close: f64) {
        if !(close.is_finite() && close > 0.0) {
            return;
        }

        let lookback = self.lookback;
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| ReturnSeries {
                period,
                base: None,
                last_close: close,
                returns: VecDeque::with_capacity(lookback + 1),
                open_return: false,
            });

        if period > series.period {
            series.period = period;
            series.base = Some(series.last_close);
            series.open_return = false;
        } else if period < series.period {
            return;
        }
        series.last_close = close;

        let Some(base) = series.base else {
            return;
        };
        let ret = close / base - 1.0;
        if series.open_return {
            if let Some(last) = series.returns.back_mut() {
                *last = ret;
            }
        } else {
            series.returns.push_back(ret);
            series.open_return = true;
            if series.returns.len() > lookback {
                series.returns.pop_front();
            }
        }
    }

    /// Inject a fixed correlation for a pair; symmetric
    pub fn set_override(&mut self, a: &str, b: &str, correlation: f64) {
        self.overrides.insert(pair_key(a, b), correlation.clamp(-1.0, 1.0));
    }

    pub fn clear_override(&mut self, a: &str, b: &str) {
        self.overrides.remove(&pair_key(a, b));
    }

    /// Correlation of two symbols' returns, if enough overlapping history exists
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        if let Some(fixed) = self.overrides.get(&pair_key(a, b)) {
            return Some(*fixed);
        }

        let ra = &self.series.get(a)?.returns;
        let rb = &self.series.get(b)?.returns;
        let n = ra.len().min(rb.len());
        if n < self.min_observations {
            return None;
        }

        let xa: Vec<f64> = ra.iter().skip(ra.len() - n).copied().collect();
        let xb: Vec<f64> = rb.iter().skip(rb.len() - n).copied().collect();

        let covariance = xa.as_slice().population_covariance(xb.as_slice());
        let denominator = xa.as_slice().population_std_dev() * xb.as_slice().population_std_dev();
        if !(denominator.is_finite() && denominator > 0.0) {
            return None;
        }

        Some((covariance / denominator).clamp(-1.0, 1.0))
    }

    pub fn observations(&self, symbol: &str) -> usize {
        self.series.get(symbol).map(|s| s.returns.len()).unwrap_or(0)
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
