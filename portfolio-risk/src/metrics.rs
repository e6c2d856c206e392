//! Drawdown tracking and risk summaries

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::RiskMode;

/// Intraday peak-to-current drawdown with a daily reset.
///
/// The peak restarts from the first equity seen on each UTC day; the worst
/// drawdown of the day is kept for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownTracker {
    day: Option<NaiveDate>,
    peak: f64,
    trough: f64,
    current: f64,
    max_intraday: f64,
}

impl Default for DrawdownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawdownTracker {
    pub fn new() -> Self {
        Self {
            day: None,
            peak: 0.0,
            trough: 0.0,
            current: 0.0,
            max_intraday: 0.0,
        }
    }

    /// Record an equity observation and return the current drawdown (0.0 to 1.0)
    pub fn update(&mut self, equity: f64, timestamp: DateTime<Utc>) -> f64 {
        let day = timestamp.date_naive();
        if self.day != Some(day) {
            self.day = Some(day);
            self.peak = equity;
            self.trough = equity;
            self.max_intraday = 0.0;
        }

        self.peak = self.peak.max(equity);
        self.trough = self.trough.min(equity);
        self.current = if self.peak > 0.0 {
            ((self.peak - equity) / self.peak).max(0.0)
        } else {
            0.0
        };
        self.max_intraday = self.max_intraday.max(self.current);
        self.current
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn max_intraday(&self) -> f64 {
        self.max_intraday
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn trough(&self) -> f64 {
        self.trough
    }
}

/// Point-in-time view of the risk state for observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub intraday_peak: f64,
    pub drawdown: f64,
    pub max_intraday_drawdown: f64,
    pub mode: RiskMode,
    pub size_multiplier: f64,
    /// Open risk as a fraction of equity
    pub portfolio_heat: f64,
    pub open_positions: usize,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn total_pnl(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl
    }

    /// Entries are still possible
    pub fn accepting_entries(&self) -> bool {
        self.mode != RiskMode::Halted
    }
}
