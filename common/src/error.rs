//! Error taxonomy shared by all pipeline stages.
//!
//! None of these are fatal. Each one degrades the affected symbol to
//! "no signal" or "no trade" for the current bar.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::bar::Timeframe;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("out-of-order bar for {symbol} {timeframe}: {received} is before open period {open_period}")]
    OutOfOrderBar {
        symbol: String,
        timeframe: Timeframe,
        open_period: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("insufficient warm-up for {symbol}: {have} of {need} bars")]
    InsufficientWarmup {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("insufficient volume history for {symbol}: {have} of {need} bars")]
    InsufficientVolumeHistory {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("insufficient timeframes for {symbol}: {valid} valid, {required} required")]
    InsufficientTimeframes {
        symbol: String,
        valid: usize,
        required: usize,
    },

    #[error("entries halted: intraday drawdown {:.2}% at or above {:.2}%", .drawdown * 100.0, .limit * 100.0)]
    DrawdownHalt { drawdown: f64, limit: f64 },

    #[error("non-finite indicator input for {symbol}: {field}")]
    NonFiniteIndicatorInput { symbol: String, field: &'static str },

    #[error("invalid bar for {symbol}: {reason}")]
    InvalidBar { symbol: String, reason: String },
}

impl EngineError {
    /// Symbol the error is scoped to, if any.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            EngineError::OutOfOrderBar { symbol, .. }
            | EngineError::InsufficientWarmup { symbol, .. }
            | EngineError::InsufficientVolumeHistory { symbol, .. }
            | EngineError::InsufficientTimeframes { symbol, .. }
            | EngineError::NonFiniteIndicatorInput { symbol, .. }
            | EngineError::InvalidBar { symbol, .. } => Some(symbol),
            EngineError::DrawdownHalt { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drawdown_halt_display() {
        let err = EngineError::DrawdownHalt {
            drawdown: 0.1523,
            limit: 0.15,
        };
        assert_eq!(
            err.to_string(),
            "entries halted: intraday drawdown 15.23% at or above 15.00%"
        );
        assert!(err.symbol().is_none());
    }

    #[test]
    fn test_symbol_scope() {
        let err = EngineError::InsufficientVolumeHistory {
            symbol: "BTCUSDT".to_string(),
            have: 3,
            need: 20,
        };
        assert_eq!(err.symbol(), Some("BTCUSDT"));
    }
}
