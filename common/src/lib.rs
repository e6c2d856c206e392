//! Shared types for the signal quality and risk engine.
//!
//! Every crate in the workspace speaks in terms of these types: bars flowing
//! in from the market-data side, signals produced by the indicator engine and
//! the error taxonomy used when a stage declines to produce output.

pub mod bar;
pub mod error;
pub mod signal;

pub use bar::{BarKind, MarketBar, PeriodClock, Timeframe};
pub use error::EngineError;
pub use signal::{IndicatorValues, Signal, SignalDirection, TradeSide};

pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

/// Convert a decimal price into the `f64` domain used by indicator math.
///
/// Values that cannot be represented come back as NaN so the non-finite
/// handling downstream kicks in instead of silently using zero.
pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Convert a ratio or amount computed in `f64` back into a decimal.
///
/// Non-finite inputs have no decimal form and return `None`.
pub fn f64_to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_conversions() {
        assert_eq!(decimal_to_f64(dec!(101.25)), 101.25);
        assert_eq!(f64_to_decimal(0.5), Some(dec!(0.5)));
        assert_eq!(f64_to_decimal(f64::NAN), None);
        assert_eq!(f64_to_decimal(f64::INFINITY), None);
    }
}
