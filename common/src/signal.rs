use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bar::Timeframe;

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    /// %K crossed above %D inside the oversold zone
    Buy,
    /// %K crossed below %D inside the overbought zone
    Sell,
    /// %K below the lower band without a cross
    Oversold,
    /// %K above the upper band without a cross
    Overbought,
    Neutral,
}

impl SignalDirection {
    /// Side a position opened on this signal would take
    pub fn bias(&self) -> Option<TradeSide> {
        match self {
            SignalDirection::Buy | SignalDirection::Oversold => Some(TradeSide::Long),
            SignalDirection::Sell | SignalDirection::Overbought => Some(TradeSide::Short),
            SignalDirection::Neutral => None,
        }
    }

    /// Only crosses open positions; zone readings are advisory
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalDirection::Buy | SignalDirection::Sell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

/// Indicator readings a signal was derived from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValues {
    pub rsi: f64,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub atr: f64,
    pub volatility_ratio: f64,
    pub dynamic_lower_band: f64,
    pub dynamic_upper_band: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
}

/// Raw indicator signal. Immutable once created; later stages attach their
/// verdicts in separate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: SignalDirection,
    /// 0.0 to 1.0
    pub strength: f64,
    pub price: Decimal,
    pub indicators: IndicatorValues,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        direction: SignalDirection,
        strength: f64,
        price: Decimal,
        indicators: IndicatorValues,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let strength = if direction == SignalDirection::Neutral || !strength.is_finite() {
            0.0
        } else {
            strength.clamp(0.0, 1.0)
        };

        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            timeframe,
            direction,
            strength,
            price,
            indicators,
            timestamp,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.direction.is_entry() && self.strength > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn values() -> IndicatorValues {
        IndicatorValues {
            rsi: 30.0,
            stoch_k: 10.0,
            stoch_d: 8.0,
            atr: 1.2,
            volatility_ratio: 1.0,
            dynamic_lower_band: 35.0,
            dynamic_upper_band: 65.0,
            ema_fast: 100.0,
            ema_slow: 101.0,
        }
    }

    #[test]
    fn test_strength_is_clamped() {
        let signal = Signal::new("BTC", Timeframe::M5, SignalDirection::Buy, 1.7, dec!(100), values(), Utc::now());
        assert_eq!(signal.strength, 1.0);

        let neutral = Signal::new("BTC", Timeframe::M5, SignalDirection::Neutral, 0.4, dec!(100), values(), Utc::now());
        assert_eq!(neutral.strength, 0.0);
        assert!(!neutral.is_actionable());
    }

    #[test]
    fn test_direction_bias() {
        assert_eq!(SignalDirection::Oversold.bias(), Some(TradeSide::Long));
        assert_eq!(SignalDirection::Sell.bias(), Some(TradeSide::Short));
        assert_eq!(SignalDirection::Neutral.bias(), None);
        assert!(!SignalDirection::Overbought.is_entry());
    }
}
