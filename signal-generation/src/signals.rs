//! Stochastic-RSI signal classification against the dynamic bands

use common::{IndicatorValues, SignalDirection};

/// Classify the current reading given the previous closed bar's %K/%D.
///
/// Returns the direction and raw strength. Any non-finite input collapses
/// to `Neutral` with zero strength.
pub fn classify(values: &IndicatorValues, previous_kd: Option<(f64, f64)>) -> (SignalDirection, f64) {
    if !inputs_finite(values) {
        return (SignalDirection::Neutral, 0.0);
    }

    let k = values.stoch_k;
    let d = values.stoch_d;
    let lower = values.dynamic_lower_band;
    let upper = values.dynamic_upper_band;

    let crossed_up = previous_kd.is_some_and(|(pk, pd)| pk <= pd && k > d);
    let crossed_down = previous_kd.is_some_and(|(pk, pd)| pk >= pd && k < d);

    if k < lower {
        let strength = oversold_strength(k, lower);
        if crossed_up {
            (SignalDirection::Buy, strength)
        } else {
            (SignalDirection::Oversold, strength)
        }
    } else if k > upper {
        let strength = overbought_strength(k, upper);
        if crossed_down {
            (SignalDirection::Sell, strength)
        } else {
            (SignalDirection::Overbought, strength)
        }
    } else {
        (SignalDirection::Neutral, 0.0)
    }
}

/// First non-finite input field, if any
pub fn first_non_finite(values: &IndicatorValues) -> Option<&'static str> {
    [
        ("rsi", values.rsi),
        ("stoch_k", values.stoch_k),
        ("stoch_d", values.stoch_d),
        ("atr", values.atr),
        ("volatility_ratio", values.volatility_ratio),
    ]
    .into_iter()
    .find(|(_, v)| !v.is_finite())
    .map(|(name, _)| name)
}

fn inputs_finite(values: &IndicatorValues) -> bool {
    first_non_finite(values).is_none()
}

fn oversold_strength(k: f64, lower: f64) -> f64 {
    if lower <= 0.0 {
        return 0.0;
    }
    ((lower - k) / lower).clamp(0.0, 1.0)
}

fn overbought_strength(k: f64, upper: f64) -> f64 {
    if upper >= 100.0 {
        return 0.0;
    }
    ((k - upper) / (100.0 - upper)).clamp(0.0, 1.0)
}
