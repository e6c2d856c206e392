//! Volatility-adaptive oversold/overbought bands for the stochastic RSI

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConfig {
    /// Static oversold bound (0-100)
    #[serde(default = "default_base_lower")]
    pub base_lower: f64,

    /// Static overbought bound (0-100)
    #[serde(default = "default_base_upper")]
    pub base_upper: f64,

    /// Volatility ratio above which bands widen and below whose inverse
    /// they tighten. 1.0 adjusts on any deviation from average volatility.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,

    /// Band points moved per unit of volatility-ratio deviation, /100
    #[serde(default = "default_adjustment_factor")]
    pub adjustment_factor: f64,

    #[serde(default = "default_min_band_width")]
    pub min_band_width: f64,

    #[serde(default = "default_max_band_width")]
    pub max_band_width: f64,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            base_lower: default_base_lower(),
            base_upper: default_base_upper(),
            sensitivity: default_sensitivity(),
            adjustment_factor: default_adjustment_factor(),
            min_band_width: default_min_band_width(),
            max_band_width: default_max_band_width(),
        }
    }
}

fn default_base_lower() -> f64 {
    35.0
}

fn default_base_upper() -> f64 {
    65.0
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_adjustment_factor() -> f64 {
    0.1
}

fn default_min_band_width() -> f64 {
    10.0
}

fn default_max_band_width() -> f64 {
    80.0
}

impl BandConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.base_lower) || !(0.0..=100.0).contains(&self.base_upper) {
            anyhow::bail!("band bounds must lie in [0, 100]");
        }
        if self.base_lower >= self.base_upper {
            anyhow::bail!("base_lower must be below base_upper");
        }
        if self.sensitivity < 1.0 {
            anyhow::bail!("sensitivity must be >= 1.0");
        }
        if self.min_band_width > self.base_upper - self.base_lower
            || self.max_band_width < self.base_upper - self.base_lower
        {
            anyhow::bail!("base band width must lie within [min_band_width, max_band_width]");
        }
        Ok(())
    }
}

/// Lower and upper band for a given volatility ratio.
///
/// Both bands move by the same amount so the midpoint stays put. A
/// non-finite ratio leaves the static bands in place.
pub fn dynamic_bands(config: &BandConfig, volatility_ratio: f64) -> (f64, f64) {
    let (base_lower, base_upper) = (config.base_lower, config.base_upper);
    let base_width = base_upper - base_lower;

    if !volatility_ratio.is_finite() {
        return (base_lower, base_upper);
    }

    // positive shift widens, negative tightens
    let shift = if volatility_ratio > config.sensitivity {
        let expansion = (volatility_ratio - 1.0) * config.adjustment_factor * 100.0;
        expansion.min((config.max_band_width - base_width) / 2.0)
    } else if volatility_ratio < 1.0 / config.sensitivity {
        let contraction = (1.0 - volatility_ratio) * config.adjustment_factor * 100.0;
        -contraction.min((base_width - config.min_band_width) / 2.0)
    } else {
        0.0
    };

    let lower = (base_lower - shift).clamp(0.0, 100.0);
    let upper = (base_upper + shift).clamp(0.0, 100.0);
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_volatility_widens() {
        let config = BandConfig::default();
        let (lower, upper) = dynamic_bands(&config, 2.0);
        assert!(lower < config.base_lower);
        assert!(upper > config.base_upper);
        assert!((lower - 25.0).abs() < 1e-9);
        assert!((upper - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_halving_volatility_tightens() {
        let config = BandConfig::default();
        let (lower, upper) = dynamic_bands(&config, 0.5);
        assert!(lower > config.base_lower);
        assert!(upper < config.base_upper);
        assert!(upper - lower >= config.min_band_width);
    }

    #[test]
    fn test_width_is_bounded() {
        let config = BandConfig::default();

        let (lower, upper) = dynamic_bands(&config, 50.0);
        assert!((upper - lower - config.max_band_width).abs() < 1e-9);

        let (lower, upper) = dynamic_bands(&config, 0.0);
        assert!((upper - lower - config.min_band_width).abs() < 1e-9);
    }

    #[test]
    fn test_bands_move_continuously() {
        let config = BandConfig::default();
        let mut previous = dynamic_bands(&config, 0.2);
        let mut ratio = 0.2;
        while ratio < 3.0 {
            ratio += 0.01;
            let current = dynamic_bands(&config, ratio);
            assert!((current.0 - previous.0).abs() <= 0.1 + 1e-9);
            assert!((current.1 - previous.1).abs() <= 0.1 + 1e-9);
            previous = current;
        }
    }

    #[test]
    fn test_dead_zone_with_higher_sensitivity() {
        let config = BandConfig {
            sensitivity: 1.5,
            ..Default::default()
        };
        assert_eq!(dynamic_bands(&config, 1.2), (35.0, 65.0));
        assert_eq!(dynamic_bands(&config, 0.8), (35.0, 65.0));
        assert!(dynamic_bands(&config, 1.6).0 < 35.0);
    }

    #[test]
    fn test_non_finite_ratio_keeps_static_bands() {
        let config = BandConfig::default();
        assert_eq!(dynamic_bands(&config, f64::NAN), (35.0, 65.0));
    }
}
