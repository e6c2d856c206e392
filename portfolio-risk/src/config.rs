//! Risk management configuration

use serde::{Deserialize, Serialize};

/// Overall risk management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Per-trade sizing rules
    #[serde(default)]
    pub sizing: SizingConfig,

    /// Drawdown thresholds and mode multipliers
    #[serde(default)]
    pub drawdown: DrawdownConfig,

    /// Correlation penalty settings
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Sum of open risk as a fraction of equity
    #[serde(default = "default_max_portfolio_heat")]
    pub max_portfolio_heat: f64,

    #[serde(default)]
    pub trailing: TrailingStopConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sizing: SizingConfig::default(),
            drawdown: DrawdownConfig::default(),
            correlation: CorrelationConfig::default(),
            max_portfolio_heat: default_max_portfolio_heat(),
            trailing: TrailingStopConfig::default(),
        }
    }
}

fn default_max_portfolio_heat() -> f64 {
    0.06
}

impl RiskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.sizing.validate()?;
        self.drawdown.validate()?;
        self.correlation.validate()?;
        self.trailing.validate()?;
        if !(self.max_portfolio_heat > 0.0 && self.max_portfolio_heat <= 1.0) {
            anyhow::bail!("max_portfolio_heat must be within (0, 1]");
        }
        Ok(())
    }
}

/// Position sizing rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Fraction of equity risked per trade
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Minimum stop distance as a fraction of entry
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Stop distance in ATRs, used when wider than the percentage stop
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: f64,

    /// Take-profit distance in multiples of the stop distance
    #[serde(default = "default_reward_risk_ratio")]
    pub reward_risk_ratio: f64,

    /// Largest position notional as a fraction of equity
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,

    /// Decimal places quantities are rounded down to
    #[serde(default = "default_quantity_decimals")]
    pub quantity_decimals: u32,
}

fn default_risk_per_trade() -> f64 {
    0.02
}

fn default_stop_loss_pct() -> f64 {
    0.015
}

fn default_atr_stop_multiplier() -> f64 {
    2.0
}

fn default_reward_risk_ratio() -> f64 {
    2.0
}

fn default_max_position_notional() -> f64 {
    2.0
}

fn default_quantity_decimals() -> u32 {
    4
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: default_risk_per_trade(),
            stop_loss_pct: default_stop_loss_pct(),
            atr_stop_multiplier: default_atr_stop_multiplier(),
            reward_risk_ratio: default_reward_risk_ratio(),
            max_position_notional: default_max_position_notional(),
            quantity_decimals: default_quantity_decimals(),
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade < 1.0) {
            anyhow::bail!("risk_per_trade must be within (0, 1)");
        }
        if self.stop_loss_pct <= 0.0 {
            anyhow::bail!("stop_loss_pct must be positive");
        }
        if self.atr_stop_multiplier < 0.0 {
            anyhow::bail!("atr_stop_multiplier must not be negative");
        }
        if self.reward_risk_ratio < 1.0 {
            anyhow::bail!("reward_risk_ratio must be at least 1");
        }
        if self.max_position_notional <= 0.0 {
            anyhow::bail!("max_position_notional must be positive");
        }
        Ok(())
    }
}

/// Drawdown thresholds for the risk modes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownConfig {
    #[serde(default = "default_reduced_at")]
    pub reduced_at: f64,

    #[serde(default = "default_conservative_at")]
    pub conservative_at: f64,

    /// Entries stop at or above this intraday drawdown
    #[serde(default = "default_halted_at")]
    pub halted_at: f64,

    #[serde(default = "default_reduced_multiplier")]
    pub reduced_multiplier: f64,

    #[serde(default = "default_conservative_multiplier")]
    pub conservative_multiplier: f64,

    /// Only signals at least this strong are sized in Conservative mode
    #[serde(default = "default_conservative_min_strength")]
    pub conservative_min_strength: f64,

    /// Largest rise of the size multiplier per equity update
    #[serde(default = "default_recovery_step")]
    pub recovery_step: f64,
}

fn default_reduced_at() -> f64 {
    0.05
}

fn default_conservative_at() -> f64 {
    0.10
}

fn default_halted_at() -> f64 {
    0.15
}

fn default_reduced_multiplier() -> f64 {
    0.7
}

fn default_conservative_multiplier() -> f64 {
    0.4
}

fn default_conservative_min_strength() -> f64 {
    0.7
}

fn default_recovery_step() -> f64 {
    0.1
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            reduced_at: default_reduced_at(),
            conservative_at: default_conservative_at(),
            halted_at: default_halted_at(),
            reduced_multiplier: default_reduced_multiplier(),
            conservative_multiplier: default_conservative_multiplier(),
            conservative_min_strength: default_conservative_min_strength(),
            recovery_step: default_recovery_step(),
        }
    }
}

impl DrawdownConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0 < self.reduced_at
            && self.reduced_at < self.conservative_at
            && self.conservative_at < self.halted_at
            && self.halted_at < 1.0)
        {
            anyhow::bail!("drawdown thresholds must satisfy 0 < reduced < conservative < halted < 1");
        }
        if !(0.0 < self.conservative_multiplier
            && self.conservative_multiplier <= self.reduced_multiplier
            && self.reduced_multiplier <= 1.0)
        {
            anyhow::bail!("mode multipliers must satisfy 0 < conservative <= reduced <= 1");
        }
        if self.recovery_step <= 0.0 {
            anyhow::bail!("recovery_step must be positive");
        }
        Ok(())
    }
}

/// Correlation penalty configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Sign-adjusted correlation above which a position counts as correlated
    #[serde(default = "default_correlation_threshold")]
    pub threshold: f64,

    /// Size multiplier applied when any open position is correlated
    #[serde(default = "default_correlation_penalty")]
    pub penalty: f64,

    /// Entries are rejected once this many correlated positions are open
    #[serde(default = "default_max_correlated_positions")]
    pub max_correlated_positions: usize,

    /// Returns kept per symbol
    #[serde(default = "default_lookback")]
    pub lookback: usize,

    /// Overlapping returns needed before a correlation is trusted
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
}

fn default_correlation_threshold() -> f64 {
    0.7
}

fn default_correlation_penalty() -> f64 {
    0.5
}

fn default_max_correlated_positions() -> usize {
    3
}

fn default_lookback() -> usize {
    100
}

fn default_min_observations() -> usize {
    20
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            threshold: default_correlation_threshold(),
            penalty: default_correlation_penalty(),
            max_correlated_positions: default_max_correlated_positions(),
            lookback: default_lookback(),
            min_observations: default_min_observations(),
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            anyhow::bail!("correlation threshold must be within [0, 1]");
        }
        if !(self.penalty > 0.0 && self.penalty <= 1.0) {
            anyhow::bail!("correlation penalty must be within (0, 1]");
        }
        if self.min_observations < 2 || self.min_observations > self.lookback {
            anyhow::bail!("min_observations must be within [2, lookback]");
        }
        Ok(())
    }
}

/// Trailing stop behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    /// Unrealized profit, as a fraction of entry, that activates trailing
    #[serde(default = "default_activation_pct")]
    pub activation_pct: f64,

    /// Trail distance as a fraction of the best price
    #[serde(default = "default_trail_pct")]
    pub trail_pct: f64,

    /// Trail distance in ATRs, used when wider than the percentage trail
    #[serde(default = "default_trail_atr_multiplier")]
    pub trail_atr_multiplier: f64,
}

fn default_activation_pct() -> f64 {
    0.01
}

fn default_trail_pct() -> f64 {
    0.01
}

fn default_trail_atr_multiplier() -> f64 {
    1.5
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            activation_pct: default_activation_pct(),
            trail_pct: default_trail_pct(),
            trail_atr_multiplier: default_trail_atr_multiplier(),
        }
    }
}

impl TrailingStopConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.activation_pct < 0.0 {
            anyhow::bail!("activation_pct must not be negative");
        }
        if self.trail_pct <= 0.0 {
            anyhow::bail!("trail_pct must be positive");
        }
        if self.trail_atr_multiplier < 0.0 {
            anyhow::bail!("trail_atr_multiplier must not be negative");
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<RiskConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: RiskConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to TOML file
pub fn save_config(config: &RiskConfig, path: &str) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Create a default configuration file template
pub fn create_config_template(path: &str) -> anyhow::Result<()> {
    let template = "# Risk & Position Sizing Configuration
# Fractions are of current account equity unless noted

# Sum of open risk allowed across all positions
max_portfolio_heat = 0.06

[sizing]
# Equity risked per trade
risk_per_trade = 0.02

# Minimum stop distance (fraction of entry)
stop_loss_pct = 0.015

# Stop distance in ATRs when wider than the percentage stop
atr_stop_multiplier = 2.0

# Take-profit distance in multiples of the stop distance
reward_risk_ratio = 2.0

# Largest position notional
max_position_notional = 2.0

# Quantities are rounded down to this many decimals
quantity_decimals = 4

[drawdown]
# Intraday drawdown thresholds
reduced_at = 0.05
conservative_at = 0.10
halted_at = 0.15

# Size multipliers per mode
reduced_multiplier = 0.7
conservative_multiplier = 0.4

# Minimum signal strength in Conservative mode
conservative_min_strength = 0.7

# Largest multiplier increase per equity update while recovering
recovery_step = 0.1

[correlation]
threshold = 0.7
penalty = 0.5
max_correlated_positions = 3
lookback = 100
min_observations = 20

[trailing]
# Profit (fraction of entry) that activates the trailing stop
activation_pct = 0.01

# Trail distance: the wider of trail_pct of price and trail_atr_multiplier ATRs
trail_pct = 0.01
trail_atr_multiplier = 1.5
";

    std::fs::write(path, template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RiskConfig::default();
        assert_eq!(config.sizing.risk_per_trade, 0.02);
        assert_eq!(config.drawdown.halted_at, 0.15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = RiskConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: RiskConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.max_portfolio_heat, deserialized.max_portfolio_heat);
        assert_eq!(config.correlation.lookback, deserialized.correlation.lookback);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RiskConfig = toml::from_str("[sizing]\nrisk_per_trade = 0.01\n").unwrap();
        assert_eq!(config.sizing.risk_per_trade, 0.01);
        assert_eq!(config.sizing.stop_loss_pct, 0.015);
        assert_eq!(config.max_portfolio_heat, 0.06);
    }

    #[test]
    fn test_template_round_trip() {
        let path = std::env::temp_dir().join(format!("risk-template-{}.toml", std::process::id()));
        let path = path.to_string_lossy().to_string();

        create_config_template(&path).unwrap();
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.drawdown.conservative_multiplier, 0.4);
        assert_eq!(config.trailing.trail_atr_multiplier, 1.5);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = RiskConfig::default();
        config.drawdown.conservative_at = 0.2;
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.sizing.reward_risk_ratio = 0.5;
        assert!(config.validate().is_err());
    }
}
