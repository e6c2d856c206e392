//! Engine configuration
//!
//! One immutable snapshot aggregating every component's settings. Loaded
//! from an optional TOML file, then overridden from `ENGINE__`-prefixed
//! environment variables (`ENGINE__RISK__MAX_PORTFOLIO_HEAT=0.05`).

use std::path::Path;

use anyhow::Context;
use common::{Decimal, Timeframe};
use config::{Config, Environment, File};
use data_ingestion::SyntheticFeedConfig;
use portfolio_risk::RiskConfig;
use serde::{Deserialize, Serialize};
use signal_generation::{BarTrendConfig, ConsensusConfig, PipelineConfig};
use tracing::info;

pub const ENV_PREFIX: &str = "ENGINE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeframe that drives indicators, sizing and stops
    #[serde(default = "default_primary_timeframe")]
    pub primary_timeframe: Timeframe,

    #[serde(default = "default_starting_equity")]
    pub starting_equity: Decimal,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// EMA settings for trends derived from higher-timeframe bars
    #[serde(default)]
    pub trend: BarTrendConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub channels: ChannelConfig,

    /// Used by the demo binary only
    #[serde(default)]
    pub feed: SyntheticFeedConfig,
}

fn default_primary_timeframe() -> Timeframe {
    Timeframe::M1
}

fn default_starting_equity() -> Decimal {
    Decimal::from(10_000)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_timeframe: default_primary_timeframe(),
            starting_equity: default_starting_equity(),
            pipeline: PipelineConfig::default(),
            consensus: ConsensusConfig::default(),
            trend: BarTrendConfig::default(),
            risk: RiskConfig::default(),
            channels: ChannelConfig::default(),
            feed: SyntheticFeedConfig::default(),
        }
    }
}

/// Channel sizes and hand-off timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bars buffered per symbol worker
    #[serde(default = "default_bar_capacity")]
    pub bar_capacity: usize,

    /// How long the router waits on a full worker channel before dropping
    #[serde(default = "default_bar_send_timeout_ms")]
    pub bar_send_timeout_ms: u64,

    #[serde(default = "default_risk_capacity")]
    pub risk_capacity: usize,

    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,

    /// Broadcast buffer; slow observers lag and skip
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

fn default_bar_capacity() -> usize {
    256
}

fn default_bar_send_timeout_ms() -> u64 {
    50
}

fn default_risk_capacity() -> usize {
    256
}

fn default_control_capacity() -> usize {
    32
}

fn default_event_capacity() -> usize {
    1024
}

fn default_execution_timeout_ms() -> u64 {
    500
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bar_capacity: default_bar_capacity(),
            bar_send_timeout_ms: default_bar_send_timeout_ms(),
            risk_capacity: default_risk_capacity(),
            control_capacity: default_control_capacity(),
            event_capacity: default_event_capacity(),
            execution_timeout_ms: default_execution_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.bar_capacity == 0
            || self.risk_capacity == 0
            || self.control_capacity == 0
            || self.event_capacity == 0
        {
            anyhow::bail!("channel capacities must be positive");
        }
        if self.bar_send_timeout_ms == 0 || self.execution_timeout_ms == 0 {
            anyhow::bail!("channel timeouts must be positive");
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load from `path` (if given) and `ENGINE__*` environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading engine configuration");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to build engine configuration")?
            .try_deserialize()
            .context("Failed to parse engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.starting_equity <= Decimal::ZERO {
            anyhow::bail!("starting_equity must be positive");
        }
        if let Some(tf) = self
            .consensus
            .timeframes
            .iter()
            .find(|tf| **tf <= self.primary_timeframe)
        {
            anyhow::bail!(
                "consensus timeframe {} must be above the primary timeframe {}",
                tf,
                self.primary_timeframe
            );
        }
        if self.trend.fast_period == 0 || self.trend.fast_period >= self.trend.slow_period {
            anyhow::bail!("trend fast_period must be positive and below slow_period");
        }
        self.pipeline.validate()?;
        self.consensus.validate()?;
        self.risk.validate()?;
        self.channels.validate()
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize engine configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_toml(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("engine-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.starting_equity, Decimal::from(10_000));
        assert_eq!(config.consensus.timeframes.len(), 3);
    }

    #[test]
    fn test_load_partial_file() {
        let path = temp_toml(
            r#"
starting_equity = 25000

[risk]
max_portfolio_heat = 0.05

[risk.sizing]
risk_per_trade = 0.01

[consensus]
timeframes = ["1h", "4h"]
"#,
        );
        let config = EngineConfig::load_with_prefix(Some(&path), "ENGINE_TEST_FILE").unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.starting_equity, Decimal::from(25_000));
        assert_eq!(config.risk.max_portfolio_heat, 0.05);
        assert_eq!(config.risk.sizing.risk_per_trade, 0.01);
        assert_eq!(config.consensus.timeframes, vec![Timeframe::H1, Timeframe::H4]);
        // untouched sections keep their defaults
        assert_eq!(config.risk.drawdown.halted_at, 0.15);
        assert_eq!(config.pipeline.indicators.rsi_period, 14);
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = temp_toml("[risk]\nmax_portfolio_heat = 0.05\n");
        std::env::set_var("ENGINE_TEST_ENV__RISK__MAX_PORTFOLIO_HEAT", "0.04");
        let config = EngineConfig::load_with_prefix(Some(&path), "ENGINE_TEST_ENV").unwrap();
        std::env::remove_var("ENGINE_TEST_ENV__RISK__MAX_PORTFOLIO_HEAT");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.risk.max_portfolio_heat, 0.04);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = EngineConfig::default();
        config.consensus.timeframes = vec![Timeframe::M1, Timeframe::H1];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.starting_equity = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.channels.bar_capacity = 0;
        assert!(config.validate().is_err());

        let path = temp_toml("[risk]\nmax_portfolio_heat = 2.0\n");
        let loaded = EngineConfig::load_with_prefix(Some(&path), "ENGINE_TEST_INVALID");
        std::fs::remove_file(&path).unwrap();
        assert!(loaded.is_err());
    }

    #[test]
    fn test_toml_export_round_trips() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        let path = temp_toml(&text);
        let loaded = EngineConfig::load_with_prefix(Some(&path), "ENGINE_TEST_EXPORT").unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.channels.bar_capacity, config.channels.bar_capacity);
        assert_eq!(loaded.feed.symbols, config.feed.symbols);
    }
}
