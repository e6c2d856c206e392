// Per-symbol signal pipeline
// Runs indicator and volume stages for one symbol's primary-timeframe bars

use common::{EngineError, MarketBar, SignalDirection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::indicators::{IndicatorConfig, IndicatorEngine, IndicatorSnapshot};
use crate::volume::{VolumeConfig, VolumeConfirmation, VolumeFilter, VolumeProfile};

/// Configuration for the per-symbol pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.indicators.validate()?;
        self.volume.validate()
    }
}

/// What one bar produced after the indicator and volume stages
#[derive(Debug, Clone)]
pub struct BarEvaluation {
    pub snapshot: IndicatorSnapshot,
    /// Present for every non-neutral signal
    pub volume: Option<Result<VolumeConfirmation, EngineError>>,
}

impl BarEvaluation {
    /// Confirmed Buy/Sell worth taking to consensus
    pub fn is_candidate(&self) -> bool {
        self.snapshot.signal.is_actionable()
            && matches!(&self.volume, Some(Ok(confirmation)) if confirmation.confirmed)
    }

    pub fn confirmation(&self) -> Option<&VolumeConfirmation> {
        match &self.volume {
            Some(Ok(confirmation)) => Some(confirmation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub bars: u64,
    pub snapshots: u64,
    pub signals: u64,
    pub candidates: u64,
}

/// Indicator and volume state for one symbol
#[derive(Debug, Clone)]
pub struct SignalPipeline {
    symbol: String,
    indicators: IndicatorEngine,
    profile: VolumeProfile,
    filter: VolumeFilter,
    stats: PipelineStats,
}

impl SignalPipeline {
    pub fn new(symbol: impl Into<String>, config: PipelineConfig) -> Self {
        let symbol = symbol.into();
        info!(symbol = %symbol, "Creating signal pipeline");
        Self {
            symbol,
            profile: VolumeProfile::new(&config.volume),
            filter: VolumeFilter::new(config.volume),
            indicators: IndicatorEngine::new(config.indicators),
            stats: PipelineStats::default(),
        }
    }

    /// Run one new or revised bar through the indicator and volume stages.
    ///
    /// `Ok(None)` while indicators warm up. A rejected bar leaves all state
    /// untouched.
    pub fn process(&mut self, bar: &MarketBar) -> Result<Option<BarEvaluation>, EngineError> {
        let snapshot = self.indicators.update(bar)?;
        self.profile.record(bar)?;
        self.stats.bars += 1;

        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        self.stats.snapshots += 1;

        let signal = &snapshot.signal;
        let volume = if signal.direction == SignalDirection::Neutral {
            None
        } else {
            self.stats.signals += 1;
            Some(self.filter.confirm(signal, bar, &self.profile))
        };

        let evaluation = BarEvaluation { snapshot, volume };
        if evaluation.is_candidate() {
            self.stats.candidates += 1;
            debug!(
                symbol = %self.symbol,
                direction = ?evaluation.snapshot.signal.direction,
                strength = evaluation.snapshot.signal.strength,
                "Volume-confirmed signal"
            );
        }

        Ok(Some(evaluation))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn indicators(&self) -> &IndicatorEngine {
        &self.indicators
    }

    pub fn volume_profile(&self) -> &VolumeProfile {
        &self.profile
    }
}
