// Signal Generation (Layer 2)
// Turns primary-timeframe bars into volume-confirmed, consensus-checked signals

pub mod consensus;
pub mod indicators;
pub mod pipeline;
pub mod signals;
pub mod trend;
pub mod volume;

pub use consensus::{ConsensusConfig, ConsensusResult, ConsensusValidator, TimeframeStatus, TimeframeVerdict};
pub use indicators::{BandConfig, IndicatorConfig, IndicatorEngine, IndicatorSnapshot, IndicatorState};
pub use pipeline::{BarEvaluation, PipelineConfig, PipelineStats, SignalPipeline};
pub use trend::{BarTrendConfig, BarTrendSource, StaticTrendSource, TrendDirection, TrendSnapshot, TrendSource};
pub use volume::{LevelKind, VolumeConfig, VolumeConfirmation, VolumeFilter, VolumeLevel, VolumeProfile};
