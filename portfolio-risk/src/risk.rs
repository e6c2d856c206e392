//! Drawdown modes, rejection reasons and the position sizing controller

use chrono::{DateTime, Utc};
use common::{decimal_to_f64, f64_to_decimal, Decimal, Signal, SignalDirection, TradeSide, Uuid};
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use signal_generation::{ConsensusResult, VolumeConfirmation, VolumeLevel};
use tracing::{debug, info};

use crate::config::{DrawdownConfig, RiskConfig};
use crate::portfolio::RiskState;

/// Risk mode, ordered from least to most restrictive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskMode {
    Normal,
    Reduced,
    Conservative,
    Halted,
}

impl RiskMode {
    pub fn for_drawdown(drawdown: f64, config: &DrawdownConfig) -> Self {
        match drawdown {
            d if d >= config.halted_at => RiskMode::Halted,
            d if d >= config.conservative_at => RiskMode::Conservative,
            d if d >= config.reduced_at => RiskMode::Reduced,
            _ => RiskMode::Normal,
        }
    }

    /// Size multiplier ceiling for this mode
    pub fn multiplier(&self, config: &DrawdownConfig) -> f64 {
        match self {
            RiskMode::Normal => 1.0,
            RiskMode::Reduced => config.reduced_multiplier,
            RiskMode::Conservative => config.conservative_multiplier,
            RiskMode::Halted => 0.0,
        }
    }

    /// One level less restrictive
    pub fn relaxed(&self) -> Self {
        match self {
            RiskMode::Halted => RiskMode::Conservative,
            RiskMode::Conservative => RiskMode::Reduced,
            RiskMode::Reduced | RiskMode::Normal => RiskMode::Normal,
        }
    }
}

/// Why a sizing request produced no trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    DrawdownHalt {
        drawdown: f64,
        limit: f64,
    },
    NotActionable {
        direction: SignalDirection,
    },
    VolumeNotConfirmed {
        relative_volume: f64,
        threshold: f64,
    },
    ConsensusNotAchieved {
        aligned: usize,
        valid: usize,
    },
    InsufficientStrength {
        strength: f64,
        required: f64,
    },
    DuplicatePosition {
        symbol: String,
    },
    TooManyCorrelated {
        correlated: usize,
        limit: usize,
    },
    HeatCapExceeded {
        current: f64,
        proposed: f64,
        limit: f64,
    },
    InvalidStopDistance {
        entry: Decimal,
        atr: f64,
    },
    NonPositiveQuantity {
        quantity: Decimal,
    },
    InvalidEquity {
        equity: Decimal,
    },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::DrawdownHalt { drawdown, limit } => {
                write!(
                    f,
                    "Entries halted: drawdown {:.2}% at or above {:.2}%",
                    drawdown * 100.0,
                    limit * 100.0
                )
            }
            RejectionReason::NotActionable { direction } => {
                write!(f, "Signal {:?} does not open positions", direction)
            }
            RejectionReason::VolumeNotConfirmed { relative_volume, threshold } => {
                write!(
                    f,
                    "Relative volume {:.2} below threshold {:.2}",
                    relative_volume, threshold
                )
            }
            RejectionReason::ConsensusNotAchieved { aligned, valid } => {
                write!(f, "Only {} of {} valid timeframes aligned", aligned, valid)
            }
            RejectionReason::InsufficientStrength { strength, required } => {
                write!(f, "Strength {:.2} below conservative minimum {:.2}", strength, required)
            }
            RejectionReason::DuplicatePosition { symbol } => {
                write!(f, "Position already open for {}", symbol)
            }
            RejectionReason::TooManyCorrelated { correlated, limit } => {
                write!(f, "{} correlated positions open, limit {}", correlated, limit)
            }
            RejectionReason::HeatCapExceeded { current, proposed, limit } => {
                write!(
                    f,
                    "Portfolio heat {:.2}% + {:.2}% exceeds limit {:.2}%",
                    current * 100.0,
                    proposed * 100.0,
                    limit * 100.0
                )
            }
            RejectionReason::InvalidStopDistance { entry, atr } => {
                write!(f, "No usable stop distance for entry {} (ATR {:.4})", entry, atr)
            }
            RejectionReason::NonPositiveQuantity { quantity } => {
                write!(f, "Sized quantity {} is not positive", quantity)
            }
            RejectionReason::InvalidEquity { equity } => {
                write!(f, "Account equity {} is not positive", equity)
            }
        }
    }
}

impl std::error::Error for RejectionReason {}

/// Outcome of a sizing request; approved or not, always fully populated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizingDecision {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub symbol: String,
    pub side: Option<TradeSide>,
    pub approved: bool,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub take_profit: Decimal,
    pub stop_distance: Decimal,
    pub risk_amount: Decimal,
    pub notional: Decimal,
    pub atr: f64,
    pub risk_mode: RiskMode,
    pub size_multiplier: f64,
    pub correlation_penalty: f64,
    pub portfolio_heat_after: f64,
    pub rejection: Option<RejectionReason>,
    /// Advisory support/resistance from the volume profile
    pub levels: Vec<VolumeLevel>,
    pub timestamp: DateTime<Utc>,
}

impl PositionSizingDecision {
    fn rejected(signal: &Signal, state: &RiskState, reason: RejectionReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            side: signal.direction.bias(),
            approved: false,
            quantity: Decimal::ZERO,
            entry_price: signal.price,
            stop_price: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            stop_distance: Decimal::ZERO,
            risk_amount: Decimal::ZERO,
            notional: Decimal::ZERO,
            atr: signal.indicators.atr,
            risk_mode: state.mode(),
            size_multiplier: state.size_multiplier(),
            correlation_penalty: 1.0,
            portfolio_heat_after: state.portfolio_heat(),
            rejection: Some(reason),
            levels: Vec::new(),
            timestamp: signal.timestamp,
        }
    }
}

/// Sizes entries against the current risk state
#[derive(Debug, Clone)]
pub struct RiskController {
    config: RiskConfig,
}

impl RiskController {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Evaluate a confirmed signal.
    ///
    /// The size is the base risk scaled by the mode multiplier and the
    /// correlation penalty; the heat cap then accepts or rejects that size
    /// as-is.
    pub fn evaluate(
        &self,
        signal: &Signal,
        confirmation: &VolumeConfirmation,
        consensus: &ConsensusResult,
        state: &RiskState,
    ) -> PositionSizingDecision {
        match self.size(signal, confirmation, consensus, state) {
            Ok(decision) => {
                info!(
                    symbol = %decision.symbol,
                    side = ?decision.side,
                    quantity = %decision.quantity,
                    entry = %decision.entry_price,
                    stop = %decision.stop_price,
                    mode = ?decision.risk_mode,
                    "Position sizing approved"
                );
                decision
            }
            Err(reason) => {
                debug!(symbol = %signal.symbol, reason = %reason, "Position sizing rejected");
                let mut decision = PositionSizingDecision::rejected(signal, state, reason);
                decision.levels = confirmation.levels.clone();
                decision
            }
        }
    }

    fn size(
        &self,
        signal: &Signal,
        confirmation: &VolumeConfirmation,
        consensus: &ConsensusResult,
        state: &RiskState,
    ) -> Result<PositionSizingDecision, RejectionReason> {
        let drawdown_config = state.config();
        let mode = state.mode();

        if mode == RiskMode::Halted {
            return Err(RejectionReason::DrawdownHalt {
                drawdown: state.drawdown(),
                limit: drawdown_config.halted_at,
            });
        }

        let side = match signal.direction.bias() {
            Some(side) if signal.is_actionable() => side,
            _ => {
                return Err(RejectionReason::NotActionable {
                    direction: signal.direction,
                })
            }
        };

        if !confirmation.confirmed {
            return Err(RejectionReason::VolumeNotConfirmed {
                relative_volume: confirmation.relative_volume,
                threshold: confirmation.threshold,
            });
        }

        if !consensus.consensus_achieved {
            return Err(RejectionReason::ConsensusNotAchieved {
                aligned: consensus.aligned_count,
                valid: consensus.valid_count,
            });
        }

        if mode == RiskMode::Conservative && signal.strength < drawdown_config.conservative_min_strength {
            return Err(RejectionReason::InsufficientStrength {
                strength: signal.strength,
                required: drawdown_config.conservative_min_strength,
            });
        }

        if state.position(&signal.symbol).is_some() {
            return Err(RejectionReason::DuplicatePosition {
                symbol: signal.symbol.clone(),
            });
        }

        let correlated = self.correlated_positions(signal, side, state);
        let limit = self.config.correlation.max_correlated_positions;
        if correlated >= limit {
            return Err(RejectionReason::TooManyCorrelated { correlated, limit });
        }
        let correlation_penalty = if correlated > 0 {
            self.config.correlation.penalty
        } else {
            1.0
        };

        let equity = state.equity();
        if equity <= Decimal::ZERO {
            return Err(RejectionReason::InvalidEquity { equity });
        }

        let entry = signal.price;
        let atr = signal.indicators.atr;
        let stop_distance = self.stop_distance(entry, atr).ok_or(RejectionReason::InvalidStopDistance { entry, atr })?;

        let sizing = &self.config.sizing;
        let scale = sizing.risk_per_trade * state.size_multiplier() * correlation_penalty;
        let risk_budget = state
            .equity_fraction(scale)
            .ok_or(RejectionReason::InvalidEquity { equity })?;

        let mut quantity = round_down(risk_budget / stop_distance, sizing.quantity_decimals);

        // leverage cap
        if let Some(max_notional) = state.equity_fraction(sizing.max_position_notional) {
            if quantity * entry > max_notional {
                quantity = round_down(max_notional / entry, sizing.quantity_decimals);
            }
        }

        if quantity <= Decimal::ZERO {
            return Err(RejectionReason::NonPositiveQuantity { quantity });
        }

        let risk_amount = quantity * stop_distance;
        let current_heat = state.portfolio_heat();
        let proposed_heat = decimal_to_f64(risk_amount / equity);
        if current_heat + proposed_heat > self.config.max_portfolio_heat + HEAT_EPSILON {
            return Err(RejectionReason::HeatCapExceeded {
                current: current_heat,
                proposed: proposed_heat,
                limit: self.config.max_portfolio_heat,
            });
        }

        let reward = stop_distance * f64_to_decimal(sizing.reward_risk_ratio).unwrap_or(Decimal::ONE);
        let (stop_price, take_profit) = match side {
            TradeSide::Long => (entry - stop_distance, entry + reward),
            TradeSide::Short => (entry + stop_distance, entry - reward),
        };

        Ok(PositionSizingDecision {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            side: Some(side),
            approved: true,
            quantity,
            entry_price: entry,
            stop_price,
            take_profit,
            stop_distance,
            risk_amount,
            notional: quantity * entry,
            atr,
            risk_mode: mode,
            size_multiplier: state.size_multiplier(),
            correlation_penalty,
            portfolio_heat_after: current_heat + proposed_heat,
            rejection: None,
            levels: confirmation.levels.clone(),
            timestamp: signal.timestamp,
        })
    }

    /// Wider of the percentage stop and the ATR stop
    fn stop_distance(&self, entry: Decimal, atr: f64) -> Option<Decimal> {
        let sizing = &self.config.sizing;
        let pct = entry * f64_to_decimal(sizing.stop_loss_pct)?;
        let atr_stop = f64_to_decimal(atr * sizing.atr_stop_multiplier).unwrap_or(Decimal::ZERO);
        let distance = pct.max(atr_stop);
        (distance > Decimal::ZERO && distance < entry).then_some(distance)
    }

    /// Open positions whose sign-adjusted correlation exceeds the threshold
    fn correlated_positions(&self, signal: &Signal, side: TradeSide, state: &RiskState) -> usize {
        let threshold = self.config.correlation.threshold;
        state
            .positions()
            .filter(|position| {
                state
                    .correlations()
                    .correlation(&signal.symbol, &position.symbol)
                    .map(|c| c * side.sign() * position.side.sign() > threshold)
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Float slack so a budget filled exactly to the cap is not rejected
const HEAT_EPSILON: f64 = 1e-9;

fn round_down(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}
