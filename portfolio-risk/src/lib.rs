//! Portfolio & Risk Management (Layer 3)
//!
//! Drawdown-aware position sizing, correlation and heat limits, and
//! trailing stops for positions opened from confirmed signals.

pub mod config;
mod correlation;
mod metrics;
mod portfolio;
mod risk;
mod trailing;

pub use config::{
    CorrelationConfig, DrawdownConfig, RiskConfig, SizingConfig, TrailingStopConfig,
};
pub use correlation::CorrelationTracker;
pub use metrics::{DrawdownTracker, RiskSnapshot};
pub use portfolio::{AccountSnapshot, ClosedPosition, OpenPosition, RiskState};
pub use risk::{PositionSizingDecision, RejectionReason, RiskController, RiskMode};
pub use trailing::{StopEvent, StopState, StopTransition, TrailingStopManager, TrailingStopOrder};

use chrono::{DateTime, Utc};
use common::{decimal_to_f64, Decimal, MarketBar, Signal, Uuid};
use signal_generation::{ConsensusResult, VolumeConfirmation};
use tracing::{info, warn};

/// Risk state plus the controller that sizes against it.
///
/// Sizing and booking happen in one `&mut self` call, so two requests can
/// never both pass the heat cap on the same budget.
#[derive(Debug, Clone)]
pub struct RiskManager {
    state: RiskState,
    controller: RiskController,
}

impl RiskManager {
    /// Create a risk manager with default configuration
    pub fn new(equity: Decimal, timestamp: DateTime<Utc>) -> anyhow::Result<Self> {
        Self::with_config(RiskConfig::default(), equity, timestamp)
    }

    /// Create a risk manager with custom configuration
    pub fn with_config(config: RiskConfig, equity: Decimal, timestamp: DateTime<Utc>) -> anyhow::Result<Self> {
        config.validate()?;
        if equity <= Decimal::ZERO {
            anyhow::bail!("starting equity must be positive, got {}", equity);
        }
        info!(equity = %equity, "Risk manager initialised");
        Ok(Self {
            state: RiskState::new(equity, timestamp, config.drawdown.clone(), &config.correlation),
            controller: RiskController::new(config),
        })
    }

    /// Size a confirmed signal and book the position when approved
    pub fn submit(
        &mut self,
        signal: &Signal,
        confirmation: &VolumeConfirmation,
        consensus: &ConsensusResult,
    ) -> PositionSizingDecision {
        let decision = self.controller.evaluate(signal, confirmation, consensus, &self.state);
        if decision.approved {
            if let Err(e) = self.state.open_position(&decision) {
                warn!(symbol = %decision.symbol, error = %e, "Approved decision could not be booked");
            }
        }
        decision
    }

    /// Feed a primary-timeframe bar: marks positions and correlation history
    pub fn on_bar(&mut self, bar: &MarketBar) {
        self.state.mark_price(&bar.symbol, bar.close);
        self.state
            .correlations_mut()
            .record_close(&bar.symbol, bar.period_start(), decimal_to_f64(bar.close));
    }

    pub fn apply_account(&mut self, snapshot: AccountSnapshot) -> Option<(RiskMode, RiskMode)> {
        self.state.apply_account(snapshot)
    }

    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        self.state.close_position(symbol, exit_price, timestamp)
    }

    /// Undo the booking of an approved decision nobody acted on. Equity,
    /// drawdown and the risk mode are left as they are.
    pub fn discard(&mut self, position_id: Uuid) -> Option<OpenPosition> {
        self.state.discard_position(position_id)
    }

    pub fn update_stop(&mut self, symbol: &str, stop_price: Decimal) {
        self.state.update_stop(symbol, stop_price);
    }

    pub fn set_correlation_override(&mut self, a: &str, b: &str, correlation: f64) {
        self.state.correlations_mut().set_override(a, b, correlation);
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        self.state.snapshot()
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn config(&self) -> &RiskConfig {
        self.controller.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{IndicatorValues, SignalDirection, Timeframe};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap()
    }

    fn inputs(symbol: &str) -> (Signal, VolumeConfirmation, ConsensusResult) {
        let values = IndicatorValues {
            rsi: 25.0,
            stoch_k: 4.0,
            stoch_d: 2.0,
            atr: 1.0,
            volatility_ratio: 1.1,
            dynamic_lower_band: 34.0,
            dynamic_upper_band: 66.0,
            ema_fast: 99.0,
            ema_slow: 100.0,
        };
        let signal = Signal::new(symbol, Timeframe::M5, SignalDirection::Buy, 0.8, dec!(100), values, now());
        let confirmation = VolumeConfirmation {
            signal_id: signal.id,
            symbol: symbol.to_string(),
            confirmed: true,
            relative_volume: 2.5,
            volume_zscore: 3.0,
            threshold: 1.2,
            reason: None,
            levels: Vec::new(),
        };
        let consensus = ConsensusResult {
            signal_id: signal.id,
            symbol: symbol.to_string(),
            direction: signal.direction,
            verdicts: Vec::new(),
            valid_count: 2,
            aligned_count: 2,
            consensus_achieved: true,
            agreement_ratio: 1.0,
            weighted_agreement: 1.0,
            elapsed: Duration::from_millis(3),
            failure: None,
        };
        (signal, confirmation, consensus)
    }

    #[test]
    fn test_submit_books_approved_position() {
        let mut manager = RiskManager::new(dec!(10000), now()).unwrap();
        let (signal, confirmation, consensus) = inputs("BTC");

        let decision = manager.submit(&signal, &confirmation, &consensus);
        assert!(decision.approved);
        assert_eq!(manager.state().num_positions(), 1);
        assert!((manager.snapshot().portfolio_heat - 0.02).abs() < 1e-9);

        let again = manager.submit(&signal, &confirmation, &consensus);
        assert!(!again.approved);
        assert_eq!(manager.state().num_positions(), 1);
    }

    #[test]
    fn test_drawdown_halt_then_exit_still_books() {
        let mut manager = RiskManager::new(dec!(10000), now()).unwrap();
        let (signal, confirmation, consensus) = inputs("BTC");
        manager.submit(&signal, &confirmation, &consensus);

        let transition = manager.apply_account(AccountSnapshot {
            equity: dec!(8400),
            timestamp: now(),
        });
        assert_eq!(transition, Some((RiskMode::Normal, RiskMode::Halted)));

        let (eth, confirmation, consensus) = inputs("ETH");
        let rejected = manager.submit(&eth, &confirmation, &consensus);
        assert!(matches!(rejected.rejection, Some(RejectionReason::DrawdownHalt { .. })));

        // exits are still managed while halted
        let closed = manager.close_position("BTC", dec!(99), now()).unwrap();
        assert!(closed.realized_pnl < Decimal::ZERO);
        assert_eq!(manager.state().num_positions(), 0);
    }

    #[test]
    fn test_discard_frees_heat_without_pnl() {
        let mut manager = RiskManager::new(dec!(10000), now()).unwrap();
        let (signal, confirmation, consensus) = inputs("BTC");
        let decision = manager.submit(&signal, &confirmation, &consensus);

        let discarded = manager.discard(decision.id).unwrap();
        assert_eq!(discarded.id, decision.id);
        assert_eq!(manager.state().num_positions(), 0);
        assert_eq!(manager.state().equity(), dec!(10000));
        assert!(manager.discard(decision.id).is_none());
    }

    #[test]
    fn test_discard_leaves_recovery_untouched() {
        let mut manager = RiskManager::new(dec!(10000), now()).unwrap();
        manager.apply_account(AccountSnapshot {
            equity: dec!(8400),
            timestamp: now(),
        });
        manager.apply_account(AccountSnapshot {
            equity: dec!(10000),
            timestamp: now(),
        });
        let before = manager.snapshot();
        assert_eq!(before.mode, RiskMode::Conservative);
        assert!((before.size_multiplier - 0.1).abs() < 1e-9);

        let (signal, confirmation, consensus) = inputs("BTC");
        let decision = manager.submit(&signal, &confirmation, &consensus);
        assert!(decision.approved);
        manager.discard(decision.id).unwrap();

        let after = manager.snapshot();
        assert_eq!(after.mode, RiskMode::Conservative);
        assert_eq!(after.size_multiplier, before.size_multiplier);
        assert_eq!(after.realized_pnl, 0.0);
        assert_eq!(after.open_positions, 0);
    }

    #[test]
    fn test_rejects_invalid_setup() {
        assert!(RiskManager::new(Decimal::ZERO, now()).is_err());

        let mut config = RiskConfig::default();
        config.max_portfolio_heat = 0.0;
        assert!(RiskManager::with_config(config, dec!(1000), now()).is_err());
    }
}
