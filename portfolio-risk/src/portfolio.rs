//! Risk state: equity, drawdown mode and open positions

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{decimal_to_f64, f64_to_decimal, Decimal, TradeSide, Uuid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CorrelationConfig, DrawdownConfig};
use crate::correlation::CorrelationTracker;
use crate::metrics::{DrawdownTracker, RiskSnapshot};
use crate::risk::{PositionSizingDecision, RiskMode};

/// Broker-reported account equity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Position opened from an approved sizing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_price: Decimal,
    pub take_profit: Decimal,
    pub current_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenPosition {
    fn direction(&self) -> Decimal {
        match self.side {
            TradeSide::Long => Decimal::ONE,
            TradeSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.entry_price) * self.quantity * self.direction()
    }

    /// Loss if the current stop were hit; zero once the stop locks in profit
    pub fn open_risk(&self) -> Decimal {
        ((self.entry_price - self.stop_price) * self.quantity * self.direction()).max(Decimal::ZERO)
    }

    pub fn notional(&self) -> Decimal {
        self.current_price * self.quantity
    }
}

/// Result of closing a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: OpenPosition,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Equity, drawdown mode and open positions.
///
/// Meant to have exactly one owner; every mutation goes through `&mut self`
/// so heat and drawdown checks see a consistent view.
#[derive(Debug, Clone)]
pub struct RiskState {
    config: DrawdownConfig,
    equity: Decimal,
    drawdown: DrawdownTracker,
    mode: RiskMode,
    size_multiplier: f64,
    positions: HashMap<String, OpenPosition>,
    realized_pnl: Decimal,
    correlations: CorrelationTracker,
    updated_at: DateTime<Utc>,
}

impl RiskState {
    pub fn new(
        equity: Decimal,
        timestamp: DateTime<Utc>,
        drawdown: DrawdownConfig,
        correlation: &CorrelationConfig,
    ) -> Self {
        let mut tracker = DrawdownTracker::new();
        tracker.update(decimal_to_f64(equity), timestamp);
        Self {
            config: drawdown,
            equity,
            drawdown: tracker,
            mode: RiskMode::Normal,
            size_multiplier: 1.0,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            correlations: CorrelationTracker::new(correlation),
            updated_at: timestamp,
        }
    }

    /// Apply a broker equity snapshot
    pub fn apply_account(&mut self, snapshot: AccountSnapshot) -> Option<(RiskMode, RiskMode)> {
        self.set_equity(snapshot.equity, snapshot.timestamp)
    }

    /// Record a new equity value and move the risk mode.
    ///
    /// Worsening drawdown moves the mode (and cuts the multiplier) at once.
    /// Recovery steps the mode down one level per update and raises the
    /// multiplier by at most `recovery_step`. Returns the transition, if any.
    pub fn set_equity(&mut self, equity: Decimal, timestamp: DateTime<Utc>) -> Option<(RiskMode, RiskMode)> {
        self.equity = equity;
        self.updated_at = timestamp;
        let drawdown = self.drawdown.update(decimal_to_f64(equity), timestamp);

        let target = RiskMode::for_drawdown(drawdown, &self.config);
        let previous = self.mode;
        self.mode = if target >= previous { target } else { previous.relaxed() };

        let ceiling = self.mode.multiplier(&self.config);
        self.size_multiplier = if ceiling <= self.size_multiplier {
            ceiling
        } else {
            (self.size_multiplier + self.config.recovery_step).min(ceiling)
        };

        if self.mode == previous {
            return None;
        }

        if self.mode > previous {
            warn!(
                from = ?previous,
                to = ?self.mode,
                drawdown = drawdown,
                "Risk mode tightened"
            );
        } else {
            info!(
                from = ?previous,
                to = ?self.mode,
                drawdown = drawdown,
                multiplier = self.size_multiplier,
                "Risk mode relaxed"
            );
        }
        Some((previous, self.mode))
    }

    /// Track an approved decision as an open position
    pub fn open_position(&mut self, decision: &PositionSizingDecision) -> anyhow::Result<Uuid> {
        let side = decision
            .side
            .filter(|_| decision.approved)
            .ok_or_else(|| anyhow::anyhow!("decision {} was not approved", decision.id))?;
        if self.positions.contains_key(&decision.symbol) {
            anyhow::bail!("position already open for {}", decision.symbol);
        }

        let position = OpenPosition {
            id: decision.id,
            symbol: decision.symbol.clone(),
            side,
            entry_price: decision.entry_price,
            quantity: decision.quantity,
            stop_price: decision.stop_price,
            take_profit: decision.take_profit,
            current_price: decision.entry_price,
            opened_at: decision.timestamp,
        };
        info!(
            symbol = %position.symbol,
            side = ?side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            stop = %position.stop_price,
            "Position opened"
        );
        self.positions.insert(position.symbol.clone(), position);
        Ok(decision.id)
    }

    /// Close a position, book realized P&L into equity
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        let mut position = self.positions.remove(symbol)?;
        position.current_price = exit_price;
        let realized_pnl = position.unrealized_pnl();

        self.realized_pnl += realized_pnl;
        let equity = self.equity + realized_pnl;
        self.set_equity(equity, timestamp);

        info!(
            symbol = %symbol,
            exit = %exit_price,
            pnl = %realized_pnl,
            "Position closed"
        );

        Some(ClosedPosition {
            position,
            exit_price,
            realized_pnl,
            closed_at: timestamp,
        })
    }

    /// Drop a booked position that never reached execution. No P&L is
    /// realized.
    pub fn discard_position(&mut self, position_id: Uuid) -> Option<OpenPosition> {
        let symbol = self
            .positions
            .values()
            .find(|p| p.id == position_id)
            .map(|p| p.symbol.clone())?;
        let position = self.positions.remove(&symbol)?;
        warn!(symbol = %symbol, position_id = %position_id, "Discarded unexecuted position");
        Some(position)
    }

    /// Mark a position to the latest price
    pub fn mark_price(&mut self, symbol: &str, price: Decimal) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.current_price = price;
        }
    }

    /// Move the tracked stop of a position, e.g. after a trailing update
    pub fn update_stop(&mut self, symbol: &str, stop_price: Decimal) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.stop_price = stop_price;
        }
    }

    /// Sum of open risk as a fraction of equity
    pub fn portfolio_heat(&self) -> f64 {
        if self.equity <= Decimal::ZERO {
            return 0.0;
        }
        let open_risk: Decimal = self.positions.values().map(|p| p.open_risk()).sum();
        decimal_to_f64(open_risk / self.equity)
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl()).sum()
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            equity: decimal_to_f64(self.equity),
            intraday_peak: self.drawdown.peak(),
            drawdown: self.drawdown.current(),
            max_intraday_drawdown: self.drawdown.max_intraday(),
            mode: self.mode,
            size_multiplier: self.size_multiplier,
            portfolio_heat: self.portfolio_heat(),
            open_positions: self.positions.len(),
            unrealized_pnl: decimal_to_f64(self.unrealized_pnl()),
            realized_pnl: decimal_to_f64(self.realized_pnl),
            timestamp: self.updated_at,
        }
    }

    pub fn equity(&self) -> Decimal {
        self.equity
    }

    pub fn drawdown(&self) -> f64 {
        self.drawdown.current()
    }

    pub fn mode(&self) -> RiskMode {
        self.mode
    }

    pub fn size_multiplier(&self) -> f64 {
        self.size_multiplier
    }

    pub fn config(&self) -> &DrawdownConfig {
        &self.config
    }

    pub fn position(&self, symbol: &str) -> Option<&OpenPosition> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &OpenPosition> {
        self.positions.values()
    }

    pub fn num_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn correlations(&self) -> &CorrelationTracker {
        &self.correlations
    }

    pub fn correlations_mut(&mut self) -> &mut CorrelationTracker {
        &mut self.correlations
    }

    /// Equity fraction as a decimal, for sizing
    pub(crate) fn equity_fraction(&self, fraction: f64) -> Option<Decimal> {
        f64_to_decimal(fraction).map(|f| self.equity * f)
    }
}
