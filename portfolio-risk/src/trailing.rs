//! Trailing stop management
//!
//! Each open position moves Pending -> Active -> Triggered. While Pending
//! the initial stop is static; once unrealized profit reaches the activation
//! threshold the stop follows the best price at the trail distance and never
//! moves back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{f64_to_decimal, Decimal, MarketBar, TradeSide, Uuid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrailingStopConfig;
use crate::risk::PositionSizingDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopState {
    Pending,
    Active,
    Triggered,
}

/// Stop order tracked for one open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopOrder {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub take_profit: Decimal,
    pub quantity: Decimal,
    pub trail_distance: Decimal,
    /// Price at which trailing activates
    pub activation_price: Decimal,
    /// Best price seen since entry
    pub best_price: Decimal,
    pub state: StopState,
    pub updated_at: DateTime<Utc>,
}

impl TrailingStopOrder {
    fn is_long(&self) -> bool {
        self.side == TradeSide::Long
    }

    /// Whether a bar's range reached the stop
    fn stop_hit(&self, bar: &MarketBar) -> bool {
        if self.is_long() {
            bar.low <= self.stop_price
        } else {
            bar.high >= self.stop_price
        }
    }

    /// Fill at the stop, or at the open when the bar gapped through it
    fn exit_price(&self, bar: &MarketBar) -> Decimal {
        if self.is_long() {
            bar.open.min(self.stop_price)
        } else {
            bar.open.max(self.stop_price)
        }
    }

    fn favourable(&self, bar: &MarketBar) -> Decimal {
        if self.is_long() {
            bar.high
        } else {
            bar.low
        }
    }

    fn improves(&self, candidate: Decimal) -> bool {
        if self.is_long() {
            candidate > self.stop_price
        } else {
            candidate < self.stop_price
        }
    }

    fn activated_by(&self, price: Decimal) -> bool {
        if self.is_long() {
            price >= self.activation_price
        } else {
            price <= self.activation_price
        }
    }

    fn trail_from(&self, price: Decimal) -> Decimal {
        if self.is_long() {
            price - self.trail_distance
        } else {
            price + self.trail_distance
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopTransition {
    Activated,
    Moved { from: Decimal, to: Decimal },
    Triggered { exit_price: Decimal },
}

/// A change to a tracked stop, to be forwarded to execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    pub transition: StopTransition,
    pub order: TrailingStopOrder,
    pub timestamp: DateTime<Utc>,
}

/// Trailing stops for the positions of one worker
#[derive(Debug, Clone)]
pub struct TrailingStopManager {
    config: TrailingStopConfig,
    orders: HashMap<String, TrailingStopOrder>,
}

impl TrailingStopManager {
    pub fn new(config: TrailingStopConfig) -> Self {
        Self {
            config,
            orders: HashMap::new(),
        }
    }

    /// Start tracking an approved decision
    pub fn register(&mut self, decision: &PositionSizingDecision) -> anyhow::Result<&TrailingStopOrder> {
        let side = decision
            .side
            .filter(|_| decision.approved)
            .ok_or_else(|| anyhow::anyhow!("decision {} was not approved", decision.id))?;

        let entry = decision.entry_price;
        let pct_trail = entry * f64_to_decimal(self.config.trail_pct).unwrap_or(Decimal::ZERO);
        let atr_trail = f64_to_decimal(decision.atr * self.config.trail_atr_multiplier).unwrap_or(Decimal::ZERO);
        let trail_distance = pct_trail.max(atr_trail);
        if trail_distance <= Decimal::ZERO {
            anyhow::bail!("no trail distance for {}", decision.symbol);
        }

        let activation = entry * f64_to_decimal(self.config.activation_pct).unwrap_or(Decimal::ZERO);
        let activation_price = match side {
            TradeSide::Long => entry + activation,
            TradeSide::Short => entry - activation,
        };

        let order = TrailingStopOrder {
            position_id: decision.id,
            symbol: decision.symbol.clone(),
            side,
            entry_price: entry,
            stop_price: decision.stop_price,
            take_profit: decision.take_profit,
            quantity: decision.quantity,
            trail_distance,
            activation_price,
            best_price: entry,
            state: StopState::Pending,
            updated_at: decision.timestamp,
        };

        debug!(
            symbol = %order.symbol,
            stop = %order.stop_price,
            activation = %order.activation_price,
            trail = %order.trail_distance,
            "Trailing stop registered"
        );
        self.orders.insert(order.symbol.clone(), order);
        self.orders
            .get(&decision.symbol)
            .ok_or_else(|| anyhow::anyhow!("stop for {} missing after insert", decision.symbol))
    }

    /// Advance the stop for `bar.symbol` through one bar.
    ///
    /// The current stop is checked against the bar's range first; only a
    /// surviving position ratchets on the bar's favourable extreme. A
    /// triggered stop is removed.
    pub fn on_bar(&mut self, bar: &MarketBar) -> Vec<StopEvent> {
        let Some(order) = self.orders.get_mut(&bar.symbol) else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if order.stop_hit(bar) {
            let exit_price = order.exit_price(bar);
            order.state = StopState::Triggered;
            order.updated_at = bar.timestamp;
            info!(
                symbol = %order.symbol,
                stop = %order.stop_price,
                exit = %exit_price,
                "Trailing stop triggered"
            );
            events.push(StopEvent {
                transition: StopTransition::Triggered { exit_price },
                order: order.clone(),
                timestamp: bar.timestamp,
            });
            self.orders.remove(&bar.symbol);
            return events;
        }

        let extreme = order.favourable(bar);
        order.best_price = if order.is_long() {
            order.best_price.max(extreme)
        } else {
            order.best_price.min(extreme)
        };
        order.updated_at = bar.timestamp;

        if order.state == StopState::Pending && order.activated_by(order.best_price) {
            order.state = StopState::Active;
            info!(symbol = %order.symbol, best = %order.best_price, "Trailing stop activated");
            events.push(StopEvent {
                transition: StopTransition::Activated,
                order: order.clone(),
                timestamp: bar.timestamp,
            });
        }

        if order.state == StopState::Active {
            let candidate = order.trail_from(order.best_price);
            if order.improves(candidate) {
                let from = order.stop_price;
                order.stop_price = candidate;
                debug!(symbol = %order.symbol, from = %from, to = %candidate, "Trailing stop moved");
                events.push(StopEvent {
                    transition: StopTransition::Moved { from, to: candidate },
                    order: order.clone(),
                    timestamp: bar.timestamp,
                });
            }
        }

        events
    }

    /// Stop tracking a position closed elsewhere
    pub fn remove(&mut self, symbol: &str) -> Option<TrailingStopOrder> {
        self.orders.remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&TrailingStopOrder> {
        self.orders.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
