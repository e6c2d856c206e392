//! Single owner of the risk state
//!
//! Symbol workers never touch `RiskManager` directly. Every read and write
//! is a command on one channel, so sizing requests are evaluated one at a
//! time against a consistent view of heat and drawdown.

use chrono::{DateTime, Utc};
use common::{Decimal, MarketBar, Signal, Uuid};
use portfolio_risk::{
    AccountSnapshot, ClosedPosition, OpenPosition, PositionSizingDecision, RiskManager, RiskMode,
    RiskSnapshot,
};
use signal_generation::{ConsensusResult, VolumeConfirmation};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventPublisher};

/// Commands understood by the risk actor
pub enum RiskCommand {
    Submit {
        signal: Signal,
        confirmation: VolumeConfirmation,
        consensus: ConsensusResult,
        respond_to: oneshot::Sender<PositionSizingDecision>,
    },
    MarkBar(MarketBar),
    Account {
        snapshot: AccountSnapshot,
        respond_to: oneshot::Sender<Option<(RiskMode, RiskMode)>>,
    },
    UpdateStop {
        symbol: String,
        stop_price: Decimal,
    },
    ClosePosition {
        symbol: String,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
        respond_to: oneshot::Sender<Option<ClosedPosition>>,
    },
    /// Release a booked entry that never reached execution
    Discard {
        position_id: Uuid,
        respond_to: oneshot::Sender<Option<OpenPosition>>,
    },
    SetCorrelation {
        a: String,
        b: String,
        correlation: f64,
    },
    Snapshot {
        respond_to: oneshot::Sender<RiskSnapshot>,
    },
}

pub struct RiskActor {
    manager: RiskManager,
    rx: mpsc::Receiver<RiskCommand>,
    events: EventPublisher,
}

impl RiskActor {
    /// Spawn the actor. It runs until every handle is dropped and returns
    /// the final risk snapshot.
    pub fn spawn(
        manager: RiskManager,
        capacity: usize,
        events: EventPublisher,
    ) -> (RiskHandle, JoinHandle<RiskSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let actor = Self { manager, rx, events };
        let task = tokio::spawn(actor.run());
        (RiskHandle { tx }, task)
    }

    async fn run(mut self) -> RiskSnapshot {
        info!("Risk actor started");
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        let snapshot = self.manager.snapshot();
        info!(
            equity = snapshot.equity,
            open_positions = snapshot.open_positions,
            mode = ?snapshot.mode,
            "Risk actor stopped"
        );
        snapshot
    }

    fn handle(&mut self, cmd: RiskCommand) {
        match cmd {
            RiskCommand::Submit {
                signal,
                confirmation,
                consensus,
                respond_to,
            } => {
                if respond_to.is_closed() {
                    debug!(symbol = %signal.symbol, "Sizing request abandoned before evaluation");
                    return;
                }
                let decision = self.manager.submit(&signal, &confirmation, &consensus);
                if let Err(decision) = respond_to.send(decision) {
                    // requester moved on; nothing will execute this entry
                    if decision.approved {
                        self.manager.discard(decision.id);
                    }
                }
            }

            RiskCommand::MarkBar(bar) => self.manager.on_bar(&bar),

            RiskCommand::Account { snapshot, respond_to } => {
                let transition = self.manager.apply_account(snapshot);
                self.publish_transition(transition);
                let _ = respond_to.send(transition);
            }

            RiskCommand::UpdateStop { symbol, stop_price } => {
                self.manager.update_stop(&symbol, stop_price);
            }

            RiskCommand::ClosePosition {
                symbol,
                exit_price,
                timestamp,
                respond_to,
            } => {
                let before = self.manager.state().mode();
                let closed = self.manager.close_position(&symbol, exit_price, timestamp);
                let after = self.manager.state().mode();
                if before != after {
                    self.publish_transition(Some((before, after)));
                }
                if let Some(closed) = &closed {
                    self.events.emit(EngineEvent::PositionClosed(closed.clone()));
                } else {
                    warn!(symbol = %symbol, "Close requested for unknown position");
                }
                let _ = respond_to.send(closed);
            }

            RiskCommand::Discard {
                position_id,
                respond_to,
            } => {
                let discarded = self.manager.discard(position_id);
                if discarded.is_none() {
                    debug!(position_id = %position_id, "Nothing booked to discard");
                }
                let _ = respond_to.send(discarded);
            }

            RiskCommand::SetCorrelation { a, b, correlation } => {
                self.manager.set_correlation_override(&a, &b, correlation);
            }

            RiskCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.manager.snapshot());
            }
        }
    }

    fn publish_transition(&self, transition: Option<(RiskMode, RiskMode)>) {
        if let Some((from, to)) = transition {
            self.events.emit(EngineEvent::RiskModeChanged { from, to });
        }
    }
}

/// Cloneable handle to the risk actor
#[derive(Debug, Clone)]
pub struct RiskHandle {
    tx: mpsc::Sender<RiskCommand>,
}

impl RiskHandle {
    /// Handle whose commands land on the returned receiver instead of an actor
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<RiskCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub(crate) async fn send(&self, cmd: RiskCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("Risk actor stopped"))
    }

    /// Size a confirmed signal; an approved decision is already booked.
    ///
    /// Once the request is sent the actor may book it even if this future
    /// is dropped, so callers that give up on an approved decision must
    /// `discard` it.
    pub async fn submit(
        &self,
        signal: Signal,
        confirmation: VolumeConfirmation,
        consensus: ConsensusResult,
    ) -> anyhow::Result<PositionSizingDecision> {
        let (tx, rx) = oneshot::channel();
        self.send(RiskCommand::Submit {
            signal,
            confirmation,
            consensus,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow::anyhow!("Risk actor dropped sizing request"))
    }

    pub async fn mark(&self, bar: MarketBar) -> anyhow::Result<()> {
        self.send(RiskCommand::MarkBar(bar)).await
    }

    pub async fn apply_account(&self, snapshot: AccountSnapshot) -> anyhow::Result<Option<(RiskMode, RiskMode)>> {
        let (tx, rx) = oneshot::channel();
        self.send(RiskCommand::Account {
            snapshot,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow::anyhow!("Risk actor dropped account update"))
    }

    pub async fn update_stop(&self, symbol: &str, stop_price: Decimal) -> anyhow::Result<()> {
        self.send(RiskCommand::UpdateStop {
            symbol: symbol.to_string(),
            stop_price,
        })
        .await
    }

    pub async fn close_position(
        &self,
        symbol: &str,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<Option<ClosedPosition>> {
        let (tx, rx) = oneshot::channel();
        self.send(RiskCommand::ClosePosition {
            symbol: symbol.to_string(),
            exit_price,
            timestamp,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow::anyhow!("Risk actor dropped close request"))
    }

    /// Drop a booked entry without realizing P&L or touching equity
    pub async fn discard(&self, position_id: Uuid) -> anyhow::Result<Option<OpenPosition>> {
        let (tx, rx) = oneshot::channel();
        self.send(RiskCommand::Discard {
            position_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow::anyhow!("Risk actor dropped discard request"))
    }

    pub async fn set_correlation(&self, a: &str, b: &str, correlation: f64) -> anyhow::Result<()> {
        self.send(RiskCommand::SetCorrelation {
            a: a.to_string(),
            b: b.to_string(),
            correlation,
        })
        .await
    }

    pub async fn snapshot(&self) -> anyhow::Result<RiskSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(RiskCommand::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("Risk actor dropped snapshot request"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{IndicatorValues, SignalDirection, Timeframe};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn inputs(symbol: &str) -> (Signal, VolumeConfirmation, ConsensusResult) {
        let values = IndicatorValues {
            rsi: 26.0,
            stoch_k: 5.0,
            stoch_d: 3.0,
            atr: 1.0,
            volatility_ratio: 1.0,
            dynamic_lower_band: 35.0,
            dynamic_upper_band: 65.0,
            ema_fast: 99.5,
            ema_slow: 100.0,
        };
        let signal = Signal::new(symbol, Timeframe::M1, SignalDirection::Buy, 0.8, dec!(100), values, Utc::now());
        let confirmation = VolumeConfirmation {
            signal_id: signal.id,
            symbol: symbol.to_string(),
            confirmed: true,
            relative_volume: 3.0,
            volume_zscore: 4.0,
            threshold: 1.2,
            reason: None,
            levels: Vec::new(),
        };
        let consensus = ConsensusResult {
            signal_id: signal.id,
            symbol: symbol.to_string(),
            direction: SignalDirection::Buy,
            verdicts: Vec::new(),
            valid_count: 3,
            aligned_count: 3,
            consensus_achieved: true,
            agreement_ratio: 1.0,
            weighted_agreement: 1.0,
            elapsed: Duration::from_millis(1),
            failure: None,
        };
        (signal, confirmation, consensus)
    }

    fn spawn() -> (RiskHandle, JoinHandle<RiskSnapshot>, EventPublisher) {
        let events = EventPublisher::new(64);
        let manager = RiskManager::new(dec!(10000), Utc::now()).unwrap();
        let (handle, task) = RiskActor::spawn(manager, 16, events.clone());
        (handle, task, events)
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_heat_cap() {
        let (handle, task, _) = spawn();

        let mut requests = Vec::new();
        for symbol in ["AAA", "BBB", "CCC", "DDD", "EEE"] {
            let handle = handle.clone();
            requests.push(tokio::spawn(async move {
                let (signal, confirmation, consensus) = inputs(symbol);
                handle.submit(signal, confirmation, consensus).await.unwrap()
            }));
        }
        let decisions = futures::future::join_all(requests).await;
        let approved = decisions
            .into_iter()
            .filter(|d| d.as_ref().is_ok_and(|d| d.approved))
            .count();

        // 2% per trade against a 6% cap
        assert_eq!(approved, 3);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.open_positions, 3);
        assert!(snapshot.portfolio_heat <= 0.06 + 1e-9);

        drop(handle);
        assert_eq!(task.await.unwrap().open_positions, 3);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_booked() {
        let (handle, _task, _) = spawn();
        let (signal, confirmation, consensus) = inputs("AAA");
        let (tx, rx) = oneshot::channel();
        drop(rx);

        handle
            .send(RiskCommand::Submit {
                signal,
                confirmation,
                consensus,
                respond_to: tx,
            })
            .await
            .unwrap();

        assert_eq!(handle.snapshot().await.unwrap().open_positions, 0);
    }

    #[tokio::test]
    async fn test_account_update_publishes_mode_change() {
        let (handle, _task, events) = spawn();
        let mut rx = events.subscribe();

        let transition = handle
            .apply_account(AccountSnapshot {
                equity: dec!(9400),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(transition, Some((RiskMode::Normal, RiskMode::Reduced)));

        match rx.recv().await.unwrap() {
            EngineEvent::RiskModeChanged { from, to } => {
                assert_eq!(from, RiskMode::Normal);
                assert_eq!(to, RiskMode::Reduced);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discard_releases_without_equity_update() {
        let (handle, _task, events) = spawn();
        for equity in [dec!(8400), dec!(10000)] {
            handle
                .apply_account(AccountSnapshot {
                    equity,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        let before = handle.snapshot().await.unwrap();
        assert_eq!(before.mode, RiskMode::Conservative);

        let mut rx = events.subscribe();
        let (signal, confirmation, consensus) = inputs("AAA");
        let decision = handle.submit(signal, confirmation, consensus).await.unwrap();
        assert!(decision.approved);

        let released = handle.discard(decision.id).await.unwrap().unwrap();
        assert_eq!(released.id, decision.id);
        assert!(handle.discard(decision.id).await.unwrap().is_none());

        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.mode, RiskMode::Conservative);
        assert_eq!(after.size_multiplier, before.size_multiplier);
        assert_eq!(after.open_positions, 0);
        assert_eq!(after.portfolio_heat, 0.0);
        assert_eq!(after.realized_pnl, 0.0);
        // no close, no mode change
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_books_pnl() {
        let (handle, _task, events) = spawn();
        let mut rx = events.subscribe();
        let (signal, confirmation, consensus) = inputs("AAA");
        let decision = handle.submit(signal, confirmation, consensus).await.unwrap();
        assert!(decision.approved);

        let closed = handle
            .close_position("AAA", dec!(101), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.realized_pnl, decision.quantity);
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::PositionClosed(_)));

        assert!(handle.close_position("AAA", dec!(101), Utc::now()).await.unwrap().is_none());
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.open_positions, 0);
        assert!(snapshot.realized_pnl > 0.0);
    }
}
