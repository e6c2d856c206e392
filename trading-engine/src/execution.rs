//! Hand-off to the execution collaborator
//!
//! The engine never places orders. It describes what should happen and
//! passes that to an `ExecutionSink`.

use async_trait::async_trait;
use common::{Decimal, TradeSide, Uuid};
use portfolio_risk::{PositionSizingDecision, StopEvent, StopTransition};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionCommand {
    /// Open a position as sized
    Enter(PositionSizingDecision),
    /// Move the protective stop of an open position
    UpdateStop {
        position_id: Uuid,
        symbol: String,
        stop_price: Decimal,
    },
    /// Close an open position at market
    Exit {
        position_id: Uuid,
        symbol: String,
        side: TradeSide,
        quantity: Decimal,
        reference_price: Decimal,
    },
}

impl ExecutionCommand {
    /// Command for a stop transition. Activation alone changes nothing the
    /// broker needs to know about.
    pub fn from_stop_event(event: &StopEvent) -> Option<Self> {
        let order = &event.order;
        match &event.transition {
            StopTransition::Activated => None,
            StopTransition::Moved { to, .. } => Some(ExecutionCommand::UpdateStop {
                position_id: order.position_id,
                symbol: order.symbol.clone(),
                stop_price: *to,
            }),
            StopTransition::Triggered { exit_price } => Some(ExecutionCommand::Exit {
                position_id: order.position_id,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.quantity,
                reference_price: *exit_price,
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            ExecutionCommand::Enter(decision) => &decision.symbol,
            ExecutionCommand::UpdateStop { symbol, .. } | ExecutionCommand::Exit { symbol, .. } => symbol,
        }
    }
}

/// Destination for execution commands
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn submit(&self, command: ExecutionCommand) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

/// Forwards commands over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelExecutionSink {
    tx: mpsc::Sender<ExecutionCommand>,
}

impl ChannelExecutionSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ExecutionSink for ChannelExecutionSink {
    async fn submit(&self, command: ExecutionCommand) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|e| anyhow::anyhow!("Execution channel closed: {}", e))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Logs commands instead of executing them
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutionSink;

#[async_trait]
impl ExecutionSink for LoggingExecutionSink {
    async fn submit(&self, command: ExecutionCommand) -> anyhow::Result<()> {
        match &command {
            ExecutionCommand::Enter(decision) => info!(
                symbol = %decision.symbol,
                side = ?decision.side,
                quantity = %decision.quantity,
                entry = %decision.entry_price,
                stop = %decision.stop_price,
                target = %decision.take_profit,
                "📈 Enter"
            ),
            ExecutionCommand::UpdateStop { symbol, stop_price, .. } => {
                info!(symbol = %symbol, stop = %stop_price, "Stop moved")
            }
            ExecutionCommand::Exit {
                symbol,
                quantity,
                reference_price,
                ..
            } => info!(symbol = %symbol, quantity = %quantity, price = %reference_price, "📉 Exit"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use portfolio_risk::{StopState, TrailingStopOrder};
    use rust_decimal_macros::dec;

    fn event(transition: StopTransition) -> StopEvent {
        StopEvent {
            transition,
            order: TrailingStopOrder {
                position_id: Uuid::new_v4(),
                symbol: "ETHUSDT".to_string(),
                side: TradeSide::Long,
                entry_price: dec!(100),
                stop_price: dec!(98),
                take_profit: dec!(104),
                quantity: dec!(5),
                trail_distance: dec!(1),
                activation_price: dec!(101),
                best_price: dec!(101.5),
                state: StopState::Active,
                updated_at: Utc::now(),
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_stop_events_map_to_commands() {
        assert!(ExecutionCommand::from_stop_event(&event(StopTransition::Activated)).is_none());

        let moved = ExecutionCommand::from_stop_event(&event(StopTransition::Moved {
            from: dec!(98),
            to: dec!(100.5),
        }));
        assert!(matches!(
            moved,
            Some(ExecutionCommand::UpdateStop { stop_price, .. }) if stop_price == dec!(100.5)
        ));

        let exit = ExecutionCommand::from_stop_event(&event(StopTransition::Triggered {
            exit_price: dec!(100.4),
        }))
        .unwrap();
        assert_eq!(exit.symbol(), "ETHUSDT");
        assert!(matches!(exit, ExecutionCommand::Exit { quantity, .. } if quantity == dec!(5)));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_reports_closure() {
        let (sink, mut rx) = ChannelExecutionSink::new(2);
        let command = ExecutionCommand::from_stop_event(&event(StopTransition::Triggered {
            exit_price: dec!(97.9),
        }))
        .unwrap();

        sink.submit(command.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(command.clone()));

        drop(rx);
        assert!(sink.submit(command).await.is_err());
    }
}
