//! Read-only observer stream
//!
//! Everything the engine concludes is published on one broadcast channel.
//! Observers that fall behind lose the oldest events; the engine never
//! waits on them.

use chrono::{DateTime, Utc};
use common::{EngineError, Signal, Timeframe, Uuid};
use portfolio_risk::{ClosedPosition, PositionSizingDecision, RiskMode, StopEvent};
use signal_generation::{ConsensusResult, VolumeConfirmation};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A bar failed validation or ordering and was dropped
    BarRejected {
        symbol: String,
        timeframe: Timeframe,
        error: EngineError,
    },
    /// Raw Buy/Sell from the indicator engine
    Signal(Signal),
    VolumeChecked(VolumeConfirmation),
    /// Volume could not be judged, e.g. too little history
    VolumeUnavailable { signal_id: Uuid, error: EngineError },
    Consensus(ConsensusResult),
    Decision(PositionSizingDecision),
    /// An in-flight decision dropped because a newer bar arrived
    Superseded {
        symbol: String,
        signal_id: Uuid,
        at: DateTime<Utc>,
    },
    Stop(StopEvent),
    PositionClosed(ClosedPosition),
    RiskModeChanged { from: RiskMode, to: RiskMode },
}

impl EngineEvent {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            EngineEvent::BarRejected { symbol, .. } | EngineEvent::Superseded { symbol, .. } => Some(symbol),
            EngineEvent::Signal(signal) => Some(&signal.symbol),
            EngineEvent::VolumeChecked(confirmation) => Some(&confirmation.symbol),
            EngineEvent::Consensus(result) => Some(&result.symbol),
            EngineEvent::Decision(decision) => Some(&decision.symbol),
            EngineEvent::Stop(event) => Some(&event.order.symbol),
            EngineEvent::PositionClosed(closed) => Some(&closed.position.symbol),
            EngineEvent::VolumeUnavailable { error, .. } => error.symbol(),
            EngineEvent::RiskModeChanged { .. } => None,
        }
    }
}

/// Cloneable publishing side of the observer channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish to whoever is listening; no observers is not an error
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No engine event observers");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_observers_is_silent() {
        let events = EventPublisher::new(4);
        events.emit(EngineEvent::RiskModeChanged {
            from: RiskMode::Normal,
            to: RiskMode::Reduced,
        });
        assert_eq!(events.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_observers_receive_in_order() {
        let events = EventPublisher::new(4);
        let mut rx = events.subscribe();
        events.emit(EngineEvent::RiskModeChanged {
            from: RiskMode::Normal,
            to: RiskMode::Reduced,
        });
        events.emit(EngineEvent::RiskModeChanged {
            from: RiskMode::Reduced,
            to: RiskMode::Halted,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::RiskModeChanged { to, .. } => assert_eq!(to, RiskMode::Reduced),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            EngineEvent::RiskModeChanged { to, .. } => assert_eq!(to, RiskMode::Halted),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
