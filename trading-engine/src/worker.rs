//! Per-symbol worker
//!
//! Owns the symbol's indicator, volume and trailing-stop state. Bars are
//! handled strictly in order. A confirmed candidate starts a decision
//! (consensus fan-out, then sizing) that runs while the worker keeps
//! listening; if the next bar arrives first the decision is abandoned.
//! During consensus it is simply dropped. Once sizing was requested the
//! risk actor may already have booked it, so the reply is awaited and an
//! approval is discarded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::{MarketBar, Signal, SignalDirection, Uuid};
use data_ingestion::IngestedBar;
use portfolio_risk::{PositionSizingDecision, StopTransition, TrailingStopManager};
use serde::{Deserialize, Serialize};
use signal_generation::{ConsensusResult, ConsensusValidator, SignalPipeline, VolumeConfirmation};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventPublisher};
use crate::execution::{ExecutionCommand, ExecutionSink};
use crate::risk_actor::RiskHandle;

/// Collaborators shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub validator: ConsensusValidator,
    pub risk: RiskHandle,
    pub sink: Arc<dyn ExecutionSink>,
    pub events: EventPublisher,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub bars: u64,
    pub rejected_bars: u64,
    pub candidates: u64,
    pub decisions: u64,
    pub approved: u64,
    pub superseded: u64,
    pub stop_events: u64,
    pub exits: u64,
    pub execution_failures: u64,
}

type ConsensusFuture = Pin<Box<dyn Future<Output = ConsensusResult> + Send>>;
type DecisionFuture = Pin<Box<dyn Future<Output = anyhow::Result<PositionSizingDecision>> + Send>>;

enum Stage {
    Consensus {
        signal: Signal,
        confirmation: VolumeConfirmation,
        consensus: ConsensusFuture,
    },
    Sizing(DecisionFuture),
}

struct InFlight {
    signal_id: Uuid,
    stage: Stage,
}

enum Progress {
    Consensus(ConsensusResult),
    Decided(anyhow::Result<PositionSizingDecision>),
}

pub struct SymbolWorker {
    symbol: String,
    ctx: WorkerContext,
    pipeline: SignalPipeline,
    stops: TrailingStopManager,
    stats: WorkerStats,
}

impl SymbolWorker {
    pub fn new(symbol: impl Into<String>, ctx: WorkerContext) -> Self {
        let symbol = symbol.into();
        Self {
            pipeline: SignalPipeline::new(symbol.clone(), ctx.config.pipeline.clone()),
            stops: TrailingStopManager::new(ctx.config.risk.trailing.clone()),
            symbol,
            ctx,
            stats: WorkerStats::default(),
        }
    }

    pub fn spawn(self, rx: mpsc::Receiver<IngestedBar>) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run(rx))
    }

    /// Process bars until the channel closes, then finish any decision
    /// still pending for the last bar.
    pub async fn run(mut self, mut rx: mpsc::Receiver<IngestedBar>) -> WorkerStats {
        info!(symbol = %self.symbol, "Symbol worker started");
        let mut in_flight: Option<InFlight> = None;

        loop {
            tokio::select! {
                biased;

                next = rx.recv() => {
                    let Some(ingested) = next else { break };
                    if let Some(abandoned) = in_flight.take() {
                        self.supersede(abandoned, &ingested.bar).await;
                    }
                    in_flight = self.on_bar(ingested).await;
                }

                progress = resolve(&mut in_flight) => match progress {
                    Progress::Consensus(consensus) => {
                        in_flight = match in_flight.take() {
                            Some(InFlight {
                                signal_id,
                                stage: Stage::Consensus { signal, confirmation, .. },
                            }) => Some(InFlight {
                                signal_id,
                                stage: Stage::Sizing(self.request_sizing(signal, confirmation, consensus)),
                            }),
                            other => other,
                        };
                    }
                    Progress::Decided(outcome) => {
                        in_flight = None;
                        self.on_decision(outcome).await;
                    }
                },
            }
        }

        if let Some(pending) = in_flight.take() {
            let outcome = match pending.stage {
                Stage::Consensus {
                    signal,
                    confirmation,
                    consensus,
                } => {
                    let consensus = consensus.await;
                    self.request_sizing(signal, confirmation, consensus).await
                }
                Stage::Sizing(decision) => decision.await,
            };
            self.on_decision(outcome).await;
        }

        info!(
            symbol = %self.symbol,
            bars = self.stats.bars,
            decisions = self.stats.decisions,
            approved = self.stats.approved,
            "Symbol worker stopped"
        );
        self.stats
    }

    async fn on_bar(&mut self, ingested: IngestedBar) -> Option<InFlight> {
        let bar = ingested.bar;
        self.stats.bars += 1;
        debug!(symbol = %self.symbol, kind = ?ingested.kind, close = %bar.close, "Bar");

        // exits are managed whatever the risk mode
        self.manage_stops(&bar).await;
        if let Err(e) = self.ctx.risk.mark(bar.clone()).await {
            warn!(symbol = %self.symbol, error = %e, "Failed to mark position");
        }

        let evaluation = match self.pipeline.process(&bar) {
            Ok(Some(evaluation)) => evaluation,
            Ok(None) => return None,
            Err(error) => {
                self.stats.rejected_bars += 1;
                warn!(symbol = %self.symbol, error = %error, "Bar rejected by pipeline");
                self.ctx.events.emit(EngineEvent::BarRejected {
                    symbol: self.symbol.clone(),
                    timeframe: bar.timeframe,
                    error,
                });
                return None;
            }
        };

        let signal = evaluation.snapshot.signal.clone();
        if signal.direction != SignalDirection::Neutral {
            self.ctx.events.emit(EngineEvent::Signal(signal.clone()));
        }
        match &evaluation.volume {
            Some(Ok(confirmation)) => self.ctx.events.emit(EngineEvent::VolumeChecked(confirmation.clone())),
            Some(Err(error)) => self.ctx.events.emit(EngineEvent::VolumeUnavailable {
                signal_id: signal.id,
                error: error.clone(),
            }),
            None => {}
        }

        if !evaluation.is_candidate() {
            return None;
        }
        let confirmation = evaluation.confirmation()?.clone();
        self.stats.candidates += 1;
        info!(
            symbol = %self.symbol,
            direction = ?signal.direction,
            strength = signal.strength,
            relative_volume = confirmation.relative_volume,
            "Candidate signal, checking consensus"
        );

        let validator = self.ctx.validator.clone();
        let pending = signal.clone();
        Some(InFlight {
            signal_id: signal.id,
            stage: Stage::Consensus {
                signal,
                confirmation,
                consensus: Box::pin(async move { validator.validate_signal(&pending).await }),
            },
        })
    }

    fn request_sizing(
        &self,
        signal: Signal,
        confirmation: VolumeConfirmation,
        consensus: ConsensusResult,
    ) -> DecisionFuture {
        self.ctx.events.emit(EngineEvent::Consensus(consensus.clone()));
        let risk = self.ctx.risk.clone();
        Box::pin(async move { risk.submit(signal, confirmation, consensus).await })
    }

    async fn supersede(&mut self, abandoned: InFlight, bar: &MarketBar) {
        self.stats.superseded += 1;
        warn!(symbol = %self.symbol, signal_id = %abandoned.signal_id, "Newer bar arrived, abandoning decision");
        self.ctx.events.emit(EngineEvent::Superseded {
            symbol: self.symbol.clone(),
            signal_id: abandoned.signal_id,
            at: bar.timestamp,
        });

        // sizing may already be booked; wait for the verdict and undo it
        if let Stage::Sizing(decision) = abandoned.stage {
            match decision.await {
                Ok(decision) if decision.approved => self.release(decision.id).await,
                Ok(_) => {}
                Err(e) => error!(symbol = %self.symbol, error = %e, "Abandoned sizing request failed"),
            }
        }
    }

    /// Free the risk booked for an entry that will never execute
    async fn release(&mut self, position_id: Uuid) {
        match self.ctx.risk.discard(position_id).await {
            Ok(Some(_)) => debug!(symbol = %self.symbol, position_id = %position_id, "Released unexecuted entry"),
            Ok(None) => {}
            Err(e) => error!(symbol = %self.symbol, error = %e, "Failed to release unexecuted entry"),
        }
    }

    async fn on_decision(&mut self, outcome: anyhow::Result<PositionSizingDecision>) {
        let decision = match outcome {
            Ok(decision) => decision,
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "Sizing request failed");
                return;
            }
        };

        self.stats.decisions += 1;
        self.ctx.events.emit(EngineEvent::Decision(decision.clone()));

        if !decision.approved {
            if let Some(reason) = &decision.rejection {
                info!(symbol = %self.symbol, reason = %reason, "Signal rejected");
            }
            return;
        }

        self.stats.approved += 1;
        if let Err(e) = self.stops.register(&decision) {
            warn!(symbol = %self.symbol, error = %e, "Could not track stop");
        }

        let position_id = decision.id;
        if !self.execute(ExecutionCommand::Enter(decision)).await {
            // never reached the broker
            self.stops.remove(&self.symbol);
            self.release(position_id).await;
        }
    }

    async fn manage_stops(&mut self, bar: &MarketBar) {
        for event in self.stops.on_bar(bar) {
            self.stats.stop_events += 1;
            self.ctx.events.emit(EngineEvent::Stop(event.clone()));

            let update = match &event.transition {
                StopTransition::Activated => Ok(()),
                StopTransition::Moved { to, .. } => self.ctx.risk.update_stop(&self.symbol, *to).await,
                StopTransition::Triggered { exit_price } => {
                    self.stats.exits += 1;
                    self.ctx
                        .risk
                        .close_position(&self.symbol, *exit_price, event.timestamp)
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = update {
                error!(symbol = %self.symbol, error = %e, "Failed to apply stop transition to risk state");
            }

            if let Some(command) = ExecutionCommand::from_stop_event(&event) {
                self.execute(command).await;
            }
        }
    }

    /// Hand a command to the sink within the configured timeout
    async fn execute(&mut self, command: ExecutionCommand) -> bool {
        let timeout = Duration::from_millis(self.ctx.config.channels.execution_timeout_ms);
        let sink = self.ctx.sink.name().to_string();

        match tokio::time::timeout(timeout, self.ctx.sink.submit(command)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.stats.execution_failures += 1;
                error!(symbol = %self.symbol, sink = %sink, error = %e, "Execution sink rejected command");
                false
            }
            Err(_) => {
                self.stats.execution_failures += 1;
                error!(symbol = %self.symbol, sink = %sink, timeout_ms = timeout.as_millis() as u64, "Execution sink timed out");
                false
            }
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Drive the pending decision one stage, or wait forever when there is none
async fn resolve(in_flight: &mut Option<InFlight>) -> Progress {
    match in_flight {
        Some(InFlight {
            stage: Stage::Consensus { consensus, .. },
            ..
        }) => Progress::Consensus(consensus.await),
        Some(InFlight {
            stage: Stage::Sizing(decision),
            ..
        }) => Progress::Decided(decision.await),
        None => std::future::pending().await,
    }
}
