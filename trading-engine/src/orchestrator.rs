//! Orchestrator - routes bars to symbol workers and owns engine lifecycle
//!
//! The Orchestrator manages:
//! - Bar ingestion and ordering
//! - Lazy spawning of one worker per symbol on its first primary bar
//! - Feeding higher-timeframe bars to the bar-derived trend source
//! - Control commands (account snapshots, correlation overrides, status)
//! - Graceful shutdown, waiting for every worker and the risk actor

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{MarketBar, Utc};
use data_ingestion::{BarBus, BarFeed, BarIngestor, IngestStats, IngestedBar, PublishOutcome};
use portfolio_risk::{AccountSnapshot, RiskManager, RiskMode, RiskSnapshot};
use serde::{Deserialize, Serialize};
use signal_generation::{BarTrendSource, ConsensusValidator, TrendSource};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventPublisher};
use crate::execution::ExecutionSink;
use crate::risk_actor::RiskActor;
use crate::worker::{SymbolWorker, WorkerContext, WorkerStats};

/// Commands to control the orchestrator
pub enum ControlCommand {
    ApplyAccount {
        snapshot: AccountSnapshot,
        respond_to: oneshot::Sender<Option<(RiskMode, RiskMode)>>,
    },
    SetCorrelation {
        a: String,
        b: String,
        correlation: f64,
    },
    GetStatus {
        respond_to: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub bars_received: u64,
    pub routed: u64,
    pub trend_bars: u64,
    /// Worker saturated or gone
    pub dropped: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub symbols: Vec<String>,
    pub router: RouterStats,
    pub ingest: IngestStats,
    pub risk: Option<RiskSnapshot>,
}

/// What the engine did, returned once it has stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub router: RouterStats,
    pub ingest: IngestStats,
    pub workers: HashMap<String, WorkerStats>,
    pub risk: RiskSnapshot,
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    ingestor: BarIngestor,
    bus: BarBus,
    /// Present when trends are derived from fed bars
    bar_trend: Option<Arc<BarTrendSource>>,
    ctx: WorkerContext,
    risk_task: JoinHandle<RiskSnapshot>,
    workers: HashMap<String, JoinHandle<WorkerStats>>,
    stats: RouterStats,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
}

impl Orchestrator {
    /// Engine whose consensus trends come from the higher-timeframe bars in
    /// the feed. Must be called inside a Tokio runtime.
    pub fn new(config: EngineConfig, sink: Arc<dyn ExecutionSink>) -> Result<Self> {
        let trend = Arc::new(BarTrendSource::new(config.trend.clone()));
        let source: Arc<dyn TrendSource> = trend.clone();
        Self::build(config, sink, source, Some(trend))
    }

    /// Engine using an external trend source; higher-timeframe bars in the
    /// feed are ignored
    pub fn with_trend_source(
        config: EngineConfig,
        sink: Arc<dyn ExecutionSink>,
        source: Arc<dyn TrendSource>,
    ) -> Result<Self> {
        Self::build(config, sink, source, None)
    }

    fn build(
        config: EngineConfig,
        sink: Arc<dyn ExecutionSink>,
        source: Arc<dyn TrendSource>,
        bar_trend: Option<Arc<BarTrendSource>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let events = EventPublisher::new(config.channels.event_capacity);
        let manager = RiskManager::with_config(config.risk.clone(), config.starting_equity, Utc::now())?;
        let (risk, risk_task) = RiskActor::spawn(manager, config.channels.risk_capacity, events.clone());
        let (control_tx, control_rx) = mpsc::channel(config.channels.control_capacity);

        info!(
            primary = %config.primary_timeframe,
            equity = %config.starting_equity,
            sink = sink.name(),
            "Engine initialised"
        );

        Ok(Self {
            bus: BarBus::new(
                config.channels.bar_capacity,
                Duration::from_millis(config.channels.bar_send_timeout_ms),
            ),
            ctx: WorkerContext {
                validator: ConsensusValidator::new(config.consensus.clone(), source),
                config: config.clone(),
                risk,
                sink,
                events,
            },
            config,
            ingestor: BarIngestor::new(),
            bar_trend,
            risk_task,
            workers: HashMap::new(),
            stats: RouterStats::default(),
            control_tx,
            control_rx,
        })
    }

    /// Get a handle to send control commands
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Observe engine events; subscribe before `run` to see everything
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// Run until the feed is exhausted or a shutdown is requested
    pub async fn run<F: BarFeed>(mut self, mut feed: F) -> Result<EngineReport> {
        info!(feed = feed.name(), "Engine running");
        let mut feed_error = None;

        loop {
            tokio::select! {
                Some(cmd) = self.control_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                next = feed.next_bar() => match next {
                    Ok(Some(bar)) => self.route(bar).await,
                    Ok(None) => {
                        info!(feed = feed.name(), "Feed exhausted");
                        break;
                    }
                    Err(e) => {
                        error!(feed = feed.name(), error = %e, "Feed failed");
                        feed_error = Some(e);
                        break;
                    }
                },
            }
        }

        let report = self.shutdown().await?;
        match feed_error {
            Some(e) => Err(e.context("Bar feed failed")),
            None => Ok(report),
        }
    }

    /// Handle a control command; `false` stops the engine
    async fn handle_command(&mut self, cmd: ControlCommand) -> bool {
        match cmd {
            ControlCommand::ApplyAccount { snapshot, respond_to } => {
                match self.ctx.risk.apply_account(snapshot).await {
                    Ok(transition) => {
                        let _ = respond_to.send(transition);
                    }
                    Err(e) => error!(error = %e, "Failed to apply account snapshot"),
                }
            }

            ControlCommand::SetCorrelation { a, b, correlation } => {
                if let Err(e) = self.ctx.risk.set_correlation(&a, &b, correlation).await {
                    error!(error = %e, "Failed to set correlation override");
                }
            }

            ControlCommand::GetStatus { respond_to } => {
                let mut symbols: Vec<String> = self.workers.keys().cloned().collect();
                symbols.sort();
                let status = EngineStatus {
                    symbols,
                    router: self.stats.clone(),
                    ingest: self.ingestor.stats().clone(),
                    risk: self.ctx.risk.snapshot().await.ok(),
                };
                let _ = respond_to.send(status);
            }

            ControlCommand::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    async fn route(&mut self, bar: MarketBar) {
        self.stats.bars_received += 1;
        let raw_symbol = bar.symbol.clone();
        let timeframe = bar.timeframe;

        let ingested = match self.ingestor.ingest(bar) {
            Ok(ingested) => ingested,
            Err(error) => {
                let symbol = error.symbol().unwrap_or(raw_symbol.as_str()).to_string();
                self.ctx.events.emit(EngineEvent::BarRejected {
                    symbol,
                    timeframe,
                    error,
                });
                return;
            }
        };

        if timeframe == self.config.primary_timeframe {
            self.dispatch(ingested).await;
        } else if timeframe > self.config.primary_timeframe {
            match &self.bar_trend {
                Some(trend) => match trend.ingest(&ingested.bar).await {
                    Ok(_) => self.stats.trend_bars += 1,
                    Err(e) => warn!(symbol = %ingested.bar.symbol, timeframe = %timeframe, error = %e, "Trend bar rejected"),
                },
                None => self.stats.ignored += 1,
            }
        } else {
            self.stats.ignored += 1;
            debug!(symbol = %ingested.bar.symbol, timeframe = %timeframe, "Ignoring bar below primary timeframe");
        }
    }

    async fn dispatch(&mut self, ingested: IngestedBar) {
        let symbol = ingested.bar.symbol.clone();
        if !self.bus.has_route(&symbol) {
            self.spawn_worker(&symbol);
        }

        match self.bus.publish(ingested).await {
            PublishOutcome::Delivered => self.stats.routed += 1,
            PublishOutcome::TimedOut | PublishOutcome::NoRoute => self.stats.dropped += 1,
            PublishOutcome::Closed => {
                // the worker died; the next bar starts a fresh one
                self.stats.dropped += 1;
                if let Some(task) = self.workers.remove(&symbol) {
                    match task.await {
                        Ok(stats) => warn!(symbol = %symbol, bars = stats.bars, "Worker exited early"),
                        Err(e) => error!(symbol = %symbol, error = %e, "Worker failed"),
                    }
                }
            }
        }
    }

    fn spawn_worker(&mut self, symbol: &str) {
        if let Some(stale) = self.workers.remove(symbol) {
            stale.abort();
        }
        let rx = self.bus.register(symbol);
        let worker = SymbolWorker::new(symbol, self.ctx.clone());
        self.workers.insert(symbol.to_string(), worker.spawn(rx));
        info!(symbol = %symbol, workers = self.workers.len(), "Spawned symbol worker");
    }

    /// Close every route, let workers drain, then stop the risk actor
    async fn shutdown(self) -> Result<EngineReport> {
        let Orchestrator {
            mut bus,
            ingestor,
            ctx,
            risk_task,
            workers,
            stats,
            ..
        } = self;

        info!(workers = workers.len(), "Shutting down engine");
        bus.close_all();

        let joined = futures::future::join_all(
            workers
                .into_iter()
                .map(|(symbol, task)| async move { (symbol, task.await) }),
        )
        .await;

        let mut worker_stats = HashMap::new();
        for (symbol, result) in joined {
            match result {
                Ok(stats) => {
                    worker_stats.insert(symbol, stats);
                }
                Err(e) => error!(symbol = %symbol, error = %e, "Worker failed during shutdown"),
            }
        }

        // last risk handle; the actor stops once it is gone
        drop(ctx);
        let risk = risk_task.await?;

        info!(
            bars = stats.bars_received,
            symbols = worker_stats.len(),
            equity = risk.equity,
            mode = ?risk.mode,
            "Engine stopped"
        );

        Ok(EngineReport {
            router: stats,
            ingest: ingestor.stats().clone(),
            workers: worker_stats,
            risk,
        })
    }
}

/// Handle for controlling a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl EngineHandle {
    /// Feed a broker equity snapshot; returns the risk mode change, if any
    pub async fn apply_account(&self, snapshot: AccountSnapshot) -> Result<Option<(RiskMode, RiskMode)>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::ApplyAccount {
                snapshot,
                respond_to: tx,
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send account snapshot: {}", e))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Account update dropped"))
    }

    /// Inject an externally computed correlation between two symbols
    pub async fn set_correlation(&self, a: &str, b: &str, correlation: f64) -> Result<()> {
        self.tx
            .send(ControlCommand::SetCorrelation {
                a: a.to_string(),
                b: b.to_string(),
                correlation,
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send correlation override: {}", e))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::GetStatus { respond_to: tx })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get status: {}", e))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Status response channel closed"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ControlCommand::Shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send shutdown command: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::LoggingExecutionSink;
    use data_ingestion::{SyntheticFeed, SyntheticFeedConfig};
    use common::Timeframe;

    fn synthetic(steps: usize) -> SyntheticFeed {
        let config = SyntheticFeedConfig {
            symbols: vec!["AAA".to_string(), "BBB".to_string()],
            primary_timeframe: Timeframe::M1,
            aggregate_timeframes: vec![Timeframe::M15, Timeframe::H1],
            max_steps: Some(steps),
            ..Default::default()
        };
        SyntheticFeed::new(config, Utc::now())
    }

    #[tokio::test]
    async fn test_synthetic_feed_runs_to_completion() {
        let orchestrator = Orchestrator::new(EngineConfig::default(), Arc::new(LoggingExecutionSink)).unwrap();
        let report = orchestrator.run(synthetic(50)).await.unwrap();

        // 2 symbols x (1 primary + 2 aggregate) bars x 50 steps
        assert_eq!(report.router.bars_received, 300);
        assert_eq!(report.router.routed, 100);
        assert_eq!(report.router.trend_bars, 200);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.workers["AAA"].bars, 50);
        assert_eq!(report.ingest.invalid, 0);
    }

    #[tokio::test]
    async fn test_status_and_shutdown_via_handle() {
        let orchestrator = Orchestrator::new(EngineConfig::default(), Arc::new(LoggingExecutionSink)).unwrap();
        let handle = orchestrator.handle();

        let mut feed_config = SyntheticFeedConfig {
            symbols: vec!["AAA".to_string()],
            aggregate_timeframes: Vec::new(),
            ..Default::default()
        };
        feed_config.pace_ms = 5;
        let engine = tokio::spawn(orchestrator.run(SyntheticFeed::new(feed_config, Utc::now())));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.symbols, vec!["AAA".to_string()]);
        assert!(status.router.bars_received > 0);
        assert_eq!(status.risk.unwrap().mode, RiskMode::Normal);

        handle.shutdown().await.unwrap();
        let report = engine.await.unwrap().unwrap();
        assert_eq!(report.workers.len(), 1);
        assert!(report.workers["AAA"].bars > 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.starting_equity = common::Decimal::ZERO;
        assert!(Orchestrator::new(config, Arc::new(LoggingExecutionSink)).is_err());
    }
}
