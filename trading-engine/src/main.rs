use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use data_ingestion::SyntheticFeed;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use trading_engine::{EngineConfig, EngineEvent, LoggingExecutionSink, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--print-config") {
        println!("{}", EngineConfig::default().to_toml()?);
        return Ok(());
    }

    let path = arg.map(PathBuf::from);
    let config = EngineConfig::load(path.as_deref())?;

    info!("🚀 Starting signal quality & risk engine");

    let feed = SyntheticFeed::new(config.feed.clone(), Utc::now());
    let orchestrator = Orchestrator::new(config, Arc::new(LoggingExecutionSink))?;
    let handle = orchestrator.handle();
    let mut events = orchestrator.subscribe();

    let observer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Decision(decision)) if !decision.approved => {
                    if let Some(reason) = decision.rejection {
                        info!(symbol = %decision.symbol, reason = %reason, "Decision rejected");
                    }
                }
                Ok(EngineEvent::RiskModeChanged { from, to }) => {
                    warn!(from = ?from, to = ?to, "⚠️ Risk mode changed");
                }
                Ok(EngineEvent::PositionClosed(closed)) => {
                    info!(symbol = %closed.position.symbol, pnl = %closed.realized_pnl, "Position closed");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event observer lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut engine = tokio::spawn(orchestrator.run(feed));

    let report = tokio::select! {
        joined = &mut engine => joined??,
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutting down gracefully...");
            handle.shutdown().await?;
            engine.await??
        }
    };
    observer.await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
