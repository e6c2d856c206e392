use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::{Decimal, EngineError, MarketBar, SignalDirection, Timeframe};
use data_ingestion::ChannelFeed;
use portfolio_risk::{AccountSnapshot, PositionSizingDecision, RejectionReason, RiskMode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use signal_generation::{ConsensusResult, StaticTrendSource, TimeframeStatus, TrendDirection};
use tokio::sync::{broadcast, mpsc};
use trading_engine::{
    ChannelExecutionSink, EngineConfig, EngineEvent, EngineHandle, EngineReport, ExecutionCommand, Orchestrator,
};

const TREND_TIMEFRAMES: [Timeframe; 3] = [Timeframe::M15, Timeframe::H1, Timeframe::H4];

fn price(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap().round_dp(4)
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn bar(symbol: &str, minute: i64, open: f64, close: f64, volume: u64) -> MarketBar {
    MarketBar {
        symbol: symbol.to_string(),
        timeframe: Timeframe::M1,
        open: price(open),
        high: price(open.max(close) + 0.2),
        low: price(open.min(close) - 0.2),
        close: price(close),
        volume,
        timestamp: start() + chrono::Duration::minutes(minute),
    }
}

/// Zigzag climb then a stepped decline. The last bar is an oversold
/// stochastic cross carrying a 3x volume spike.
fn reversal_bars(symbol: &str) -> Vec<MarketBar> {
    let mut closes = Vec::new();
    let mut p = 100.0;
    for i in 0..30 {
        p += if i % 2 == 0 { 1.0 } else { -0.5 };
        closes.push(p);
    }
    for i in 0..12 {
        p += if i % 3 != 2 { -1.5 } else { 0.4 };
        closes.push(p);
    }

    let last = closes.len() - 1;
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let o = if i == 0 { c } else { closes[i - 1] };
            let volume = if i == last { 3_000 } else { 1_000 };
            bar(symbol, i as i64, o, c, volume)
        })
        .collect()
}

/// Bars of several symbols interleaved in time order
fn interleave(series: Vec<Vec<MarketBar>>) -> Vec<MarketBar> {
    let mut bars: Vec<MarketBar> = series.into_iter().flatten().collect();
    bars.sort_by_key(|b| b.timestamp);
    bars
}

fn trends(symbols: &[&str], direction: TrendDirection) -> StaticTrendSource {
    let mut source = StaticTrendSource::new();
    for symbol in symbols {
        for tf in TREND_TIMEFRAMES {
            source = source.with_trend(symbol, tf, direction);
        }
    }
    source
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.channels.event_capacity = 16_384;
    config
}

struct Engine {
    handle: EngineHandle,
    bars: mpsc::Sender<MarketBar>,
    events: broadcast::Receiver<EngineEvent>,
    commands: mpsc::Receiver<ExecutionCommand>,
    task: tokio::task::JoinHandle<anyhow::Result<EngineReport>>,
}

impl Engine {
    fn start(source: StaticTrendSource) -> Self {
        let (sink, commands) = ChannelExecutionSink::new(256);
        let orchestrator = Orchestrator::with_trend_source(test_config(), Arc::new(sink), Arc::new(source)).unwrap();
        let handle = orchestrator.handle();
        let events = orchestrator.subscribe();
        let (bars, feed) = ChannelFeed::new(4_096);
        let task = tokio::spawn(orchestrator.run(feed));
        Self {
            handle,
            bars,
            events,
            commands,
            task,
        }
    }

    async fn feed(&self, bars: Vec<MarketBar>) {
        for bar in bars {
            self.bars.send(bar).await.unwrap();
        }
    }

    /// Close the feed, wait for the engine to drain and collect what it said
    async fn finish(self) -> (EngineReport, Vec<EngineEvent>, Vec<ExecutionCommand>) {
        let Engine {
            bars,
            mut events,
            mut commands,
            task,
            ..
        } = self;
        drop(bars);
        let report = task.await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let mut sent = Vec::new();
        while let Ok(command) = commands.try_recv() {
            sent.push(command);
        }
        (report, seen, sent)
    }
}

fn decisions(events: &[EngineEvent]) -> Vec<&PositionSizingDecision> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Decision(decision) => Some(decision),
            _ => None,
        })
        .collect()
}

fn consensus_results(events: &[EngineEvent]) -> Vec<&ConsensusResult> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Consensus(result) => Some(result),
            _ => None,
        })
        .collect()
}

fn entries(commands: &[ExecutionCommand]) -> Vec<&PositionSizingDecision> {
    commands
        .iter()
        .filter_map(|c| match c {
            ExecutionCommand::Enter(decision) => Some(decision),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_confirmed_buy_reaches_execution() {
    let engine = Engine::start(trends(&["BTCUSDT"], TrendDirection::Up));
    engine.feed(reversal_bars("BTCUSDT")).await;
    let (report, events, commands) = engine.finish().await;

    let confirmed = events.iter().any(|e| {
        matches!(e, EngineEvent::VolumeChecked(c) if c.confirmed && (c.relative_volume - 3.0).abs() < 1e-9)
    });
    assert!(confirmed);

    let consensus = consensus_results(&events);
    assert_eq!(consensus.len(), 1);
    assert!(consensus[0].consensus_achieved);
    assert_eq!(consensus[0].aligned_count, 3);

    let entries = entries(&commands);
    assert_eq!(entries.len(), 1);
    let entry = entries[0];
    assert!(entry.approved);
    assert!(entry.quantity > Decimal::ZERO);
    assert!(entry.stop_price < entry.entry_price);
    assert!(entry.take_profit > entry.entry_price);
    assert!(entry.risk_amount <= dec!(200));

    assert_eq!(report.workers["BTCUSDT"].approved, 1);
    assert_eq!(report.risk.open_positions, 1);
}

#[tokio::test]
async fn test_drawdown_halt_rejects_next_ten_candidates() {
    let symbols: Vec<String> = (0..10).map(|i| format!("SYM{}", i)).collect();
    let names: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let engine = Engine::start(trends(&names, TrendDirection::Up));

    let transition = engine
        .handle
        .apply_account(AccountSnapshot {
            equity: dec!(8400),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(transition, Some((RiskMode::Normal, RiskMode::Halted)));

    engine
        .feed(interleave(names.iter().map(|s| reversal_bars(s)).collect()))
        .await;
    let (report, events, commands) = engine.finish().await;

    let decisions = decisions(&events);
    assert_eq!(decisions.len(), 10);
    for decision in decisions {
        assert!(!decision.approved);
        assert_eq!(decision.quantity, Decimal::ZERO);
        assert!(matches!(decision.rejection, Some(RejectionReason::DrawdownHalt { .. })));
    }
    assert!(entries(&commands).is_empty());
    assert_eq!(report.risk.mode, RiskMode::Halted);
}

#[tokio::test]
async fn test_correlated_second_signal_is_reduced_or_rejected() {
    let engine = Engine::start(trends(&["AAA", "BBB"], TrendDirection::Up));
    engine.handle.set_correlation("AAA", "BBB", 0.85).await.unwrap();
    // status round-trips through the risk actor after the override
    engine.handle.status().await.unwrap();

    engine
        .feed(interleave(vec![reversal_bars("AAA"), reversal_bars("BBB")]))
        .await;
    let (_, events, _) = engine.finish().await;

    let decisions = decisions(&events);
    assert_eq!(decisions.len(), 2);
    let first = decisions.iter().find(|d| d.approved && d.correlation_penalty == 1.0);
    let second = decisions
        .iter()
        .find(|d| !d.approved || d.correlation_penalty < 1.0);
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.symbol, second.symbol);
    if second.approved {
        assert_eq!(second.correlation_penalty, 0.5);
        assert!(second.risk_amount < first.risk_amount);
    }
}

#[tokio::test]
async fn test_timed_out_timeframes_leave_too_few_for_consensus() {
    let source = trends(&["ETHUSDT"], TrendDirection::Up)
        .with_delay(Timeframe::H1, Duration::from_millis(300))
        .with_delay(Timeframe::H4, Duration::from_millis(300));
    let engine = Engine::start(source);
    engine.feed(reversal_bars("ETHUSDT")).await;
    let (_, events, commands) = engine.finish().await;

    let consensus = consensus_results(&events);
    assert_eq!(consensus.len(), 1);
    let result = consensus[0];
    assert!(!result.consensus_achieved);
    assert_eq!(result.valid_count, 1);
    assert!(matches!(result.failure, Some(EngineError::InsufficientTimeframes { .. })));
    let timed_out = result
        .verdicts
        .iter()
        .filter(|v| v.status == TimeframeStatus::TimedOut)
        .count();
    assert_eq!(timed_out, 2);

    let decisions = decisions(&events);
    assert_eq!(decisions.len(), 1);
    assert!(matches!(
        decisions[0].rejection,
        Some(RejectionReason::ConsensusNotAchieved { .. })
    ));
    assert!(entries(&commands).is_empty());
}

#[tokio::test]
async fn test_bad_bars_on_one_symbol_do_not_affect_another() {
    let engine = Engine::start(trends(&["GOOD", "BAD"], TrendDirection::Up));

    let mut bad = reversal_bars("BAD");
    // out of order
    bad.insert(20, bar("BAD", 3, 100.0, 100.5, 1_000));
    // low above high
    let mut broken = bar("BAD", 40, 100.0, 100.5, 1_000);
    broken.low = price(120.0);
    bad.insert(30, broken);

    // one stream after the other; sorting would hide the disorder
    engine
        .feed(reversal_bars("GOOD").into_iter().chain(bad).collect())
        .await;
    let (report, events, commands) = engine.finish().await;

    let rejected: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::BarRejected { symbol, .. } => Some(symbol.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(rejected, vec!["BAD", "BAD"]);
    assert_eq!(report.ingest.out_of_order, 1);
    assert_eq!(report.ingest.invalid, 1);

    let entries = entries(&commands);
    assert!(entries.iter().any(|d| d.symbol == "GOOD"));
    assert_eq!(report.workers["GOOD"].bars, 42);
    assert_eq!(report.workers["BAD"].bars, 42);
}

#[tokio::test]
async fn test_flat_market_produces_no_signals() {
    let engine = Engine::start(trends(&["FLAT"], TrendDirection::Up));
    engine
        .feed((0..30).map(|i| bar("FLAT", i, 100.0, 100.0, 1_000)).collect())
        .await;
    let (report, events, commands) = engine.finish().await;

    let signals = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Signal(s) if s.direction != SignalDirection::Neutral))
        .count();
    assert_eq!(signals, 0);
    assert!(decisions(&events).is_empty());
    assert!(commands.is_empty());
    assert_eq!(report.workers["FLAT"].candidates, 0);
}
