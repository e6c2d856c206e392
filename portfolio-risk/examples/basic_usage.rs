//! Example usage of the risk & position sizing layer

use std::time::Duration;

use common::{IndicatorValues, MarketBar, Signal, SignalDirection, Timeframe, Utc};
use portfolio_risk::{AccountSnapshot, RiskConfig, RiskManager, TrailingStopManager};
use rust_decimal_macros::dec;
use signal_generation::{ConsensusResult, VolumeConfirmation};

fn main() -> anyhow::Result<()> {
    println!("=== Risk & Position Sizing Example ===\n");

    // Example 1: Create a risk manager
    println!("Example 1: Creating Risk Manager");
    let config = RiskConfig::default();
    let mut manager = RiskManager::with_config(config.clone(), dec!(25000), Utc::now())?;
    println!("✓ Manager created with $25,000 equity\n");

    // Example 2: Size a confirmed buy signal
    println!("Example 2: Sizing a Confirmed Signal");
    let values = IndicatorValues {
        rsi: 27.5,
        stoch_k: 6.0,
        stoch_d: 3.5,
        atr: 850.0,
        volatility_ratio: 1.2,
        dynamic_lower_band: 33.0,
        dynamic_upper_band: 67.0,
        ema_fast: 61_200.0,
        ema_slow: 61_650.0,
    };
    let signal = Signal::new("BTCUSDT", Timeframe::M5, SignalDirection::Buy, 0.82, dec!(61000), values, Utc::now());
    let confirmation = VolumeConfirmation {
        signal_id: signal.id,
        symbol: signal.symbol.clone(),
        confirmed: true,
        relative_volume: 2.7,
        volume_zscore: 3.1,
        threshold: 1.2,
        reason: None,
        levels: Vec::new(),
    };
    let consensus = ConsensusResult {
        signal_id: signal.id,
        symbol: signal.symbol.clone(),
        direction: signal.direction,
        verdicts: Vec::new(),
        valid_count: 3,
        aligned_count: 2,
        consensus_achieved: true,
        agreement_ratio: 2.0 / 3.0,
        weighted_agreement: 2.0 / 3.0,
        elapsed: Duration::from_millis(12),
        failure: None,
    };

    let decision = manager.submit(&signal, &confirmation, &consensus);
    println!("  Approved: {}", decision.approved);
    println!("  Quantity: {}", decision.quantity);
    println!("  Stop: {}  Target: {}", decision.stop_price, decision.take_profit);
    println!("  Risk: ${:.2}\n", decision.risk_amount);

    // Example 3: Trail the stop as price moves
    println!("Example 3: Trailing Stop");
    let mut stops = TrailingStopManager::new(config.trailing.clone());
    stops.register(&decision)?;
    for (i, close) in [dec!(61400), dec!(62300), dec!(63100)].into_iter().enumerate() {
        let bar = MarketBar {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M5,
            open: close - dec!(100),
            high: close + dec!(150),
            low: close - dec!(200),
            close,
            volume: 1200,
            timestamp: Utc::now() + chrono::Duration::minutes(5 * (i as i64 + 1)),
        };
        manager.on_bar(&bar);
        for event in stops.on_bar(&bar) {
            println!("  {:?} -> stop {}", event.transition, event.order.stop_price);
            manager.update_stop(&event.order.symbol, event.order.stop_price);
        }
    }
    println!();

    // Example 4: Drawdown halts new entries
    println!("Example 4: Drawdown Halt");
    manager.apply_account(AccountSnapshot {
        equity: dec!(21000),
        timestamp: Utc::now(),
    });
    let snapshot = manager.snapshot();
    println!("  Drawdown: {:.2}%", snapshot.drawdown * 100.0);
    println!("  Mode: {:?}", snapshot.mode);
    println!("  Accepting entries: {}\n", snapshot.accepting_entries());

    println!("=== Example Complete ===");
    Ok(())
}
