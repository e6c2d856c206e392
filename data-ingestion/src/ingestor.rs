use std::collections::HashMap;

use common::{BarKind, EngineError, MarketBar, PeriodClock, Timeframe};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A validated bar together with its period classification
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedBar {
    pub bar: MarketBar,
    pub kind: BarKind,
}

/// Counters for observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub opened: u64,
    pub updated: u64,
    pub out_of_order: u64,
    pub invalid: u64,
}

/// Normalises raw bars into ordered per-stream sequences.
///
/// One period clock per (symbol, timeframe). Rejected bars are counted,
/// logged and dropped; they never advance the stream.
#[derive(Debug, Default)]
pub struct BarIngestor {
    clocks: HashMap<(String, Timeframe), PeriodClock>,
    stats: IngestStats,
}

impl BarIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, mut bar: MarketBar) -> Result<IngestedBar, EngineError> {
        bar.symbol = normalize_symbol(&bar.symbol);

        if let Err(e) = bar.validate() {
            self.stats.invalid += 1;
            warn!(symbol = %bar.symbol, timeframe = %bar.timeframe, error = %e, "Dropping invalid bar");
            return Err(e);
        }

        let clock = self
            .clocks
            .entry((bar.symbol.clone(), bar.timeframe))
            .or_default();

        match clock.classify(&bar) {
            Ok(kind) => {
                match kind {
                    BarKind::Opened => self.stats.opened += 1,
                    BarKind::Updated => self.stats.updated += 1,
                }
                debug!(symbol = %bar.symbol, timeframe = %bar.timeframe, kind = ?kind, "Bar ingested");
                Ok(IngestedBar { bar, kind })
            }
            Err(e) => {
                self.stats.out_of_order += 1;
                warn!(symbol = %bar.symbol, timeframe = %bar.timeframe, error = %e, "Dropping out-of-order bar");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Number of (symbol, timeframe) streams seen so far
    pub fn stream_count(&self) -> usize {
        self.clocks.len()
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bar(symbol: &str, timeframe: Timeframe, minute: u32) -> MarketBar {
        MarketBar {
            symbol: symbol.to_string(),
            timeframe,
            open: dec!(10),
            high: dec!(11),
            low: dec!(9),
            close: dec!(10.5),
            volume: 500,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 14, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let mut ingestor = BarIngestor::new();

        assert_eq!(ingestor.ingest(bar("sol", Timeframe::M1, 5)).unwrap().kind, BarKind::Opened);
        // Older bar on another timeframe is a different stream
        assert_eq!(ingestor.ingest(bar("SOL", Timeframe::M5, 0)).unwrap().kind, BarKind::Opened);
        // Older bar on another symbol is fine too
        assert_eq!(ingestor.ingest(bar("ADA", Timeframe::M1, 1)).unwrap().kind, BarKind::Opened);

        assert_eq!(ingestor.stream_count(), 3);
    }

    #[test]
    fn test_symbol_is_normalized() {
        let mut ingestor = BarIngestor::new();
        let ingested = ingestor.ingest(bar(" btcusdt ", Timeframe::M1, 0)).unwrap();
        assert_eq!(ingested.bar.symbol, "BTCUSDT");
    }

    #[test]
    fn test_rejections_are_counted() {
        let mut ingestor = BarIngestor::new();
        ingestor.ingest(bar("SOL", Timeframe::M1, 5)).unwrap();
        ingestor.ingest(bar("SOL", Timeframe::M1, 5)).unwrap();

        let late = ingestor.ingest(bar("SOL", Timeframe::M1, 4));
        assert!(matches!(late, Err(EngineError::OutOfOrderBar { .. })));

        let mut broken = bar("SOL", Timeframe::M1, 6);
        broken.low = dec!(12);
        assert!(matches!(ingestor.ingest(broken), Err(EngineError::InvalidBar { .. })));

        let stats = ingestor.stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.invalid, 1);
    }
}
