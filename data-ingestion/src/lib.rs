//! Bar ingestion (stage 1)
//!
//! Turns raw OHLCV bars from a market-data collaborator into validated,
//! ordered per-(symbol, timeframe) sequences annotated with whether each bar
//! opened a new period or revised the open one, and fans them out to
//! per-symbol bounded channels.

pub mod connectors;
pub mod event_bus;
pub mod ingestor;

pub use connectors::{BarFeed, ChannelFeed, SyntheticFeed, SyntheticFeedConfig};
pub use event_bus::{BarBus, PublishOutcome};
pub use ingestor::{BarIngestor, IngestStats, IngestedBar};
