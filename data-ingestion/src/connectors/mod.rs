pub mod channel;
pub mod synthetic;

use async_trait::async_trait;
use common::MarketBar;

pub use channel::ChannelFeed;
pub use synthetic::{SyntheticFeed, SyntheticFeedConfig};

/// Source of raw bars from a market-data collaborator
#[async_trait]
pub trait BarFeed: Send {
    /// Next bar, or `None` once the feed is exhausted
    async fn next_bar(&mut self) -> anyhow::Result<Option<MarketBar>>;

    fn name(&self) -> &str;
}
