use async_trait::async_trait;
use common::MarketBar;
use tokio::sync::mpsc;

use super::BarFeed;

/// Feed backed by an mpsc channel, for collaborators that push bars
pub struct ChannelFeed {
    rx: mpsc::Receiver<MarketBar>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (mpsc::Sender<MarketBar>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl BarFeed for ChannelFeed {
    async fn next_bar(&mut self) -> anyhow::Result<Option<MarketBar>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}
