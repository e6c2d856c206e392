use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::ingestor::IngestedBar;

/// What happened to a published bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// No worker registered for the symbol
    NoRoute,
    /// The worker's channel stayed full past the send timeout
    TimedOut,
    /// The worker is gone; the route has been removed
    Closed,
}

/// Routes ingested bars to one bounded channel per symbol
pub struct BarBus {
    routes: HashMap<String, mpsc::Sender<IngestedBar>>,
    capacity: usize,
    send_timeout: Duration,
}

impl BarBus {
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            capacity: capacity.max(1),
            send_timeout,
        }
    }

    /// Open a route for `symbol`, replacing any previous one
    pub fn register(&mut self, symbol: &str) -> mpsc::Receiver<IngestedBar> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.insert(symbol.to_string(), tx);
        debug!(symbol = %symbol, capacity = self.capacity, "Registered bar route");
        rx
    }

    pub fn has_route(&self, symbol: &str) -> bool {
        self.routes.contains_key(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub async fn publish(&mut self, ingested: IngestedBar) -> PublishOutcome {
        let symbol = ingested.bar.symbol.clone();

        let Some(tx) = self.routes.get(&symbol).cloned() else {
            return PublishOutcome::NoRoute;
        };

        match tokio::time::timeout(self.send_timeout, tx.send(ingested)).await {
            Ok(Ok(())) => PublishOutcome::Delivered,
            Ok(Err(_)) => {
                error!(symbol = %symbol, "Bar route closed, removing");
                self.routes.remove(&symbol);
                PublishOutcome::Closed
            }
            Err(_) => {
                warn!(symbol = %symbol, timeout_ms = self.send_timeout.as_millis() as u64, "Symbol worker saturated, dropping bar");
                PublishOutcome::TimedOut
            }
        }
    }

    /// Drop every route so workers see their channels close
    pub fn close_all(&mut self) {
        self.routes.clear();
    }
}
