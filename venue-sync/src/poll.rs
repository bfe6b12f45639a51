//! Polling Fallback Scheduler
//!
//! Periodic refetch that only runs while the shared socket is down.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Queries with a polling fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Orderbook,
    Chart,
    MarketsList,
}

/// Fallback intervals per query kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub orderbook: Duration,
    pub chart: Duration,
    pub markets_list: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            orderbook: Duration::from_secs(5),
            chart: Duration::from_secs(10),
            markets_list: Duration::from_secs(15),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self, kind: PollKind) -> Duration {
        match kind {
            PollKind::Orderbook => self.orderbook,
            PollKind::Chart => self.chart,
            PollKind::MarketsList => self.markets_list,
        }
    }

    /// `None` while connected: pushes keep the query fresh
    pub fn refetch_interval(&self, kind: PollKind, connected: bool) -> Option<Duration> {
        (!connected).then(|| self.interval(kind))
    }
}

/// Run `fetch` every `interval` while `connection` reads false.
///
/// A drop to disconnected polls right away instead of finishing the previous
/// wait. A fetch already running when the socket comes back is awaited, not
/// cancelled. Returns when the connection state sender goes away.
pub async fn poll_while_disconnected<F, Fut>(
    label: &str,
    interval: Duration,
    mut connection: watch::Receiver<bool>,
    mut fetch: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *connection.borrow_and_update() {
            if connection.changed().await.is_err() {
                return;
            }
            continue;
        }

        debug!("[Poll] Refetching {}", label);
        fetch().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = connection.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
