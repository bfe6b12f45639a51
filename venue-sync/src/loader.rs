//! Query loader
//!
//! Turns a [`QueryKey`] into the matching [`MarketApi`] call and stores the
//! result through the cache. Spawned fetches are tracked per market so an
//! unmount can cancel them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use venue_client::MarketApi;
use venue_core::SyncResult;

use crate::cache::{FetchTicket, MarketFeedCache, Payload, QueryKey};

/// Owner of spawned fetches: a market id, or `None` for the markets list
type TaskScope = Option<String>;

pub struct Loader {
    api: Arc<dyn MarketApi>,
    cache: Arc<MarketFeedCache>,
    next_task: AtomicU64,
    in_flight: DashMap<TaskScope, Vec<(u64, AbortHandle)>>,
}

impl Loader {
    pub fn new(api: Arc<dyn MarketApi>, cache: Arc<MarketFeedCache>) -> Self {
        Self {
            api,
            cache,
            next_task: AtomicU64::new(1),
            in_flight: DashMap::new(),
        }
    }

    /// Call the endpoint behind `key`
    pub async fn load(api: &dyn MarketApi, key: &QueryKey) -> SyncResult<Payload> {
        Ok(match key {
            QueryKey::Snapshot(id) => Payload::Snapshot(api.get_market(id).await?),
            QueryKey::Orderbook(id) => Payload::Orderbook(api.get_orderbook(id).await?),
            QueryKey::Trades(id) => Payload::Trades(api.get_trades(id).await?),
            QueryKey::Positions(id) => Payload::Positions(api.get_positions(id).await?),
            QueryKey::Chart(id, range) => Payload::Chart(api.get_chart(id, *range).await?),
            QueryKey::Comments(id) => Payload::Comments(api.get_comments(id).await?),
            QueryKey::MarketsList => Payload::MarketsList(api.list_markets().await?),
        })
    }

    /// Fetch `key` and store the result. Returns whether the cache took it;
    /// `Ok(false)` also covers fetches skipped as redundant.
    ///
    /// Dropping the future midway (an aborted poll or unmount) releases the
    /// slice's in-flight mark.
    pub async fn fetch(&self, key: QueryKey) -> SyncResult<bool> {
        let Some(ticket) = self.cache.begin_fetch(&key) else {
            debug!("[Feed Cache] Skipping fetch of {:?}", key);
            return Ok(false);
        };
        let mut pending = PendingFetch {
            cache: self.cache.as_ref(),
            ticket: Some(ticket),
        };

        let result = Self::load(self.api.as_ref(), &key).await;
        let Some(ticket) = pending.ticket.take() else {
            return Ok(false);
        };
        match result {
            Ok(payload) => Ok(self.cache.complete_fetch(&ticket, payload)),
            Err(e) => {
                if e.is_transient() {
                    info!("[Feed Cache] Fetch of {:?} failed, keeping cached data: {}", key, e);
                } else {
                    warn!("[Feed Cache] Fetch of {:?} failed: {}", key, e);
                }
                self.cache.fail_fetch(&ticket, &e);
                Err(e)
            }
        }
    }

    /// Fetch in the background, cancellable through [`Loader::abort_market`]
    pub fn spawn_fetch(self: &Arc<Self>, key: QueryKey) {
        let scope: TaskScope = key.market_id().map(str::to_string);
        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);

        // Registered before the task can finish and deregister itself
        let mut tasks = self.in_flight.entry(scope.clone()).or_default();
        let loader = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = loader.fetch(key).await;
            loader.finish(&scope, task_id);
        });
        tasks.push((task_id, handle.abort_handle()));
    }

    fn finish(&self, scope: &TaskScope, task_id: u64) {
        if let Some(mut tasks) = self.in_flight.get_mut(scope) {
            tasks.retain(|(id, _)| *id != task_id);
        }
        self.in_flight
            .remove_if(scope, |_, tasks| tasks.is_empty());
    }

    /// Cancel every spawned fetch of a market
    pub fn abort_market(&self, market_id: &str) {
        self.abort_scope(&Some(market_id.to_string()));
    }

    pub fn abort_markets_list(&self) {
        self.abort_scope(&None);
    }

    fn abort_scope(&self, scope: &TaskScope) {
        if let Some((_, tasks)) = self.in_flight.remove(scope) {
            if !tasks.is_empty() {
                debug!("[Feed Cache] Cancelling {} in-flight fetches", tasks.len());
            }
            for (_, handle) in tasks {
                handle.abort();
            }
        }
    }

    /// Spawned fetches still running for a market
    pub fn in_flight_count(&self, market_id: &str) -> usize {
        self.in_flight
            .get(&Some(market_id.to_string()))
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }
}

/// Ticket of a fetch still awaiting its response
struct PendingFetch<'a> {
    cache: &'a MarketFeedCache,
    ticket: Option<FetchTicket>,
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.cache.abandon_fetch(&ticket);
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("scopes", &self.in_flight.len())
            .finish()
    }
}
