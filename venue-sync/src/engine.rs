//! Sync engine: view lifecycle over the cache, loader and subscriptions
//!
//! Every mounted view of a market shares one cache entry, one `market:<id>`
//! subscription and one set of poll loops. The first mount creates them and
//! fetches every slice; the last unmount cancels polls and in-flight
//! fetches, unsubscribes and evicts the entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use venue_client::{MarketApi, Subscription, SubscriptionManager};
use venue_core::{
    ChartPoint, ChartRange, Comment, MarketSnapshot, MarketSummary, Orderbook, Position,
    ServerFrame, SyncError, SyncResult, Topic, TradeRecord, UpdateEvent,
};

use crate::cache::{CacheChange, MarketFeedCache, QueryKey, SliceKey, SliceKind, SliceState};
use crate::loader::Loader;
use crate::poll::{poll_while_disconnected, PollKind, PollingConfig};
use crate::reconcile::Reconciler;
use crate::render::{build_series, ChartSeries};

/// Background task aborted when dropped
struct PollTask(JoinHandle<()>);

impl Drop for PollTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ChartMount {
    views: usize,
    _poll: PollTask,
}

struct MarketMount {
    views: usize,
    _subscription: Subscription,
    _orderbook_poll: PollTask,
    charts: HashMap<ChartRange, ChartMount>,
}

struct ListMount {
    views: usize,
    _subscription: Option<Subscription>,
    _poll: PollTask,
}

struct EngineInner {
    cache: Arc<MarketFeedCache>,
    loader: Arc<Loader>,
    reconciler: Reconciler,
    subscriptions: SubscriptionManager,
    polling: PollingConfig,
    markets: Mutex<HashMap<String, MarketMount>>,
    markets_list: Mutex<Option<ListMount>>,
}

fn current_runtime() -> SyncResult<Handle> {
    Handle::try_current()
        .map_err(|_| SyncError::internal("sync engine needs a running tokio runtime"))
}

impl EngineInner {
    fn event_handler(self: &Arc<Self>) -> impl Fn(&Topic, &UpdateEvent) + Send + Sync + 'static {
        let weak: Weak<Self> = Arc::downgrade(self);
        move |topic: &Topic, event: &UpdateEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(topic, event);
            }
        }
    }

    fn handle_event(&self, topic: &Topic, event: &UpdateEvent) -> Vec<SliceKey> {
        let stale = self.reconciler.apply_event(topic, event);
        for key in &stale {
            self.refetch(key);
        }
        stale
    }

    /// Refetch a stale slice if a view still shows it
    fn refetch(&self, key: &SliceKey) {
        let queries = match key {
            SliceKey::MarketsList => {
                if self.markets_list.lock().is_none() {
                    return;
                }
                vec![QueryKey::MarketsList]
            }
            SliceKey::Market { market_id, kind } => {
                let markets = self.markets.lock();
                let Some(mount) = markets.get(market_id) else {
                    return;
                };
                let id = market_id.clone();
                match kind {
                    SliceKind::Snapshot => vec![QueryKey::Snapshot(id)],
                    SliceKind::Orderbook => vec![QueryKey::Orderbook(id)],
                    SliceKind::Trades => vec![QueryKey::Trades(id)],
                    SliceKind::Positions => vec![QueryKey::Positions(id)],
                    SliceKind::Comments => vec![QueryKey::Comments(id)],
                    SliceKind::Chart => mount
                        .charts
                        .keys()
                        .map(|range| QueryKey::Chart(id.clone(), *range))
                        .collect(),
                }
            }
        };

        for query in queries {
            self.loader.spawn_fetch(query);
        }
    }

    fn spawn_poll(&self, runtime: &Handle, kind: PollKind, key: QueryKey) -> PollTask {
        let loader = Arc::clone(&self.loader);
        let interval = self.polling.interval(kind);
        let connection = self.subscriptions.connection_state();
        let label = format!("{:?}", key);

        PollTask(runtime.spawn(async move {
            poll_while_disconnected(&label, interval, connection, move || {
                let loader = Arc::clone(&loader);
                let key = key.clone();
                async move {
                    let _ = loader.fetch(key).await;
                }
            })
            .await;
        }))
    }

    fn mount_market(
        self: &Arc<Self>,
        runtime: &Handle,
        market_id: &str,
        range: ChartRange,
    ) -> SyncResult<()> {
        let mut fetches = Vec::new();
        {
            let mut markets = self.markets.lock();
            match markets.get_mut(market_id) {
                Some(mount) => {
                    mount.views += 1;
                    match mount.charts.get_mut(&range) {
                        Some(chart) => chart.views += 1,
                        None => {
                            let key = QueryKey::Chart(market_id.to_string(), range);
                            let poll = self.spawn_poll(runtime, PollKind::Chart, key.clone());
                            mount.charts.insert(range, ChartMount { views: 1, _poll: poll });
                            fetches.push(key);
                        }
                    }
                }
                None => {
                    let subscription = self
                        .subscriptions
                        .subscribe(Topic::market(market_id), self.event_handler())?;

                    let id = market_id.to_string();
                    let chart_key = QueryKey::Chart(id.clone(), range);
                    let mut charts = HashMap::new();
                    charts.insert(
                        range,
                        ChartMount {
                            views: 1,
                            _poll: self.spawn_poll(runtime, PollKind::Chart, chart_key.clone()),
                        },
                    );

                    markets.insert(
                        id.clone(),
                        MarketMount {
                            views: 1,
                            _subscription: subscription,
                            _orderbook_poll: self.spawn_poll(
                                runtime,
                                PollKind::Orderbook,
                                QueryKey::Orderbook(id.clone()),
                            ),
                            charts,
                        },
                    );

                    fetches.extend([
                        QueryKey::Snapshot(id.clone()),
                        QueryKey::Orderbook(id.clone()),
                        QueryKey::Trades(id.clone()),
                        QueryKey::Positions(id.clone()),
                        QueryKey::Comments(id),
                        chart_key,
                    ]);
                    info!("[Feed Cache] Mounted market {}", market_id);
                }
            }
            self.cache.acquire(market_id);
        }

        for key in fetches {
            self.loader.spawn_fetch(key);
        }
        Ok(())
    }

    fn unmount_market(&self, market_id: &str, range: ChartRange) {
        let mut markets = self.markets.lock();
        let Some(mount) = markets.get_mut(market_id) else {
            return;
        };

        mount.views = mount.views.saturating_sub(1);
        if let Some(chart) = mount.charts.get_mut(&range) {
            chart.views = chart.views.saturating_sub(1);
            if chart.views == 0 {
                // Aborts the range's poll and drops its cached series
                mount.charts.remove(&range);
                self.cache.forget_chart(market_id, range);
            }
        }

        if mount.views == 0 {
            // Dropping the mount aborts polls and unsubscribes
            markets.remove(market_id);
            self.loader.abort_market(market_id);
            info!("[Feed Cache] Unmounted market {}", market_id);
        }
        self.cache.release(market_id);
    }

    fn mount_markets_list(self: &Arc<Self>, runtime: &Handle) -> SyncResult<()> {
        let first = {
            let mut list = self.markets_list.lock();
            match list.as_mut() {
                Some(mount) => {
                    mount.views += 1;
                    false
                }
                None => {
                    let subscription = if self.subscriptions.has_admin_credential() {
                        Some(
                            self.subscriptions
                                .subscribe(Topic::AdminMarkets, self.event_handler())?,
                        )
                    } else {
                        debug!("[Feed Cache] No admin credential, markets list is fetch-only");
                        None
                    };

                    *list = Some(ListMount {
                        views: 1,
                        _subscription: subscription,
                        _poll: self.spawn_poll(runtime, PollKind::MarketsList, QueryKey::MarketsList),
                    });
                    true
                }
            }
        };

        self.cache.acquire_markets_list();
        if first {
            self.loader.spawn_fetch(QueryKey::MarketsList);
        }
        Ok(())
    }

    fn unmount_markets_list(&self) {
        let mut list = self.markets_list.lock();
        let Some(mount) = list.as_mut() else {
            return;
        };

        mount.views = mount.views.saturating_sub(1);
        if mount.views == 0 {
            *list = None;
            self.loader.abort_markets_list();
        }
        self.cache.release_markets_list();
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

/// Entry point for views. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn MarketApi>, subscriptions: SubscriptionManager) -> Self {
        Self::with_polling(api, subscriptions, PollingConfig::default())
    }

    pub fn with_polling(
        api: Arc<dyn MarketApi>,
        subscriptions: SubscriptionManager,
        polling: PollingConfig,
    ) -> Self {
        let cache = Arc::new(MarketFeedCache::new());
        Self {
            inner: Arc::new(EngineInner {
                loader: Arc::new(Loader::new(api, Arc::clone(&cache))),
                reconciler: Reconciler::new(Arc::clone(&cache)),
                cache,
                subscriptions,
                polling,
                markets: Mutex::new(HashMap::new()),
                markets_list: Mutex::new(None),
            }),
        }
    }

    /// Mount a view of a market showing the chart for `range`
    pub fn mount_market(
        &self,
        market_id: impl Into<String>,
        range: ChartRange,
    ) -> SyncResult<MarketView> {
        let market_id = market_id.into();
        let runtime = current_runtime()?;
        self.inner.mount_market(&runtime, &market_id, range)?;

        Ok(MarketView {
            inner: Arc::clone(&self.inner),
            market_id,
            range,
        })
    }

    /// Mount a view of the markets list. The `admin:markets` topic is only
    /// subscribed when an admin credential is configured.
    pub fn mount_markets_list(&self) -> SyncResult<MarketsListView> {
        let runtime = current_runtime()?;
        self.inner.mount_markets_list(&runtime)?;
        Ok(MarketsListView {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Reconcile a frame that arrived outside the shared socket. Returns the
    /// slices that went stale; mounted ones are refetched.
    pub fn apply_frame(&self, frame: &ServerFrame) -> Vec<SliceKey> {
        match &frame.topic {
            Some(topic) => self.inner.handle_event(topic, &frame.event),
            None => Vec::new(),
        }
    }

    /// Optimistic patch after a submitted trade
    pub fn apply_optimistic_trade(
        &self,
        market_id: &str,
        trade: TradeRecord,
        prices: Option<(Decimal, Decimal)>,
    ) -> bool {
        let applied = self
            .inner
            .cache
            .apply_optimistic_trade(market_id, trade, prices);
        if applied {
            self.inner
                .refetch(&SliceKey::market(market_id, SliceKind::Positions));
        }
        applied
    }

    pub fn cache(&self) -> &Arc<MarketFeedCache> {
        &self.inner.cache
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.inner.subscriptions.is_connected()
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.cache.subscribe_changes()
    }

    pub fn mounted_markets(&self) -> Vec<String> {
        self.inner.markets.lock().keys().cloned().collect()
    }

    /// Background fetches still running for a market
    pub fn in_flight_fetches(&self, market_id: &str) -> usize {
        self.inner.loader.in_flight_count(market_id)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("mounted", &self.mounted_markets())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// Views
// ============================================================================

/// A mounted view of one market. Dropping it unmounts.
pub struct MarketView {
    inner: Arc<EngineInner>,
    market_id: String,
    range: ChartRange,
}

impl MarketView {
    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn chart_range(&self) -> ChartRange {
        self.range
    }

    pub fn snapshot(&self) -> SliceState<MarketSnapshot> {
        self.inner.cache.snapshot(&self.market_id)
    }

    pub fn orderbook(&self) -> SliceState<Orderbook> {
        self.inner.cache.orderbook(&self.market_id)
    }

    pub fn trades(&self) -> SliceState<Vec<TradeRecord>> {
        self.inner.cache.trades(&self.market_id)
    }

    pub fn trade_count(&self) -> u64 {
        self.inner.cache.trade_count(&self.market_id)
    }

    pub fn positions(&self) -> SliceState<Vec<Position>> {
        self.inner.cache.positions(&self.market_id)
    }

    pub fn chart(&self) -> SliceState<Vec<ChartPoint>> {
        self.inner.cache.chart(&self.market_id, self.range)
    }

    pub fn chart_series(&self) -> Option<ChartSeries> {
        self.chart().data.map(|points| build_series(&points))
    }

    pub fn comments(&self) -> SliceState<Vec<Comment>> {
        self.inner.cache.comments(&self.market_id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.subscriptions.is_connected()
    }

    /// Current polling interval for a query of this view
    pub fn refetch_interval(&self, kind: PollKind) -> Option<Duration> {
        self.inner
            .polling
            .refetch_interval(kind, self.is_connected())
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.cache.subscribe_changes()
    }

    /// Whether a change touches this market
    pub fn is_relevant(&self, change: &CacheChange) -> bool {
        change.key.market_id() == Some(self.market_id.as_str())
    }

    pub fn apply_optimistic_trade(
        &self,
        trade: TradeRecord,
        prices: Option<(Decimal, Decimal)>,
    ) -> bool {
        let applied = self
            .inner
            .cache
            .apply_optimistic_trade(&self.market_id, trade, prices);
        if applied {
            self.inner
                .refetch(&SliceKey::market(&self.market_id, SliceKind::Positions));
        }
        applied
    }
}

impl Drop for MarketView {
    fn drop(&mut self) {
        self.inner.unmount_market(&self.market_id, self.range);
    }
}

impl std::fmt::Debug for MarketView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketView")
            .field("market_id", &self.market_id)
            .field("range", &self.range)
            .finish()
    }
}

/// A mounted view of the markets list. Dropping it unmounts.
pub struct MarketsListView {
    inner: Arc<EngineInner>,
}

impl MarketsListView {
    pub fn markets(&self) -> SliceState<Vec<MarketSummary>> {
        self.inner.cache.markets_list()
    }

    pub fn refetch_interval(&self) -> Option<Duration> {
        self.inner
            .polling
            .refetch_interval(PollKind::MarketsList, self.inner.subscriptions.is_connected())
    }

    pub fn is_relevant(&self, change: &CacheChange) -> bool {
        change.key == SliceKey::MarketsList
    }
}

impl Drop for MarketsListView {
    fn drop(&mut self) {
        self.inner.unmount_markets_list();
    }
}

impl std::fmt::Debug for MarketsListView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketsListView").finish()
    }
}
