//! Market Feed Cache
//!
//! Keyed store of last-known market state: one entry per mounted market
//! (snapshot, order book, trades, positions, chart series per range,
//! comments) plus the markets-list slice.
//!
//! Every write is stamped with a version from a monotonic clock owned by the
//! cache. A fetch takes its version when it begins ([`FetchTicket`]), a push
//! patch when it is applied. This lets REST responses and push events race
//! freely: a response only replaces state that was last written before the
//! request went out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use venue_core::{
    ChartPoint, ChartRange, Comment, MarketSnapshot, MarketSummary, Orderbook, Position,
    PriceUpdate, SyncError, TradeRecord,
};

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Pushed trades held while the trade list is unloaded; oldest dropped first
const PUSHED_TRADE_LIMIT: usize = 200;

/// Position on the cache's write clock
pub type Version = u64;

// ============================================================================
// Keys
// ============================================================================

/// Market-scoped slice kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceKind {
    Snapshot,
    Orderbook,
    Trades,
    Positions,
    /// Every chart range of the market
    Chart,
    Comments,
}

impl SliceKind {
    /// Everything the unknown-event fallback invalidates
    pub const MARKET_SCOPED: [SliceKind; 5] = [
        SliceKind::Snapshot,
        SliceKind::Trades,
        SliceKind::Positions,
        SliceKind::Chart,
        SliceKind::Orderbook,
    ];
}

/// Identifies a cache slice for invalidation and change notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SliceKey {
    Market { market_id: String, kind: SliceKind },
    MarketsList,
}

impl SliceKey {
    pub fn market(market_id: impl Into<String>, kind: SliceKind) -> Self {
        SliceKey::Market {
            market_id: market_id.into(),
            kind,
        }
    }

    pub fn market_id(&self) -> Option<&str> {
        match self {
            SliceKey::Market { market_id, .. } => Some(market_id),
            SliceKey::MarketsList => None,
        }
    }
}

impl std::fmt::Display for SliceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceKey::Market { market_id, kind } => write!(f, "{}/{:?}", market_id, kind),
            SliceKey::MarketsList => f.write_str("markets"),
        }
    }
}

/// One fetchable query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Snapshot(String),
    Orderbook(String),
    Trades(String),
    Positions(String),
    Chart(String, ChartRange),
    Comments(String),
    MarketsList,
}

impl QueryKey {
    pub fn market_id(&self) -> Option<&str> {
        match self {
            QueryKey::Snapshot(id)
            | QueryKey::Orderbook(id)
            | QueryKey::Trades(id)
            | QueryKey::Positions(id)
            | QueryKey::Chart(id, _)
            | QueryKey::Comments(id) => Some(id),
            QueryKey::MarketsList => None,
        }
    }

    /// The slice this query fills
    pub fn slice_key(&self) -> SliceKey {
        let kind = match self {
            QueryKey::Snapshot(_) => SliceKind::Snapshot,
            QueryKey::Orderbook(_) => SliceKind::Orderbook,
            QueryKey::Trades(_) => SliceKind::Trades,
            QueryKey::Positions(_) => SliceKind::Positions,
            QueryKey::Chart(_, _) => SliceKind::Chart,
            QueryKey::Comments(_) => SliceKind::Comments,
            QueryKey::MarketsList => return SliceKey::MarketsList,
        };
        SliceKey::market(self.market_id().unwrap_or_default(), kind)
    }
}

/// Fetch result for a [`QueryKey`]
#[derive(Debug, Clone)]
pub enum Payload {
    Snapshot(MarketSnapshot),
    Orderbook(Orderbook),
    Trades(Vec<TradeRecord>),
    Positions(Vec<Position>),
    Chart(Vec<ChartPoint>),
    Comments(Vec<Comment>),
    MarketsList(Vec<MarketSummary>),
}

impl Payload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Snapshot(_) => "snapshot",
            Payload::Orderbook(_) => "orderbook",
            Payload::Trades(_) => "trades",
            Payload::Positions(_) => "positions",
            Payload::Chart(_) => "chart",
            Payload::Comments(_) => "comments",
            Payload::MarketsList(_) => "markets",
        }
    }
}

/// Issued when a fetch begins; carries the version the response is judged by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: QueryKey,
    pub version: Version,
}

// ============================================================================
// Change Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Fetched,
    Patched,
    Invalidated,
    Failed,
    Evicted,
}

/// Broadcast on every mutation so all mounted readers see the same patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub key: SliceKey,
    pub cause: ChangeCause,
}

// ============================================================================
// Slices
// ============================================================================

/// Read view of one slice
#[derive(Debug, Clone, PartialEq)]
pub struct SliceState<T> {
    pub data: Option<T>,
    pub is_stale: bool,
    pub error: Option<String>,
    pub is_fetching: bool,
}

impl<T> Default for SliceState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_stale: true,
            error: None,
            is_fetching: false,
        }
    }
}

impl<T> SliceState<T> {
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }
}

#[derive(Debug)]
struct Slice<T> {
    data: Option<T>,
    error: Option<String>,
    stale: bool,
    /// Ticket of the last fetch that was stored
    written_at: Version,
    invalidated_at: Version,
    /// Newest fetch still outstanding
    in_flight: Option<Version>,
}

impl<T> Default for Slice<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            stale: true,
            written_at: 0,
            invalidated_at: 0,
            in_flight: None,
        }
    }
}

impl<T: Clone> Slice<T> {
    fn state(&self) -> SliceState<T> {
        SliceState {
            data: self.data.clone(),
            is_stale: self.stale,
            error: self.error.clone(),
            is_fetching: self.in_flight.is_some(),
        }
    }
}

impl<T> Slice<T> {
    fn store(&mut self, ticket: Version, data: T) {
        self.data = Some(data);
        self.error = None;
        self.written_at = ticket;
        self.stale = self.invalidated_at > ticket;
        self.settle(ticket);
    }

    fn invalidate(&mut self, version: Version) {
        self.stale = true;
        self.invalidated_at = version;
    }
}

/// Fetch bookkeeping shared by every slice type
trait SliceControl {
    /// A fetch is redundant while a request newer than the last
    /// invalidation is still out
    fn begin(&mut self, version: Version) -> bool;
    fn is_current(&self, ticket: Version) -> bool;
    fn settle(&mut self, ticket: Version);
    fn fail(&mut self, ticket: Version, message: String);
}

impl<T> SliceControl for Slice<T> {
    fn begin(&mut self, version: Version) -> bool {
        if self
            .in_flight
            .is_some_and(|pending| pending > self.invalidated_at)
        {
            return false;
        }
        self.in_flight = Some(version);
        true
    }

    fn is_current(&self, ticket: Version) -> bool {
        ticket >= self.written_at
    }

    fn settle(&mut self, ticket: Version) {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }
    }

    fn fail(&mut self, ticket: Version, message: String) {
        if self.is_current(ticket) {
            self.error = Some(message);
        }
        self.settle(ticket);
    }
}

/// Last push version per snapshot field group
#[derive(Debug, Default)]
struct FieldVersions {
    prices: Version,
    volume: Version,
    liquidity: Version,
}

#[derive(Debug, Default)]
struct MarketEntry {
    views: usize,
    snapshot: Slice<MarketSnapshot>,
    fields: FieldVersions,
    orderbook: Slice<Orderbook>,
    trades: Slice<Vec<TradeRecord>>,
    /// Trades pushed while the list was unloaded or a fetch was out, oldest first
    pushed_trades: Vec<(Version, TradeRecord)>,
    trade_count: u64,
    positions: Slice<Vec<Position>>,
    charts: HashMap<ChartRange, Slice<Vec<ChartPoint>>>,
    comments: Slice<Vec<Comment>>,
}

impl MarketEntry {
    fn slice_mut(&mut self, query: &QueryKey) -> Option<&mut dyn SliceControl> {
        let slice: &mut dyn SliceControl = match query {
            QueryKey::Snapshot(_) => &mut self.snapshot,
            QueryKey::Orderbook(_) => &mut self.orderbook,
            QueryKey::Trades(_) => &mut self.trades,
            QueryKey::Positions(_) => &mut self.positions,
            QueryKey::Chart(_, range) => self.charts.get_mut(range)?,
            QueryKey::Comments(_) => &mut self.comments,
            QueryKey::MarketsList => return None,
        };
        Some(slice)
    }

    fn invalidate(&mut self, kind: SliceKind, version: Version) {
        match kind {
            SliceKind::Snapshot => self.snapshot.invalidate(version),
            SliceKind::Orderbook => self.orderbook.invalidate(version),
            SliceKind::Trades => self.trades.invalidate(version),
            SliceKind::Positions => self.positions.invalidate(version),
            SliceKind::Chart => self
                .charts
                .values_mut()
                .for_each(|chart| chart.invalidate(version)),
            SliceKind::Comments => self.comments.invalidate(version),
        }
    }

    fn has_trade(&self, trade_id: &str) -> bool {
        let in_list = self
            .trades
            .data
            .as_ref()
            .is_some_and(|trades| trades.iter().any(|t| t.id == trade_id));
        in_list || self.pushed_trades.iter().any(|(_, t)| t.id == trade_id)
    }

    /// Idempotent prepend. Returns false for a trade id already cached.
    fn insert_trade(&mut self, version: Version, trade: TradeRecord) -> bool {
        if self.has_trade(&trade.id) {
            return false;
        }

        // An outstanding or first fetch would replace the list, so remember
        // the push and merge it back when that fetch lands
        if self.trades.data.is_none() || self.trades.in_flight.is_some() {
            if self.pushed_trades.len() >= PUSHED_TRADE_LIMIT {
                self.pushed_trades.remove(0);
            }
            self.pushed_trades.push((version, trade.clone()));
        }
        if let Some(trades) = self.trades.data.as_mut() {
            trades.insert(0, trade);
        }
        self.trade_count += 1;
        true
    }

    fn store_trades(&mut self, ticket: Version, mut fetched: Vec<TradeRecord>) {
        self.pushed_trades.retain(|(version, _)| *version > ticket);
        for (_, trade) in &self.pushed_trades {
            if !fetched.iter().any(|t| t.id == trade.id) {
                fetched.insert(0, trade.clone());
            }
        }
        self.trades.store(ticket, fetched);
        if self.trades.in_flight.is_none() {
            self.pushed_trades.clear();
        }
    }

    /// Fetched snapshot, keeping fields pushed after the request began
    fn store_snapshot(&mut self, ticket: Version, mut fetched: MarketSnapshot) {
        if let Some(current) = self.snapshot.data.as_ref() {
            if self.fields.prices > ticket {
                fetched.yes_price = current.yes_price;
                fetched.no_price = current.no_price;
            }
            if self.fields.volume > ticket {
                fetched.volume = current.volume;
            }
            if self.fields.liquidity > ticket {
                fetched.liquidity = current.liquidity;
            }
        }
        self.snapshot.store(ticket, fetched);
    }

    /// Returns true when at least one field was written
    fn patch_snapshot(&mut self, version: Version, update: &PriceUpdate) -> bool {
        let Some(snapshot) = self.snapshot.data.as_mut() else {
            return false;
        };

        let mut patched = false;
        if let Some((yes, no)) = update.prices() {
            snapshot.yes_price = yes;
            snapshot.no_price = no;
            self.fields.prices = version;
            if let Some(volume) = update.volume {
                snapshot.volume = volume;
                self.fields.volume = version;
            }
            patched = true;
        }
        if let Some(liquidity) = update.liquidity {
            snapshot.liquidity = liquidity;
            self.fields.liquidity = version;
            patched = true;
        }
        patched
    }
}

#[derive(Debug, Default)]
struct MarketsListEntry {
    views: usize,
    slice: Slice<Vec<MarketSummary>>,
}

// ============================================================================
// Market Feed Cache
// ============================================================================

/// Shared keyed store for every mounted view
pub struct MarketFeedCache {
    clock: AtomicU64,
    markets: RwLock<HashMap<String, MarketEntry>>,
    markets_list: RwLock<MarketsListEntry>,
    changes: broadcast::Sender<CacheChange>,
}

impl Default for MarketFeedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketFeedCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            clock: AtomicU64::new(0),
            markets: RwLock::new(HashMap::new()),
            markets_list: RwLock::new(MarketsListEntry::default()),
            changes,
        }
    }

    /// Receive every subsequent [`CacheChange`]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    fn tick(&self) -> Version {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, key: SliceKey, cause: ChangeCause) {
        // No receivers is fine
        let _ = self.changes.send(CacheChange { key, cause });
    }

    // ------------------------------------------------------------------------
    // Entry lifecycle
    // ------------------------------------------------------------------------

    /// Register a view of a market, creating the entry on first use.
    /// Returns the view count after registration.
    pub fn acquire(&self, market_id: &str) -> usize {
        let mut markets = self.markets.write();
        let entry = markets.entry(market_id.to_string()).or_default();
        entry.views += 1;
        if entry.views == 1 {
            debug!("[Feed Cache] Created entry for {}", market_id);
        }
        entry.views
    }

    /// Drop a view of a market; the last release evicts the entry.
    /// Returns the remaining view count.
    pub fn release(&self, market_id: &str) -> usize {
        let remaining = {
            let mut markets = self.markets.write();
            let Some(entry) = markets.get_mut(market_id) else {
                return 0;
            };
            entry.views = entry.views.saturating_sub(1);
            let remaining = entry.views;
            if remaining == 0 {
                markets.remove(market_id);
            }
            remaining
        };

        if remaining == 0 {
            debug!("[Feed Cache] Evicted {}", market_id);
            self.notify(
                SliceKey::market(market_id, SliceKind::Snapshot),
                ChangeCause::Evicted,
            );
        }
        remaining
    }

    pub fn is_tracked(&self, market_id: &str) -> bool {
        self.markets.read().contains_key(market_id)
    }

    pub fn view_count(&self, market_id: &str) -> usize {
        self.markets.read().get(market_id).map(|e| e.views).unwrap_or(0)
    }

    pub fn acquire_markets_list(&self) -> usize {
        let mut list = self.markets_list.write();
        list.views += 1;
        list.views
    }

    /// The last release drops the cached list
    pub fn release_markets_list(&self) -> usize {
        let mut list = self.markets_list.write();
        list.views = list.views.saturating_sub(1);
        if list.views == 0 {
            list.slice = Slice::default();
        }
        list.views
    }

    // ------------------------------------------------------------------------
    // Fetch path
    // ------------------------------------------------------------------------

    /// Stamp a fetch for `key`. Returns `None` when the market has no
    /// mounted view or an equivalent request is already outstanding.
    pub fn begin_fetch(&self, key: &QueryKey) -> Option<FetchTicket> {
        let version = self.tick();
        let started = match key.market_id() {
            Some(market_id) => {
                let mut markets = self.markets.write();
                let entry = markets.get_mut(market_id)?;
                if let QueryKey::Chart(_, range) = key {
                    entry.charts.entry(*range).or_default();
                }
                entry.slice_mut(key).is_some_and(|slice| slice.begin(version))
            }
            None => {
                let mut list = self.markets_list.write();
                list.views > 0 && list.slice.begin(version)
            }
        };

        started.then(|| FetchTicket {
            key: key.clone(),
            version,
        })
    }

    /// Apply a fetch result. Returns false when it was dropped because newer
    /// state already landed, the entry is gone, or the payload does not
    /// match the query.
    pub fn complete_fetch(&self, ticket: &FetchTicket, payload: Payload) -> bool {
        let version = ticket.version;
        let applied = match (&ticket.key, payload) {
            (QueryKey::MarketsList, Payload::MarketsList(markets)) => {
                let mut list = self.markets_list.write();
                if list.views == 0 {
                    false
                } else if list.slice.is_current(version) {
                    list.slice.store(version, markets);
                    true
                } else {
                    list.slice.settle(version);
                    false
                }
            }
            (key, payload) => {
                let Some(market_id) = key.market_id() else {
                    return false;
                };
                let mut markets = self.markets.write();
                let Some(entry) = markets.get_mut(market_id) else {
                    return false;
                };
                store_market_payload(entry, key, version, payload)
            }
        };

        if applied {
            self.notify(ticket.key.slice_key(), ChangeCause::Fetched);
        } else {
            debug!("[Feed Cache] Dropped stale response for {:?}", ticket.key);
        }
        applied
    }

    /// Record a failed fetch. Cached data stays visible.
    pub fn fail_fetch(&self, ticket: &FetchTicket, error: &SyncError) {
        let version = ticket.version;
        let message = error.to_string();
        match ticket.key.market_id() {
            Some(market_id) => {
                let mut markets = self.markets.write();
                let Some(entry) = markets.get_mut(market_id) else {
                    return;
                };
                if let Some(slice) = entry.slice_mut(&ticket.key) {
                    slice.fail(version, message);
                }
            }
            None => self.markets_list.write().slice.fail(version, message),
        }
        self.notify(ticket.key.slice_key(), ChangeCause::Failed);
    }

    /// Clear the in-flight mark of a fetch that was cancelled before it
    /// could complete or fail, so later fetches of the slice are not
    /// coalesced into it.
    pub fn abandon_fetch(&self, ticket: &FetchTicket) {
        let version = ticket.version;
        match ticket.key.market_id() {
            Some(market_id) => {
                let mut markets = self.markets.write();
                if let Some(slice) = markets
                    .get_mut(market_id)
                    .and_then(|entry| entry.slice_mut(&ticket.key))
                {
                    slice.settle(version);
                }
            }
            None => self.markets_list.write().slice.settle(version),
        }
        debug!("[Feed Cache] Abandoned fetch of {:?}", ticket.key);
    }

    /// Drop the chart slice of a range no view shows any more
    pub fn forget_chart(&self, market_id: &str, range: ChartRange) -> bool {
        self.markets
            .write()
            .get_mut(market_id)
            .is_some_and(|entry| entry.charts.remove(&range).is_some())
    }

    // ------------------------------------------------------------------------
    // Push path
    // ------------------------------------------------------------------------

    /// Apply a partial price patch. Returns false when nothing was written,
    /// either because the patch carried nothing applicable or because no
    /// snapshot is cached yet.
    pub fn patch_prices(&self, market_id: &str, update: &PriceUpdate) -> bool {
        let patched = {
            let mut markets = self.markets.write();
            let version = self.tick();
            markets
                .get_mut(market_id)
                .is_some_and(|entry| entry.patch_snapshot(version, update))
        };

        if patched {
            self.notify(
                SliceKey::market(market_id, SliceKind::Snapshot),
                ChangeCause::Patched,
            );
        }
        patched
    }

    /// Idempotent trade insert. Returns true only for a new trade id.
    pub fn insert_trade(&self, market_id: &str, trade: TradeRecord) -> bool {
        let inserted = {
            let mut markets = self.markets.write();
            let version = self.tick();
            markets
                .get_mut(market_id)
                .is_some_and(|entry| entry.insert_trade(version, trade))
        };

        if inserted {
            self.notify(
                SliceKey::market(market_id, SliceKind::Trades),
                ChangeCause::Patched,
            );
        }
        inserted
    }

    /// Mark a slice stale. Returns false when there is nothing to invalidate.
    pub fn invalidate(&self, key: &SliceKey) -> bool {
        let invalidated = match key {
            SliceKey::Market { market_id, kind } => {
                let mut markets = self.markets.write();
                let version = self.tick();
                match markets.get_mut(market_id) {
                    Some(entry) => {
                        entry.invalidate(*kind, version);
                        true
                    }
                    None => false,
                }
            }
            SliceKey::MarketsList => {
                let mut list = self.markets_list.write();
                let version = self.tick();
                list.slice.invalidate(version);
                list.views > 0
            }
        };

        if invalidated {
            self.notify(key.clone(), ChangeCause::Invalidated);
        }
        invalidated
    }

    /// Local patch after a submitted trade, ahead of server confirmation:
    /// inserts the trade, optionally moves prices, and invalidates positions.
    pub fn apply_optimistic_trade(
        &self,
        market_id: &str,
        trade: TradeRecord,
        prices: Option<(Decimal, Decimal)>,
    ) -> bool {
        if !self.is_tracked(market_id) {
            warn!(
                "[Feed Cache] Optimistic trade for unmounted market {}",
                market_id
            );
            return false;
        }

        self.insert_trade(market_id, trade);
        if let Some((yes, no)) = prices {
            self.patch_prices(
                market_id,
                &PriceUpdate {
                    yes_price: Some(yes),
                    no_price: Some(no),
                    ..PriceUpdate::default()
                },
            );
        }
        self.invalidate(&SliceKey::market(market_id, SliceKind::Positions));
        true
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn read_market<T>(&self, market_id: &str, read: impl FnOnce(&MarketEntry) -> T) -> Option<T> {
        self.markets.read().get(market_id).map(read)
    }

    pub fn snapshot(&self, market_id: &str) -> SliceState<MarketSnapshot> {
        self.read_market(market_id, |e| e.snapshot.state())
            .unwrap_or_default()
    }

    pub fn orderbook(&self, market_id: &str) -> SliceState<Orderbook> {
        self.read_market(market_id, |e| e.orderbook.state())
            .unwrap_or_default()
    }

    pub fn trades(&self, market_id: &str) -> SliceState<Vec<TradeRecord>> {
        self.read_market(market_id, |e| e.trades.state())
            .unwrap_or_default()
    }

    /// Trades inserted by push or optimistic patch since the entry was created
    pub fn trade_count(&self, market_id: &str) -> u64 {
        self.read_market(market_id, |e| e.trade_count).unwrap_or(0)
    }

    pub fn positions(&self, market_id: &str) -> SliceState<Vec<Position>> {
        self.read_market(market_id, |e| e.positions.state())
            .unwrap_or_default()
    }

    pub fn chart(&self, market_id: &str, range: ChartRange) -> SliceState<Vec<ChartPoint>> {
        self.read_market(market_id, |e| {
            e.charts.get(&range).map(Slice::state).unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn comments(&self, market_id: &str) -> SliceState<Vec<Comment>> {
        self.read_market(market_id, |e| e.comments.state())
            .unwrap_or_default()
    }

    pub fn markets_list(&self) -> SliceState<Vec<MarketSummary>> {
        self.markets_list.read().slice.state()
    }
}

impl std::fmt::Debug for MarketFeedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeedCache")
            .field("markets", &self.markets.read().len())
            .field("version", &self.clock.load(Ordering::SeqCst))
            .finish()
    }
}

fn store_market_payload(
    entry: &mut MarketEntry,
    key: &QueryKey,
    version: Version,
    payload: Payload,
) -> bool {
    match (key, payload) {
        // Field-level versions decide, not the whole-slice stamp
        (QueryKey::Snapshot(_), Payload::Snapshot(snapshot)) => {
            if entry.snapshot.is_current(version) {
                entry.store_snapshot(version, snapshot);
                true
            } else {
                entry.snapshot.settle(version);
                false
            }
        }
        (QueryKey::Trades(_), Payload::Trades(trades)) => {
            if entry.trades.is_current(version) {
                entry.store_trades(version, trades);
                true
            } else {
                entry.trades.settle(version);
                false
            }
        }
        (QueryKey::Orderbook(_), Payload::Orderbook(book)) => {
            store_if_current(&mut entry.orderbook, version, book)
        }
        (QueryKey::Positions(_), Payload::Positions(positions)) => {
            store_if_current(&mut entry.positions, version, positions)
        }
        // A range forgotten while its fetch was out stays forgotten
        (QueryKey::Chart(_, range), Payload::Chart(points)) => match entry.charts.get_mut(range) {
            Some(chart) => store_if_current(chart, version, points),
            None => false,
        },
        (QueryKey::Comments(_), Payload::Comments(comments)) => {
            store_if_current(&mut entry.comments, version, comments)
        }
        (key, payload) => {
            warn!(
                "[Feed Cache] {} payload does not match query {:?}",
                payload.kind_name(),
                key
            );
            if let Some(slice) = entry.slice_mut(key) {
                slice.settle(version);
            }
            false
        }
    }
}

fn store_if_current<T>(slice: &mut Slice<T>, version: Version, data: T) -> bool {
    if slice.is_current(version) {
        slice.store(version, data);
        true
    } else {
        slice.settle(version);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use venue_core::{OrderBookSide, PriceLevel, TradeSide};

    fn snapshot(yes: Decimal, no: Decimal, liquidity: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            id: "m1".to_string(),
            yes_price: yes,
            no_price: no,
            volume: dec!(100),
            liquidity,
            updated_at: Utc::now(),
        }
    }

    fn trade(id: &str) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            side: TradeSide::Buy,
            outcome: "YES".to_string(),
            shares: dec!(10),
            price: dec!(0.5),
            total_amount: dec!(5),
            created_at: Utc::now(),
            user: None,
        }
    }

    fn book(shares: Decimal) -> Orderbook {
        Orderbook::Binary {
            yes: OrderBookSide {
                bids: vec![PriceLevel::new(dec!(0.4), shares)],
                asks: vec![],
            },
            no: OrderBookSide::default(),
        }
    }

    fn loaded_cache() -> MarketFeedCache {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let ticket = cache.begin_fetch(&QueryKey::Snapshot("m1".into())).unwrap();
        assert!(cache.complete_fetch(
            &ticket,
            Payload::Snapshot(snapshot(dec!(0.5), dec!(0.5), dec!(1000)))
        ));
        cache
    }

    #[test]
    fn test_fetch_for_unmounted_market_is_skipped() {
        let cache = MarketFeedCache::new();
        assert!(cache.begin_fetch(&QueryKey::Orderbook("m1".into())).is_none());
        assert!(cache.begin_fetch(&QueryKey::MarketsList).is_none());
    }

    #[test]
    fn test_duplicate_fetch_is_coalesced_until_invalidated() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Orderbook("m1".into());

        let first = cache.begin_fetch(&key).unwrap();
        assert!(cache.begin_fetch(&key).is_none());
        assert!(cache.orderbook("m1").is_fetching);

        cache.invalidate(&SliceKey::market("m1", SliceKind::Orderbook));
        let second = cache.begin_fetch(&key).unwrap();
        assert!(second.version > first.version);
    }

    #[test]
    fn test_partial_price_updates_keep_other_fields() {
        let cache = loaded_cache();

        assert!(cache.patch_prices(
            "m1",
            &PriceUpdate {
                yes_price: Some(dec!(0.62)),
                no_price: Some(dec!(0.38)),
                ..PriceUpdate::default()
            }
        ));
        assert!(cache.patch_prices(
            "m1",
            &PriceUpdate {
                liquidity: Some(dec!(5000)),
                ..PriceUpdate::default()
            }
        ));

        let snap = cache.snapshot("m1").data.unwrap();
        assert_eq!(snap.yes_price, dec!(0.62));
        assert_eq!(snap.no_price, dec!(0.38));
        assert_eq!(snap.liquidity, dec!(5000));
        assert_eq!(snap.volume, dec!(100));
    }

    #[test]
    fn test_lone_price_is_not_applied() {
        let cache = loaded_cache();
        let patched = cache.patch_prices(
            "m1",
            &PriceUpdate {
                yes_price: Some(dec!(0.9)),
                volume: Some(dec!(1)),
                ..PriceUpdate::default()
            },
        );
        assert!(!patched);
        let snap = cache.snapshot("m1").data.unwrap();
        assert_eq!(snap.yes_price, dec!(0.5));
        assert_eq!(snap.volume, dec!(100));
    }

    #[test]
    fn test_patch_without_snapshot_is_ignored() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let update = PriceUpdate {
            liquidity: Some(dec!(1)),
            ..PriceUpdate::default()
        };
        assert!(!cache.patch_prices("m1", &update));
        assert!(!cache.snapshot("m1").is_loaded());
    }

    #[test]
    fn test_slow_snapshot_response_keeps_newer_push() {
        let cache = loaded_cache();
        let ticket = cache.begin_fetch(&QueryKey::Snapshot("m1".into())).unwrap();

        cache.patch_prices(
            "m1",
            &PriceUpdate {
                yes_price: Some(dec!(0.7)),
                no_price: Some(dec!(0.3)),
                ..PriceUpdate::default()
            },
        );

        // Response was produced before the push; liquidity is still news
        assert!(cache.complete_fetch(
            &ticket,
            Payload::Snapshot(snapshot(dec!(0.55), dec!(0.45), dec!(2000)))
        ));

        let snap = cache.snapshot("m1").data.unwrap();
        assert_eq!(snap.yes_price, dec!(0.7));
        assert_eq!(snap.no_price, dec!(0.3));
        assert_eq!(snap.liquidity, dec!(2000));
    }

    #[test]
    fn test_older_response_loses_to_newer_response() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Orderbook("m1".into());

        let old = cache.begin_fetch(&key).unwrap();
        cache.invalidate(&SliceKey::market("m1", SliceKind::Orderbook));
        let new = cache.begin_fetch(&key).unwrap();

        assert!(cache.complete_fetch(&new, Payload::Orderbook(book(dec!(20)))));
        assert!(!cache.complete_fetch(&old, Payload::Orderbook(book(dec!(10)))));

        let state = cache.orderbook("m1");
        assert_eq!(state.data, Some(book(dec!(20))));
        assert!(!state.is_fetching);
    }

    #[test]
    fn test_invalidation_during_fetch_keeps_slice_stale() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Comments("m1".into());

        let ticket = cache.begin_fetch(&key).unwrap();
        cache.invalidate(&SliceKey::market("m1", SliceKind::Comments));
        cache.complete_fetch(&ticket, Payload::Comments(vec![]));

        let state = cache.comments("m1");
        assert!(state.is_loaded());
        assert!(state.is_stale);
    }

    #[test]
    fn test_duplicate_trade_is_inserted_once() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let ticket = cache.begin_fetch(&QueryKey::Trades("m1".into())).unwrap();
        cache.complete_fetch(&ticket, Payload::Trades(vec![trade("t0")]));

        assert!(cache.insert_trade("m1", trade("t1")));
        assert!(!cache.insert_trade("m1", trade("t1")));
        assert!(!cache.insert_trade("m1", trade("t0")));

        let trades = cache.trades("m1").data.unwrap();
        let ids: Vec<_> = trades.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t0"]);
        assert_eq!(cache.trade_count("m1"), 1);
    }

    #[test]
    fn test_pushed_trades_survive_older_fetch() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let ticket = cache.begin_fetch(&QueryKey::Trades("m1".into())).unwrap();

        cache.insert_trade("m1", trade("pushed"));
        cache.complete_fetch(&ticket, Payload::Trades(vec![trade("t0")]));

        let trades = cache.trades("m1").data.unwrap();
        let ids: Vec<_> = trades.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["pushed", "t0"]);

        // Fetch that already contains the pushed trade does not duplicate it
        let ticket = cache.begin_fetch(&QueryKey::Trades("m1".into())).unwrap();
        cache.insert_trade("m1", trade("again"));
        cache.complete_fetch(
            &ticket,
            Payload::Trades(vec![trade("again"), trade("pushed"), trade("t0")]),
        );
        assert_eq!(cache.trades("m1").data.unwrap().len(), 3);
    }

    #[test]
    fn test_failed_fetch_keeps_data_and_sets_error() {
        let cache = loaded_cache();
        let ticket = cache.begin_fetch(&QueryKey::Snapshot("m1".into())).unwrap();
        cache.fail_fetch(&ticket, &SyncError::network("timeout"));

        let state = cache.snapshot("m1");
        assert!(state.is_loaded());
        assert!(state.error.unwrap().contains("timeout"));
        assert!(!state.is_fetching);
    }

    #[test]
    fn test_abandoned_fetch_does_not_block_later_fetches() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Chart("m1".into(), ChartRange::OneWeek);

        let cancelled = cache.begin_fetch(&key).unwrap();
        assert!(cache.begin_fetch(&key).is_none());

        cache.abandon_fetch(&cancelled);
        assert!(!cache.chart("m1", ChartRange::OneWeek).is_fetching);

        let retry = cache.begin_fetch(&key).unwrap();
        assert!(cache.complete_fetch(&retry, Payload::Chart(vec![])));
        assert!(cache.chart("m1", ChartRange::OneWeek).is_loaded());
    }

    #[test]
    fn test_forgotten_chart_ignores_late_response() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Chart("m1".into(), ChartRange::OneWeek);

        let late = cache.begin_fetch(&key).unwrap();
        assert!(cache.forget_chart("m1", ChartRange::OneWeek));
        assert!(!cache.forget_chart("m1", ChartRange::OneWeek));

        assert!(!cache.complete_fetch(&late, Payload::Chart(vec![])));
        let state = cache.chart("m1", ChartRange::OneWeek);
        assert!(!state.is_loaded());
        assert!(!state.is_fetching);

        // Remount starts a fresh fetch
        assert!(cache.begin_fetch(&key).is_some());
    }

    #[test]
    fn test_pushed_trades_are_bounded_while_unloaded() {
        let cache = MarketFeedCache::new();
        cache.acquire("m1");
        let key = QueryKey::Trades("m1".into());
        let failed = cache.begin_fetch(&key).unwrap();
        cache.fail_fetch(&failed, &SyncError::network("timeout"));

        for i in 0..250 {
            assert!(cache.insert_trade("m1", trade(&format!("t{}", i))));
        }
        assert_eq!(cache.trade_count("m1"), 250);

        let ticket = cache.begin_fetch(&key).unwrap();
        cache.complete_fetch(&ticket, Payload::Trades(vec![]));

        let trades = cache.trades("m1").data.unwrap();
        assert_eq!(trades.len(), PUSHED_TRADE_LIMIT);
        assert_eq!(trades[0].id, "t249");
        assert_eq!(trades[PUSHED_TRADE_LIMIT - 1].id, "t50");
    }

    #[test]
    fn test_last_release_evicts() {
        let cache = loaded_cache();
        assert_eq!(cache.acquire("m1"), 2);
        assert_eq!(cache.release("m1"), 1);
        assert!(cache.snapshot("m1").is_loaded());

        assert_eq!(cache.release("m1"), 0);
        assert!(!cache.is_tracked("m1"));
        assert!(!cache.snapshot("m1").is_loaded());
    }

    #[test]
    fn test_optimistic_trade_patches_and_invalidates_positions() {
        let cache = loaded_cache();
        let ticket = cache.begin_fetch(&QueryKey::Positions("m1".into())).unwrap();
        cache.complete_fetch(&ticket, Payload::Positions(vec![]));
        assert!(!cache.positions("m1").is_stale);

        assert!(cache.apply_optimistic_trade("m1", trade("local"), Some((dec!(0.6), dec!(0.4)))));

        assert_eq!(cache.snapshot("m1").data.unwrap().yes_price, dec!(0.6));
        assert!(cache.positions("m1").is_stale);

        // Server echo of the same trade is a no-op
        assert!(!cache.insert_trade("m1", trade("local")));
        assert!(!cache.apply_optimistic_trade("other", trade("x"), None));
    }

    #[test]
    fn test_changes_are_broadcast() {
        let cache = loaded_cache();
        let mut rx = cache.subscribe_changes();

        cache.invalidate(&SliceKey::market("m1", SliceKind::Chart));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, SliceKey::market("m1", SliceKind::Chart));
        assert_eq!(change.cause, ChangeCause::Invalidated);
    }

    #[test]
    fn test_markets_list_lifecycle() {
        let cache = MarketFeedCache::new();
        assert_eq!(cache.acquire_markets_list(), 1);

        let ticket = cache.begin_fetch(&QueryKey::MarketsList).unwrap();
        assert!(cache.complete_fetch(&ticket, Payload::MarketsList(vec![])));
        assert!(cache.markets_list().is_loaded());

        assert_eq!(cache.release_markets_list(), 0);
        assert!(!cache.markets_list().is_loaded());
    }
}
