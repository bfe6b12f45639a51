//! Reconciliation Engine
//!
//! Applies push events to the [`MarketFeedCache`]. Each event variant has its
//! own patch function; the result is the list of slices that were marked
//! stale and should be refetched by whoever owns the mounted queries.

use std::sync::Arc;

use tracing::{debug, trace};
use venue_core::{PriceUpdate, ServerFrame, Topic, TradeRecord, UpdateEvent};

use crate::cache::{MarketFeedCache, SliceKey, SliceKind};

pub struct Reconciler {
    cache: Arc<MarketFeedCache>,
}

impl Reconciler {
    pub fn new(cache: Arc<MarketFeedCache>) -> Self {
        Self { cache }
    }

    /// Apply a decoded frame. Frames without a known topic carry nothing to
    /// reconcile.
    pub fn apply(&self, frame: &ServerFrame) -> Vec<SliceKey> {
        match &frame.topic {
            Some(topic) => self.apply_event(topic, &frame.event),
            None => Vec::new(),
        }
    }

    /// Apply one event received on `topic`
    pub fn apply_event(&self, topic: &Topic, event: &UpdateEvent) -> Vec<SliceKey> {
        trace!("[Reconcile] {} on {}", event.event_type(), topic);

        match topic {
            Topic::AdminMarkets => self.on_admin_event(event),
            Topic::Market(market_id) => match event {
                UpdateEvent::PriceUpdate(update) => self.on_price_update(market_id, update),
                UpdateEvent::NewTrade(trade) => self.on_new_trade(market_id, trade),
                UpdateEvent::NewOrder | UpdateEvent::OrderCancelled => {
                    self.on_order_change(market_id)
                }
                UpdateEvent::CommentAdded | UpdateEvent::CommentDeleted => {
                    self.on_comment_change(market_id)
                }
                UpdateEvent::MarketsUpdated | UpdateEvent::MarketActivity => {
                    debug!(
                        "[Reconcile] Ignoring {} outside the admin topic",
                        event.event_type()
                    );
                    Vec::new()
                }
                UpdateEvent::Unknown { event_type } => self.on_unknown(market_id, event_type),
            },
        }
    }

    /// Prices only move as a pair; liquidity moves on its own. Either one
    /// makes the chart stale.
    fn on_price_update(&self, market_id: &str, update: &PriceUpdate) -> Vec<SliceKey> {
        let carries_patch = update.prices().is_some() || update.liquidity.is_some();
        if !carries_patch {
            trace!("[Reconcile] PRICE_UPDATE for {} had nothing to apply", market_id);
            return Vec::new();
        }

        let mut stale = Vec::new();
        if !self.cache.patch_prices(market_id, update) {
            // Nothing cached to patch; a fresh snapshot covers it
            stale.push(SliceKey::market(market_id, SliceKind::Snapshot));
        }
        stale.push(SliceKey::market(market_id, SliceKind::Chart));
        self.invalidate_all(stale)
    }

    fn on_new_trade(&self, market_id: &str, trade: &TradeRecord) -> Vec<SliceKey> {
        if !self.cache.insert_trade(market_id, trade.clone()) {
            debug!(
                "[Reconcile] Trade {} already cached for {}",
                trade.id, market_id
            );
        }
        self.invalidate_all(vec![
            SliceKey::market(market_id, SliceKind::Positions),
            SliceKey::market(market_id, SliceKind::Chart),
        ])
    }

    /// Books are refetched whole rather than patched from deltas
    fn on_order_change(&self, market_id: &str) -> Vec<SliceKey> {
        self.invalidate_all(vec![SliceKey::market(market_id, SliceKind::Orderbook)])
    }

    fn on_comment_change(&self, market_id: &str) -> Vec<SliceKey> {
        self.invalidate_all(vec![SliceKey::market(market_id, SliceKind::Comments)])
    }

    fn on_admin_event(&self, event: &UpdateEvent) -> Vec<SliceKey> {
        match event {
            event if event.is_admin_event() => self.invalidate_all(vec![SliceKey::MarketsList]),
            UpdateEvent::Unknown { .. } => self.invalidate_all(vec![SliceKey::MarketsList]),
            other => {
                debug!(
                    "[Reconcile] Ignoring {} on the admin topic",
                    other.event_type()
                );
                Vec::new()
            }
        }
    }

    fn on_unknown(&self, market_id: &str, event_type: &str) -> Vec<SliceKey> {
        debug!(
            "[Reconcile] Unrecognized event {:?} for {}, invalidating market",
            event_type, market_id
        );
        self.invalidate_all(
            SliceKind::MARKET_SCOPED
                .into_iter()
                .map(|kind| SliceKey::market(market_id, kind))
                .collect(),
        )
    }

    /// Mark each key stale, keeping only those that had a cache entry
    fn invalidate_all(&self, keys: Vec<SliceKey>) -> Vec<SliceKey> {
        keys.into_iter()
            .filter(|key| self.cache.invalidate(key))
            .collect()
    }
}
