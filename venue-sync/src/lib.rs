//! Market state synchronization for the prediction venue client
//!
//! Keeps per-market price, order book, trade feed, chart and comment state
//! consistent across three update sources: REST fetches, pushes on the
//! shared WebSocket, and local optimistic patches after a trade.
//!
//! - [`cache`] - keyed, version-stamped store shared by every mounted view
//! - [`reconcile`] - one patch rule per push event type
//! - [`poll`] - refetch fallback while the socket is down
//! - [`engine`] - mount/unmount lifecycle tying it together
//! - [`render`] - order-book padding, flash highlighting, chart series

pub mod cache;
pub mod engine;
pub mod loader;
pub mod poll;
pub mod reconcile;
pub mod render;

pub use cache::{
    CacheChange, ChangeCause, FetchTicket, MarketFeedCache, Payload, QueryKey, SliceKey,
    SliceKind, SliceState, Version,
};
pub use engine::{MarketView, MarketsListView, SyncEngine};
pub use loader::Loader;
pub use poll::{poll_while_disconnected, PollKind, PollingConfig};
pub use reconcile::Reconciler;
pub use render::{OrderbookPresenter, OrderbookView};
