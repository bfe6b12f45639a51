//! Core types for the prediction venue client
//!
//! This crate defines the shared data structures used across the client,
//! including market snapshots, order books, the WebSocket frame protocol
//! and the topic naming scheme.

pub mod error;
pub mod frame;
pub mod market;
pub mod topic;

pub use error::{SyncError, SyncResult};
pub use frame::{ClientFrame, PriceUpdate, ServerFrame, UpdateEvent};
pub use market::{
    ChartPoint, ChartRange, Comment, MarketSnapshot, MarketStatus, MarketSummary,
    NamedOrderBookSide, OrderBookSide, Orderbook, Position, PriceLevel, TradeOutcome, TradeRecord,
    TradeSide,
};
pub use topic::Topic;
