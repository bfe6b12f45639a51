//! Flash highlighting for order-book levels
//!
//! A level flashes when its share count changes between two observed books.
//! Each flash lives for a fixed decay window; a new change on the same level
//! restarts its window. Timers are explicit data so any caller (UI tick,
//! test, logger) can drive them with its own clock.

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use venue_core::Orderbook;

use super::orderbook::BookSide;

/// How long a flash stays visible
pub const FLASH_DECAY: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashDirection {
    Increase,
    Decrease,
}

/// Identity of one displayed level
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LevelKey {
    pub column: String,
    pub side: BookSide,
    pub price: Decimal,
}

impl LevelKey {
    pub fn new(column: impl Into<String>, side: BookSide, price: Decimal) -> Self {
        Self {
            column: column.into(),
            side,
            price,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Flash {
    direction: FlashDirection,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct FlashTable {
    decay: Duration,
    previous: HashMap<LevelKey, Decimal>,
    active: HashMap<LevelKey, Flash>,
}

impl Default for FlashTable {
    fn default() -> Self {
        Self::new(FLASH_DECAY)
    }
}

impl FlashTable {
    pub fn new(decay: Duration) -> Self {
        Self {
            decay,
            previous: HashMap::new(),
            active: HashMap::new(),
        }
    }

    /// Compare `book` against the last observed book and start flashes for
    /// levels whose shares moved. First sight of a level never flashes.
    pub fn observe(&mut self, book: &Orderbook, now: Instant) {
        let mut current = HashMap::new();
        for (name, side) in book.columns() {
            let levels = side
                .bids
                .iter()
                .map(|l| (BookSide::Bid, l))
                .chain(side.asks.iter().map(|l| (BookSide::Ask, l)));
            for (book_side, level) in levels {
                current.insert(LevelKey::new(name, book_side, level.price), level.shares);
            }
        }

        for (key, shares) in &current {
            let Some(before) = self.previous.get(key) else {
                continue;
            };
            let direction = match shares.cmp(before) {
                std::cmp::Ordering::Greater => FlashDirection::Increase,
                std::cmp::Ordering::Less => FlashDirection::Decrease,
                std::cmp::Ordering::Equal => continue,
            };
            self.active.insert(
                key.clone(),
                Flash {
                    direction,
                    expires_at: now + self.decay,
                },
            );
        }

        // Levels that left the book take their flash with them
        self.active.retain(|key, _| current.contains_key(key));
        self.previous = current;
    }

    /// Flash currently showing on a level
    pub fn flash(&self, key: &LevelKey, now: Instant) -> Option<FlashDirection> {
        self.active
            .get(key)
            .filter(|flash| flash.expires_at > now)
            .map(|flash| flash.direction)
    }

    /// Drop finished flashes. Returns how many were cleared.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.active.len();
        self.active.retain(|_, flash| flash.expires_at > now);
        before - self.active.len()
    }

    /// When the next flash ends, for scheduling a redraw
    pub fn next_expiry(&self) -> Option<Instant> {
        self.active.values().map(|flash| flash.expires_at).min()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
