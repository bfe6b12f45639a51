//! Render/Diff Layer
//!
//! Derives view-models from cache reads. Nothing here touches the cache;
//! the only state kept between renders is the per-view flash table and
//! update counter held by [`OrderbookPresenter`].

pub mod chart;
pub mod flash;
pub mod orderbook;
pub mod sequence;

use tokio::time::Instant;
use venue_core::Orderbook;

pub use chart::{build_series, ChartSeries, SeriesPoint};
pub use flash::{FlashDirection, FlashTable, LevelKey, FLASH_DECAY};
pub use orderbook::{bar_width, render_orderbook, BookColumn, BookRow, BookSide, LevelRow};
pub use sequence::{structural_hash, UpdateSequence};

/// Rendered book for one view
#[derive(Debug, Clone, PartialEq)]
pub struct OrderbookView {
    pub columns: Vec<BookColumn>,
    /// Structural changes seen since this view mounted
    pub sequence: u64,
}

impl OrderbookView {
    /// Rows per column; equal across columns
    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.rows.len()).unwrap_or(0)
    }
}

/// Per-view render state: flash timers plus the update counter.
/// Create one per mounted view; dropping it is the unmount reset.
#[derive(Debug, Default)]
pub struct OrderbookPresenter {
    flashes: FlashTable,
    sequence: UpdateSequence,
}

impl OrderbookPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decay(decay: std::time::Duration) -> Self {
        Self {
            flashes: FlashTable::new(decay),
            sequence: UpdateSequence::new(),
        }
    }

    /// Observe `book` and render it with current flashes
    pub fn render(&mut self, book: &Orderbook, now: Instant) -> OrderbookView {
        self.flashes.observe(book, now);
        let sequence = self.sequence.observe(book);
        self.redraw(book, now, sequence)
    }

    /// Render again without observing, e.g. when a flash timer ends
    pub fn refresh(&mut self, book: &Orderbook, now: Instant) -> OrderbookView {
        self.flashes.expire(now);
        self.redraw(book, now, self.sequence.value())
    }

    fn redraw(&self, book: &Orderbook, now: Instant, sequence: u64) -> OrderbookView {
        let flashes = &self.flashes;
        let columns = orderbook::render_columns(book, |column, side, price| {
            flashes.flash(&LevelKey::new(column, side, price), now)
        });
        OrderbookView { columns, sequence }
    }

    /// When the next flash ends
    pub fn next_expiry(&self) -> Option<Instant> {
        self.flashes.next_expiry()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.value()
    }
}
