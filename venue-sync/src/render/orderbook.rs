//! Padded order-book columns
//!
//! Each column renders as: placeholder rows, asks (highest first), one
//! spread row, bids (highest first), placeholder rows. Asks are padded at
//! the top and bids at the bottom so the spread row sits on the same line
//! in every column.

use rust_decimal::Decimal;
use venue_core::{OrderBookSide, Orderbook, PriceLevel};

use super::flash::FlashDirection;

/// Which half of a column a level sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    Bid,
    Ask,
}

/// One resting level as displayed
#[derive(Debug, Clone, PartialEq)]
pub struct LevelRow {
    pub price: Decimal,
    pub shares: Decimal,
    /// Depth bar, 0-100
    pub bar_width: Decimal,
    pub flash: Option<FlashDirection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookRow {
    Ask(LevelRow),
    /// Divider between asks and bids, with best ask minus best bid when both exist
    Spread(Option<Decimal>),
    Bid(LevelRow),
    /// Keeps columns aligned; never collapsed
    Placeholder,
}

impl BookRow {
    pub fn level(&self) -> Option<&LevelRow> {
        match self {
            BookRow::Ask(level) | BookRow::Bid(level) => Some(level),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, BookRow::Placeholder)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookColumn {
    pub name: String,
    pub rows: Vec<BookRow>,
}

/// `min(100, shares / max * 100)`; zero when the column is empty
pub fn bar_width(shares: Decimal, max_shares: Decimal) -> Decimal {
    if max_shares <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (shares / max_shares * Decimal::ONE_HUNDRED).min(Decimal::ONE_HUNDRED)
}

fn sorted_desc(levels: &[PriceLevel]) -> Vec<&PriceLevel> {
    let mut sorted: Vec<_> = levels.iter().collect();
    sorted.sort_by(|a, b| b.price.cmp(&a.price));
    sorted
}

fn column_max_shares(side: &OrderBookSide) -> Decimal {
    side.bids
        .iter()
        .chain(side.asks.iter())
        .map(|level| level.shares)
        .max()
        .unwrap_or(Decimal::ZERO)
}

fn render_column(
    name: &str,
    side: &OrderBookSide,
    ask_rows: usize,
    bid_rows: usize,
    flash: &impl Fn(&str, BookSide, Decimal) -> Option<FlashDirection>,
) -> BookColumn {
    let max_shares = column_max_shares(side);
    let row = |level: &PriceLevel, book_side: BookSide| LevelRow {
        price: level.price,
        shares: level.shares,
        bar_width: bar_width(level.shares, max_shares),
        flash: flash(name, book_side, level.price),
    };

    let mut rows = Vec::with_capacity(ask_rows + bid_rows + 1);
    rows.extend((side.asks.len()..ask_rows).map(|_| BookRow::Placeholder));
    rows.extend(
        sorted_desc(&side.asks)
            .into_iter()
            .map(|level| BookRow::Ask(row(level, BookSide::Ask))),
    );
    rows.push(BookRow::Spread(side.spread()));
    rows.extend(
        sorted_desc(&side.bids)
            .into_iter()
            .map(|level| BookRow::Bid(row(level, BookSide::Bid))),
    );
    rows.extend((side.bids.len()..bid_rows).map(|_| BookRow::Placeholder));

    BookColumn {
        name: name.to_string(),
        rows,
    }
}

/// Render every column with shared padding and per-level flash state
pub fn render_columns(
    book: &Orderbook,
    flash: impl Fn(&str, BookSide, Decimal) -> Option<FlashDirection>,
) -> Vec<BookColumn> {
    let columns = book.columns();
    let ask_rows = columns.iter().map(|(_, s)| s.asks.len()).max().unwrap_or(0);
    let bid_rows = columns.iter().map(|(_, s)| s.bids.len()).max().unwrap_or(0);

    columns
        .into_iter()
        .map(|(name, side)| render_column(name, side, ask_rows, bid_rows, &flash))
        .collect()
}

/// Render without flash decoration
pub fn render_orderbook(book: &Orderbook) -> Vec<BookColumn> {
    render_columns(book, |_, _, _| None)
}
