//! Plain-text rendering for log output

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use venue_core::{MarketSnapshot, MarketSummary};
use venue_sync::render::{BookRow, FlashDirection, LevelRow};
use venue_sync::OrderbookView;

const CELL_WIDTH: usize = 24;

fn level_cell(level: &LevelRow) -> String {
    let mark = match level.flash {
        Some(FlashDirection::Increase) => '+',
        Some(FlashDirection::Decrease) => '-',
        None => ' ',
    };
    // Ten-character depth bar
    let filled = (level.bar_width / Decimal::TEN)
        .round()
        .to_usize()
        .unwrap_or(0);
    format!(
        "{:>5} {:>8} {:<10}{}",
        level.price.round_dp(2),
        level.shares.normalize(),
        "#".repeat(filled.min(10)),
        mark
    )
}

fn row_cell(row: &BookRow) -> String {
    match row {
        BookRow::Ask(level) | BookRow::Bid(level) => level_cell(level),
        BookRow::Spread(Some(spread)) => format!("--- spread {} ---", spread.normalize()),
        BookRow::Spread(None) => "--- spread ---".to_string(),
        BookRow::Placeholder => String::new(),
    }
}

/// Header plus one line per row, columns side by side
pub fn book_lines(view: &OrderbookView) -> Vec<String> {
    let mut lines = Vec::with_capacity(view.row_count() + 1);

    let header: Vec<String> = view
        .columns
        .iter()
        .map(|column| format!("{:<width$}", column.name.to_uppercase(), width = CELL_WIDTH))
        .collect();
    lines.push(format!("{}  #{}", header.join(" | ").trim_end(), view.sequence));

    for index in 0..view.row_count() {
        let cells: Vec<String> = view
            .columns
            .iter()
            .map(|column| {
                let cell = column.rows.get(index).map(row_cell).unwrap_or_default();
                format!("{:<width$}", cell, width = CELL_WIDTH)
            })
            .collect();
        lines.push(cells.join(" | ").trim_end().to_string());
    }
    lines
}

pub fn price_line(snapshot: &MarketSnapshot) -> String {
    format!(
        "{} YES {}% NO {}% vol {} liq {}",
        snapshot.id,
        (snapshot.yes_price * Decimal::ONE_HUNDRED).round_dp(1),
        (snapshot.no_price * Decimal::ONE_HUNDRED).round_dp(1),
        snapshot.volume.normalize(),
        snapshot.liquidity.normalize()
    )
}

pub fn summary_line(market: &MarketSummary) -> String {
    format!(
        "[{:?}] {} ({}% yes)",
        market.status,
        market.question,
        (market.yes_price * Decimal::ONE_HUNDRED).round_dp(1)
    )
}
