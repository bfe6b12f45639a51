//! Market data structures for the prediction venue

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    /// Market is open for trading
    #[default]
    Open,
    /// Market is closed but not yet resolved
    Closed,
    /// Market has been resolved with a final outcome
    Resolved,
}

/// Last-known price state of a single market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    /// Market identifier on the venue
    pub id: String,

    /// Current YES price (0.00 - 1.00, represents probability)
    pub yes_price: Decimal,

    /// Current NO price (0.00 - 1.00)
    pub no_price: Decimal,

    /// Traded volume
    #[serde(default)]
    pub volume: Decimal,

    /// Available liquidity
    #[serde(default)]
    pub liquidity: Decimal,

    /// When the venue last touched this market
    pub updated_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Implied probability of the YES outcome
    pub fn implied_probability(&self) -> Decimal {
        self.yes_price
    }
}

/// One row of the markets list (`GET /markets`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub status: MarketStatus,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

// ============================================================================
// Order Book Types
// ============================================================================

/// Resting liquidity at a single price
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price (0.00 - 1.00 representing probability)
    pub price: Decimal,
    /// Total shares resting at this price
    pub shares: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, shares: Decimal) -> Self {
        Self { price, shares }
    }
}

/// Bids and asks for one outcome. Levels arrive in server order and are not
/// assumed to be sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSide {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSide {
    /// Highest bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    /// Lowest ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }

    /// Best ask minus best bid
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Book for one option of a multi-outcome market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedOrderBookSide {
    pub name: String,
    #[serde(flatten)]
    pub side: OrderBookSide,
}

/// Order book snapshot as returned by `GET /trades/orderbook/:id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Orderbook {
    /// YES/NO market
    Binary {
        yes: OrderBookSide,
        no: OrderBookSide,
    },
    /// One book per named option
    MultiOutcome { options: Vec<NamedOrderBookSide> },
}

impl Orderbook {
    /// Columns in display order, each with its label
    pub fn columns(&self) -> Vec<(&str, &OrderBookSide)> {
        match self {
            Orderbook::Binary { yes, no } => vec![("yes", yes), ("no", no)],
            Orderbook::MultiOutcome { options } => options
                .iter()
                .map(|o| (o.name.as_str(), &o.side))
                .collect(),
        }
    }

    pub fn is_multi_outcome(&self) -> bool {
        matches!(self, Orderbook::MultiOutcome { .. })
    }
}

// ============================================================================
// Trade Types
// ============================================================================

/// Side of a trade from the taker's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    #[serde(alias = "buy")]
    Buy,
    #[serde(alias = "sell")]
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome label of a trade ("YES", "NO" or an option name)
pub type TradeOutcome = String;

/// A single fill on the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    /// Trade ID, unique within a market's trade list
    pub id: String,
    pub side: TradeSide,
    pub outcome: TradeOutcome,
    pub shares: Decimal,
    /// Fill price (0.00 - 1.00)
    pub price: Decimal,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    /// Display name or address of the trader, when public
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

// ============================================================================
// Chart Types
// ============================================================================

/// Time window requested from `GET /markets/:id/chart?range=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ChartRange {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    #[default]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "all")]
    All,
}

impl ChartRange {
    pub const ALL: [ChartRange; 5] = [
        ChartRange::OneHour,
        ChartRange::OneDay,
        ChartRange::OneWeek,
        ChartRange::OneMonth,
        ChartRange::All,
    ];

    /// Query-string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartRange::OneHour => "1h",
            ChartRange::OneDay => "1d",
            ChartRange::OneWeek => "1w",
            ChartRange::OneMonth => "1m",
            ChartRange::All => "all",
        }
    }
}

impl fmt::Display for ChartRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChartRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChartRange::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown chart range: {}", s))
    }
}

/// A single point of the price chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

// ============================================================================
// Positions and Comments
// ============================================================================

/// The current user's holding in one outcome of a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub outcome: TradeOutcome,
    pub shares: Decimal,
    pub avg_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Decimal>,
}

/// A comment on a market's discussion thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub user: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_binary_orderbook() {
        let json = r#"{
            "yes": {"bids": [{"price": "0.40", "shares": "100"}], "asks": [{"price": "0.45", "shares": "50"}]},
            "no": {"bids": [], "asks": [{"price": "0.55", "shares": "20"}]}
        }"#;

        let book: Orderbook = serde_json::from_str(json).unwrap();
        assert!(!book.is_multi_outcome());

        let columns = book.columns();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].0, "yes");
        assert_eq!(columns[0].1.spread(), Some(dec!(0.05)));
        assert_eq!(columns[1].1.best_bid(), None);
    }

    #[test]
    fn test_parse_multi_outcome_orderbook() {
        let json = r#"{
            "options": [
                {"name": "Alice", "bids": [{"price": "0.30", "shares": "10"}], "asks": []},
                {"name": "Bob", "asks": [{"price": "0.70", "shares": "5"}]}
            ]
        }"#;

        let book: Orderbook = serde_json::from_str(json).unwrap();
        assert!(book.is_multi_outcome());

        let columns = book.columns();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].0, "Bob");
        assert!(columns[1].1.bids.is_empty());
        assert_eq!(columns[1].1.best_ask(), Some(dec!(0.70)));
    }

    #[test]
    fn test_trade_side_accepts_both_cases() {
        let upper: TradeSide = serde_json::from_str("\"BUY\"").unwrap();
        let lower: TradeSide = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(upper, TradeSide::Buy);
        assert_eq!(lower, TradeSide::Sell);
    }

    #[test]
    fn test_chart_range_round_trip() {
        assert_eq!("1w".parse::<ChartRange>(), Ok(ChartRange::OneWeek));
        assert_eq!("ALL".parse::<ChartRange>(), Ok(ChartRange::All));
        assert!("5y".parse::<ChartRange>().is_err());
        assert_eq!(ChartRange::default().as_str(), "1d");
    }
}
