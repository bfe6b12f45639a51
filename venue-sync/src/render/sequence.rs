//! Order-book update counter
//!
//! Counts structural changes of the book seen by one mounted view. The first
//! book observed is the baseline (0); every later book whose structural hash
//! differs bumps the counter. A new view starts again from 0.

use tracing::trace;
use venue_core::Orderbook;

/// md5 over the serialized book
pub fn structural_hash(book: &Orderbook) -> Option<md5::Digest> {
    serde_json::to_vec(book).ok().map(md5::compute)
}

#[derive(Debug, Default)]
pub struct UpdateSequence {
    last_hash: Option<md5::Digest>,
    value: u64,
}

impl UpdateSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a book and return the counter after it
    pub fn observe(&mut self, book: &Orderbook) -> u64 {
        let Some(hash) = structural_hash(book) else {
            return self.value;
        };

        match self.last_hash {
            None => {}
            Some(last) if last == hash => return self.value,
            Some(_) => {
                self.value += 1;
                trace!("[Feed Cache] Order book changed, sequence {}", self.value);
            }
        }
        self.last_hash = Some(hash);
        self.value
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use venue_core::{OrderBookSide, PriceLevel};

    fn book(shares: rust_decimal::Decimal) -> Orderbook {
        Orderbook::Binary {
            yes: OrderBookSide {
                bids: vec![PriceLevel::new(dec!(0.4), shares)],
                asks: vec![],
            },
            no: OrderBookSide::default(),
        }
    }

    #[test]
    fn test_counts_only_structural_changes() {
        let mut sequence = UpdateSequence::new();
        assert_eq!(sequence.observe(&book(dec!(10))), 0);
        assert_eq!(sequence.observe(&book(dec!(10))), 0);
        assert_eq!(sequence.observe(&book(dec!(11))), 1);
        assert_eq!(sequence.observe(&book(dec!(11))), 1);
        assert_eq!(sequence.observe(&book(dec!(10))), 2);
        assert_eq!(sequence.value(), 2);
    }

    #[test]
    fn test_fresh_sequence_starts_at_zero() {
        let mut mounted = UpdateSequence::new();
        mounted.observe(&book(dec!(1)));
        mounted.observe(&book(dec!(2)));

        let mut remounted = UpdateSequence::new();
        assert_eq!(remounted.observe(&book(dec!(2))), 0);
    }
}
