//! Chart series view-model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use venue_core::ChartPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    /// YES price as a percentage, one decimal place
    pub yes_percent: Decimal,
    pub no_percent: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartSeries {
    pub points: Vec<SeriesPoint>,
    /// Lowest percentage on either line
    pub min: Option<Decimal>,
    /// Highest percentage on either line
    pub max: Option<Decimal>,
}

impl ChartSeries {
    pub fn latest(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn percent(price: Decimal) -> Decimal {
    (price * Decimal::ONE_HUNDRED).round_dp(1)
}

/// Build the series from a fetched chart: ordered by time, one point per
/// timestamp (the later entry wins).
pub fn build_series(points: &[ChartPoint]) -> ChartSeries {
    let mut sorted: Vec<&ChartPoint> = points.iter().collect();
    sorted.sort_by_key(|point| point.timestamp);

    let mut series: Vec<SeriesPoint> = Vec::with_capacity(sorted.len());
    for point in sorted {
        let next = SeriesPoint {
            timestamp: point.timestamp,
            yes_percent: percent(point.yes_price),
            no_percent: percent(point.no_price),
            volume: point.volume,
        };
        match series.last_mut() {
            Some(last) if last.timestamp == next.timestamp => *last = next,
            _ => series.push(next),
        }
    }

    let values = || series.iter().flat_map(|p| [p.yes_percent, p.no_percent]);
    let min = values().min();
    let max = values().max();

    ChartSeries {
        points: series,
        min,
        max,
    }
}
