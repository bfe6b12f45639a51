//! Prediction venue market watcher
//!
//! Mounts live views of the markets named in `VENUE_MARKETS` and logs their
//! order books and prices as the sync engine reconciles REST fetches, socket
//! pushes and polling.

mod display;

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use venue_client::{ClientConfig, RestClient, SubscriptionManager};
use venue_core::ChartRange;
use venue_sync::{
    CacheChange, MarketView, OrderbookPresenter, SliceKey, SliceKind, SyncEngine,
};

/// One mounted market and its render state
struct Watched {
    view: MarketView,
    presenter: OrderbookPresenter,
}

impl Watched {
    fn log_book(&mut self, now: Instant, refresh_only: bool) {
        let Some(book) = self.view.orderbook().data else {
            return;
        };
        let rendered = if refresh_only {
            self.presenter.refresh(&book, now)
        } else {
            self.presenter.render(&book, now)
        };
        for line in display::book_lines(&rendered) {
            info!("[{}] {}", self.view.market_id(), line);
        }
    }

    fn log_price(&self) {
        if let Some(snapshot) = self.view.snapshot().data {
            info!("{}", display::price_line(&snapshot));
        }
    }
}

fn market_ids() -> Vec<String> {
    std::env::var("VENUE_MARKETS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn chart_range() -> anyhow::Result<ChartRange> {
    match std::env::var("VENUE_CHART_RANGE") {
        Ok(value) => value
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("VENUE_CHART_RANGE"),
        Err(_) => Ok(ChartRange::default()),
    }
}

fn handle_change(
    change: &CacheChange,
    watched: &mut HashMap<String, Watched>,
    engine: &SyncEngine,
) {
    match &change.key {
        SliceKey::Market { market_id, kind } => {
            let Some(entry) = watched.get_mut(market_id) else {
                return;
            };
            match kind {
                SliceKind::Orderbook => entry.log_book(Instant::now(), false),
                SliceKind::Snapshot => entry.log_price(),
                SliceKind::Trades => debug!(
                    "[{}] {} trades cached, {} pushed",
                    market_id,
                    entry.view.trades().data.map(|t| t.len()).unwrap_or(0),
                    entry.view.trade_count()
                ),
                SliceKind::Chart => {
                    if let Some(series) = entry.view.chart_series() {
                        debug!(
                            "[{}] chart {} points, range {:?}..{:?}",
                            market_id,
                            series.points.len(),
                            series.min,
                            series.max
                        );
                    }
                }
                SliceKind::Positions | SliceKind::Comments => {}
            }
        }
        SliceKey::MarketsList => {
            let state = engine.cache().markets_list();
            if let Some(error) = state.error {
                warn!("Markets list unavailable: {}", error);
            }
            for market in state.data.unwrap_or_default() {
                debug!("{}", display::summary_line(&market));
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,venue_watch=debug")),
        )
        .init();

    info!("Starting venue watcher");

    let config = ClientConfig::from_env().context("Invalid client configuration")?;
    if config.credentials.has_admin() {
        info!("Admin credential found - markets list will follow admin:markets");
    }

    let rest = Arc::new(RestClient::new(&config)?);
    let subscriptions = SubscriptionManager::new(config.clone());
    let engine = SyncEngine::new(rest, subscriptions.clone());

    let range = chart_range()?;
    let ids = market_ids();
    if ids.is_empty() {
        warn!("VENUE_MARKETS is empty - watching the markets list only");
    }

    let mut changes = engine.changes();
    let mut connection = subscriptions.connection_state();

    let mut watched = HashMap::new();
    for id in ids {
        let view = engine.mount_market(id.clone(), range)?;
        info!("Watching market {} ({})", id, range);
        watched.insert(
            id,
            Watched {
                view,
                presenter: OrderbookPresenter::new(),
            },
        );
    }
    let markets_list = engine.mount_markets_list()?;

    loop {
        let next_expiry = watched
            .values()
            .filter_map(|w| w.presenter.next_expiry())
            .min();
        let flash_timer = async move {
            match next_expiry {
                Some(at) => sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }

            received = changes.recv() => {
                match received {
                    Ok(change) => handle_change(&change, &mut watched, &engine),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} cache changes, redrawing", skipped);
                        let now = Instant::now();
                        for entry in watched.values_mut() {
                            entry.log_book(now, false);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connection.borrow_and_update() {
                    info!("Live updates connected");
                } else {
                    warn!(
                        "Live updates lost - polling every {:?}",
                        markets_list.refetch_interval().unwrap_or_default()
                    );
                }
            }

            _ = flash_timer => {
                let now = Instant::now();
                for entry in watched.values_mut() {
                    if entry.presenter.next_expiry().is_some_and(|at| at <= now) {
                        entry.log_book(now, true);
                    }
                }
            }
        }
    }

    drop(markets_list);
    watched.clear();
    subscriptions.shutdown().await;

    Ok(())
}
