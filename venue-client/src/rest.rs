//! Venue REST API client
//!
//! Each endpoint returns a complete, self-consistent snapshot of one cache
//! slice. The [`MarketApi`] trait is the seam the sync engine depends on;
//! [`RestClient`] is the reqwest-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use venue_core::{
    ChartPoint, ChartRange, Comment, MarketSnapshot, MarketSummary, Orderbook, Position,
    SyncError, SyncResult, TradeRecord,
};

use crate::config::ClientConfig;

/// Read access to the venue backend
#[async_trait]
pub trait MarketApi: Send + Sync {
    /// `GET /markets`
    async fn list_markets(&self) -> SyncResult<Vec<MarketSummary>>;

    /// `GET /markets/:id`
    async fn get_market(&self, market_id: &str) -> SyncResult<MarketSnapshot>;

    /// `GET /markets/:id/chart?range=`
    async fn get_chart(&self, market_id: &str, range: ChartRange) -> SyncResult<Vec<ChartPoint>>;

    /// `GET /trades/orderbook/:id`
    async fn get_orderbook(&self, market_id: &str) -> SyncResult<Orderbook>;

    /// `GET /markets/:id/trades`
    async fn get_trades(&self, market_id: &str) -> SyncResult<Vec<TradeRecord>>;

    /// `GET /markets/:id/positions`
    async fn get_positions(&self, market_id: &str) -> SyncResult<Vec<Position>>;

    /// `GET /comments/market/:id`
    async fn get_comments(&self, market_id: &str) -> SyncResult<Vec<Comment>>;
}

/// reqwest-backed [`MarketApi`]
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    bearer_token: Arc<RwLock<Option<String>>>,
}

impl RestClient {
    /// Create a client from configuration
    pub fn new(config: &ClientConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            bearer_token: Arc::new(RwLock::new(config.credentials.bearer_token.clone())),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Install the bearer token once the session provides one
    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write() = token;
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching {}", url);

        let token = self.bearer_token.read().clone();
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::network(format!("Failed to fetch {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::not_found(path.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::auth(format!("{} returned {}", path, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::api(path, status.as_u16(), body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::parse(format!("Failed to parse {} response: {}", path, e)))
    }
}

#[async_trait]
impl MarketApi for RestClient {
    #[instrument(skip(self))]
    async fn list_markets(&self) -> SyncResult<Vec<MarketSummary>> {
        self.get_json("/markets").await
    }

    #[instrument(skip(self))]
    async fn get_market(&self, market_id: &str) -> SyncResult<MarketSnapshot> {
        self.get_json(&format!("/markets/{}", market_id)).await
    }

    #[instrument(skip(self))]
    async fn get_chart(&self, market_id: &str, range: ChartRange) -> SyncResult<Vec<ChartPoint>> {
        self.get_json(&format!("/markets/{}/chart?range={}", market_id, range))
            .await
    }

    #[instrument(skip(self))]
    async fn get_orderbook(&self, market_id: &str) -> SyncResult<Orderbook> {
        self.get_json(&format!("/trades/orderbook/{}", market_id))
            .await
    }

    #[instrument(skip(self))]
    async fn get_trades(&self, market_id: &str) -> SyncResult<Vec<TradeRecord>> {
        self.get_json(&format!("/markets/{}/trades", market_id)).await
    }

    #[instrument(skip(self))]
    async fn get_positions(&self, market_id: &str) -> SyncResult<Vec<Position>> {
        self.get_json(&format!("/markets/{}/positions", market_id))
            .await
    }

    #[instrument(skip(self))]
    async fn get_comments(&self, market_id: &str) -> SyncResult<Vec<Comment>> {
        self.get_json(&format!("/comments/market/{}", market_id))
            .await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
