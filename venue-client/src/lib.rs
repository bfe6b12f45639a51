//! Venue access for the market-sync client
//!
//! This crate provides the REST client for the venue backend and the
//! subscription manager that owns the single shared WebSocket.
//!
//! Configuration is read from environment variables, see [`config`]:
//! - `VENUE_API_URL` / `VENUE_WS_URL` - endpoints
//! - `VENUE_TOKEN` - bearer token
//! - `VENUE_ADMIN_TOKEN` - admin credential for the `admin:markets` topic

pub mod backoff;
pub mod config;
pub mod rest;
pub mod subscription;

pub use backoff::ReconnectPolicy;
pub use config::{ClientConfig, ConfigError, Credentials};
pub use rest::{MarketApi, RestClient};
pub use subscription::{EventHandler, HandlerId, Subscription, SubscriptionManager, TopicRegistry};
