//! WebSocket frame types for real-time market data
//!
//! Client -> server frames are small tagged objects (`AUTH`, `SUBSCRIBE`,
//! `UNSUBSCRIBE`). Server -> client frames are `{topic, type, ...payload}`
//! and are decoded into an [`UpdateEvent`]. Decoding never fails on an
//! unrecognized `type` or a payload that does not match its `type`; both
//! become [`UpdateEvent::Unknown`] so the caller can fall back to a full
//! invalidation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SyncError, Topic, TradeRecord};

// ============================================================================
// Client -> Server Frames
// ============================================================================

/// Frames sent from the client to the venue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Authenticate the socket with the current bearer token
    Auth { token: String },
    /// Start receiving events for a topic
    Subscribe { topic: Topic },
    /// Stop receiving events for a topic
    Unsubscribe { topic: Topic },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server -> Client Frames
// ============================================================================

/// Partial price patch carried by `PRICE_UPDATE`. Absent fields keep their
/// cached value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceUpdate {
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub liquidity: Option<Decimal>,
}

impl PriceUpdate {
    /// Both prices, only when the patch carries both
    pub fn prices(&self) -> Option<(Decimal, Decimal)> {
        match (self.yes_price, self.no_price) {
            (Some(yes), Some(no)) => Some((yes, no)),
            _ => None,
        }
    }
}

/// Tagged push event
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    PriceUpdate(PriceUpdate),
    NewTrade(TradeRecord),
    NewOrder,
    OrderCancelled,
    CommentAdded,
    CommentDeleted,
    /// Admin topic only
    MarketsUpdated,
    /// Admin topic only
    MarketActivity,
    /// Unrecognized type, or a known type with a payload that did not decode
    Unknown { event_type: String },
}

impl UpdateEvent {
    /// Decode the payload of a frame whose `type` is `event_type`
    pub fn from_payload(event_type: &str, payload: &Value) -> Self {
        let decoded = match event_type {
            "PRICE_UPDATE" => serde_json::from_value::<PriceUpdate>(payload.clone())
                .ok()
                .map(UpdateEvent::PriceUpdate),
            "NEW_TRADE" => payload
                .get("trade")
                .and_then(|t| serde_json::from_value::<TradeRecord>(t.clone()).ok())
                .map(UpdateEvent::NewTrade),
            "NEW_ORDER" => Some(UpdateEvent::NewOrder),
            "ORDER_CANCELLED" => Some(UpdateEvent::OrderCancelled),
            "COMMENT_ADDED" => Some(UpdateEvent::CommentAdded),
            "COMMENT_DELETED" => Some(UpdateEvent::CommentDeleted),
            "MARKETS_UPDATED" => Some(UpdateEvent::MarketsUpdated),
            "MARKET_ACTIVITY" => Some(UpdateEvent::MarketActivity),
            _ => None,
        };

        decoded.unwrap_or_else(|| UpdateEvent::Unknown {
            event_type: event_type.to_string(),
        })
    }

    /// Wire name of this event
    pub fn event_type(&self) -> &str {
        match self {
            UpdateEvent::PriceUpdate(_) => "PRICE_UPDATE",
            UpdateEvent::NewTrade(_) => "NEW_TRADE",
            UpdateEvent::NewOrder => "NEW_ORDER",
            UpdateEvent::OrderCancelled => "ORDER_CANCELLED",
            UpdateEvent::CommentAdded => "COMMENT_ADDED",
            UpdateEvent::CommentDeleted => "COMMENT_DELETED",
            UpdateEvent::MarketsUpdated => "MARKETS_UPDATED",
            UpdateEvent::MarketActivity => "MARKET_ACTIVITY",
            UpdateEvent::Unknown { event_type } => event_type,
        }
    }

    /// Events that are only meaningful on the admin topic
    pub fn is_admin_event(&self) -> bool {
        matches!(self, UpdateEvent::MarketsUpdated | UpdateEvent::MarketActivity)
    }
}

/// A decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    /// `None` for control frames and for topics this client does not know
    pub topic: Option<Topic>,
    pub event: UpdateEvent,
}

impl ServerFrame {
    pub fn new(topic: Topic, event: UpdateEvent) -> Self {
        Self {
            topic: Some(topic),
            event,
        }
    }

    /// Decode a text frame. Only text that is not a JSON object is an error.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::parse(format!("Invalid frame: {}", e)))?;

        if !value.is_object() {
            return Err(SyncError::parse(format!("Frame is not an object: {}", text)));
        }

        let topic = value
            .get("topic")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse::<Topic>().ok());

        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        Ok(Self {
            topic,
            event: UpdateEvent::from_payload(event_type, &value),
        })
    }
}
