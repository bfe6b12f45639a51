//! Topic naming for the shared WebSocket

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const MARKET_PREFIX: &str = "market:";
const ADMIN_MARKETS: &str = "admin:markets";

/// A subscribable channel on the venue socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Per-market channel, `market:<id>`
    Market(String),
    /// Privileged channel carrying list-level activity, `admin:markets`.
    /// Only subscribable with an admin credential.
    AdminMarkets,
}

impl Topic {
    pub fn market(market_id: impl Into<String>) -> Self {
        Topic::Market(market_id.into())
    }

    /// Market id for market-scoped topics
    pub fn market_id(&self) -> Option<&str> {
        match self {
            Topic::Market(id) => Some(id),
            Topic::AdminMarkets => None,
        }
    }

    /// Whether subscribing requires an admin credential
    pub fn requires_admin(&self) -> bool {
        matches!(self, Topic::AdminMarkets)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Market(id) => write!(f, "{}{}", MARKET_PREFIX, id),
            Topic::AdminMarkets => f.write_str(ADMIN_MARKETS),
        }
    }
}

impl std::str::FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ADMIN_MARKETS {
            return Ok(Topic::AdminMarkets);
        }
        match s.strip_prefix(MARKET_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Topic::Market(id.to_string())),
            _ => Err(format!("Unknown topic: {}", s)),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
