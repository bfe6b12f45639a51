//! Errors shared by the venue crates
//!
//! Fetch errors end up as text on a cache slice, so every variant renders a
//! complete message on its own.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The venue answered with a non-success status
    #[error("{endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Request failed: {0}")]
    Network(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("No such resource: {0}")]
    NotFound(String),

    /// Socket-level failure of the shared connection
    #[error("Socket error: {0}")]
    Connection(String),

    #[error("Bad configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    pub fn api(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        SyncError::Api {
            endpoint: endpoint.into(),
            status,
            body: body.into(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SyncError::Network(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        SyncError::Auth(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        SyncError::Parse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SyncError::NotFound(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        SyncError::Connection(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Failures the next poll or push-driven refetch may clear on its own
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Connection(_) => true,
            SyncError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Parse(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(SyncError::network("reset").is_transient());
        assert!(SyncError::api("/markets", 503, "busy").is_transient());
        assert!(SyncError::api("/markets", 429, "slow down").is_transient());
        assert!(!SyncError::api("/markets", 400, "bad range").is_transient());
        assert!(!SyncError::not_found("/markets/9").is_transient());
        assert!(!SyncError::auth("expired").is_transient());
    }

    #[test]
    fn test_api_message_names_endpoint_and_status() {
        let error = SyncError::api("/comments/market/42", 500, "boom");
        assert_eq!(error.to_string(), "/comments/market/42 returned 500: boom");
    }

    #[test]
    fn test_json_errors_become_parse_errors() {
        let error: SyncError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(error, SyncError::Parse(_)));
    }
}
