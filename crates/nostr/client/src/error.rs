//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("relay already present: {0}")]
    DuplicateRelay(String),

    #[error("unknown relay: {0}")]
    UnknownRelay(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("subscription id already used: {0}")]
    DuplicateSubscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for ClientError {
    fn from(error: toml::de::Error) -> Self {
        ClientError::Config(error.to_string())
    }
}

impl From<toml::ser::Error> for ClientError {
    fn from(error: toml::ser::Error) -> Self {
        ClientError::Config(error.to_string())
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
