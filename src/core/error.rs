//! Error handling - Typed failures for connectivity, orders and failover

use thiserror::Error;

use crate::core::types::Symbol;

pub type Result<T> = std::result::Result<T, Error>;

/// Brokerlink error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (including unsupported venue names)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Handshake rejected by the venue
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Request exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Venue-reported order rejection
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Recovery health check failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Venue-reported error on a non-order call
    #[error("Venue error: {0}")]
    Venue(String),

    /// Malformed inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No quote cached for the symbol
    #[error("No market data available for {0}")]
    NoMarketData(Symbol),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Coarse classification carried on error events, which must be `Clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Authentication,
    Timeout,
    OrderRejected,
    HealthCheckFailed,
    Venue,
    Protocol,
    InvalidState,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Connection(_) | Error::WebSocket(_) => ErrorKind::Connection,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::OrderRejected(_) => ErrorKind::OrderRejected,
            Error::HealthCheckFailed(_) => ErrorKind::HealthCheckFailed,
            Error::Venue(_) | Error::NoMarketData(_) => ErrorKind::Venue,
            Error::Protocol(_) | Error::Serialization(_) => ErrorKind::Protocol,
            Error::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}
