//! Connection events - one tagged stream per client

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::types::{AccountInfo, Execution, MarketQuote, Order, Position};

/// Cloneable view of a fault, as carried on the event stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerFault {
    pub kind: ErrorKind,
    pub message: String,
    /// Set once reconnection attempts are exhausted; the client stops retrying.
    pub fatal: bool,
}

impl BrokerFault {
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            fatal: false,
        }
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for BrokerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fatal {
            write!(f, "fatal {:?}: {}", self.kind, self.message)
        } else {
            write!(f, "{:?}: {}", self.kind, self.message)
        }
    }
}

/// Everything a connection publishes, in arrival order
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum BrokerEvent {
    Connected,
    Disconnected { reason: String },
    Error(BrokerFault),
    Order(Order),
    Position(Position),
    MarketData(MarketQuote),
    Execution(Execution),
    AccountInfo(AccountInfo),
}

impl BrokerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::Connected => "connected",
            BrokerEvent::Disconnected { .. } => "disconnected",
            BrokerEvent::Error(_) => "error",
            BrokerEvent::Order(_) => "order",
            BrokerEvent::Position(_) => "position",
            BrokerEvent::MarketData(_) => "marketData",
            BrokerEvent::Execution(_) => "execution",
            BrokerEvent::AccountInfo(_) => "accountInfo",
        }
    }
}
