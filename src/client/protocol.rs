//! Venue protocol seam - what differs between venue families
//!
//! The connection client owns the state machine, heartbeats, correlation ids
//! and reconnection. A `VenueProtocol` only knows how to frame outbound
//! messages and decode inbound payloads for one venue family.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::{
    AccountInfo, Execution, MarketQuote, OrderRequest, OrderUpdate, Position, Result, Symbol,
};

/// Signed credential proof for the auth handshake
#[derive(Debug, Clone)]
pub struct AuthProof<'a> {
    pub api_key: &'a str,
    pub account_id: Option<&'a str>,
    pub timestamp_ms: i64,
    pub signature: String,
}

/// RPC-style calls a client can make
#[derive(Debug, Clone, PartialEq)]
pub enum VenueCall {
    AccountInfo,
    Positions,
    PlaceOrder(OrderRequest),
    CancelOrder(String),
    MarketData(Symbol),
    SubscribeSymbols(Vec<Symbol>),
    SubscribeAccount,
}

impl VenueCall {
    pub fn name(&self) -> &'static str {
        match self {
            VenueCall::AccountInfo => "account_info",
            VenueCall::Positions => "positions",
            VenueCall::PlaceOrder(_) => "place_order",
            VenueCall::CancelOrder(_) => "cancel_order",
            VenueCall::MarketData(_) => "market_data",
            VenueCall::SubscribeSymbols(_) => "subscribe_symbols",
            VenueCall::SubscribeAccount => "subscribe_account",
        }
    }
}

/// Unsolicited venue message
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Quote(MarketQuote),
    Execution(Execution),
    Position(Position),
    Account(AccountInfo),
    OrderUpdate(OrderUpdate),
}

pub trait VenueProtocol: Send + Sync + 'static {
    /// Venue family name, also the registry dispatch key
    fn venue(&self) -> &'static str;

    fn auth_message(&self, request_id: &str, proof: &AuthProof<'_>) -> Value;

    fn heartbeat_message(&self) -> Value;

    fn request_message(&self, request_id: &str, call: &VenueCall) -> Value;

    /// Decode a push tagged `kind`; `Ok(None)` for tags this venue ignores
    fn decode_push(&self, kind: &str, data: &Value) -> Result<Option<Push>>;

    fn parse_account(&self, data: Value) -> Result<AccountInfo>;

    fn parse_positions(&self, data: Value) -> Result<Vec<Position>>;

    /// Venue order id from a place-order reply
    fn parse_order_id(&self, data: &Value) -> Result<String>;

    fn parse_quote(&self, symbol: &Symbol, data: Value) -> Result<MarketQuote>;

    /// Venue has no quote RPC; quotes are served from the tick cache
    fn quotes_from_stream(&self) -> bool {
        false
    }

    /// Calls issued right after authentication
    fn session_calls(&self) -> Vec<VenueCall> {
        Vec::new()
    }
}

/// Envelope-level classification shared by all venues
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Response {
        request_id: String,
        result: std::result::Result<Value, String>,
    },
    Heartbeat,
    Push {
        kind: String,
        data: Value,
    },
    Unknown,
}

pub(crate) fn classify(mut msg: Value) -> Inbound {
    if let Some(request_id) = msg.get("requestId").and_then(Value::as_str) {
        let request_id = request_id.to_string();
        let error = msg
            .get("error")
            .filter(|err| !err.is_null())
            .map(|err| match err {
                Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            });
        let result = match error {
            Some(message) => Err(message),
            None => Ok(msg.get_mut("data").map(Value::take).unwrap_or(Value::Null)),
        };
        return Inbound::Response { request_id, result };
    }

    let Some(kind) = msg.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Inbound::Unknown;
    };
    if kind.eq_ignore_ascii_case("heartbeat") {
        return Inbound::Heartbeat;
    }
    let data = if msg.get("data").is_some() {
        msg["data"].take()
    } else {
        msg
    };
    Inbound::Push { kind, data }
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub(crate) fn secs_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}
