//! MetaTrader bridge adapter
//!
//! Talks to an MT4/MT5 bridge over a command-style protocol
//! (`GET_ACCOUNT_INFO`, `PLACE_ORDER`, ...). The bridge has no quote RPC:
//! quotes arrive as `TICK` pushes after `SUBSCRIBE_SYMBOLS` and are served
//! from the client's tick cache.

use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{decimal, id, opt_decimal, text};
use crate::client::ConnectionClient;
use crate::client::protocol::{
    AuthProof, Push, VenueCall, VenueProtocol, secs_to_utc,
};
use crate::core::config::Terminal;
use crate::core::{
    AccountInfo, BrokerConfig, Error, Execution, MarginInfo, MarketQuote, OrderRequest,
    OrderType, Position, Result, Symbol,
};

pub type MetaTraderClient = ConnectionClient<MetaTraderProtocol>;

const ORDER_COMMENT: &str = "brokerlink";
const MAX_DEVIATION_POINTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct MetaTraderProtocol {
    account_id: String,
    terminal: Terminal,
    symbols: Vec<Symbol>,
}

impl MetaTraderProtocol {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            account_id: config.account_id.clone().unwrap_or_default(),
            terminal: config.terminal,
            symbols: config.symbols.iter().map(Symbol::new).collect(),
        }
    }

    /// MT order type code; direction travels separately as `side`
    fn order_type_code(order_type: OrderType) -> u8 {
        match order_type {
            OrderType::Market => 0,
            OrderType::Limit => 2,
            OrderType::Stop => 3,
            OrderType::StopLimit => 4,
        }
    }

    /// MT volumes are unsigned with a buy/sell `type`
    fn signed_volume(data: &Value) -> Result<Decimal> {
        let volume = decimal(data, "volume")?;
        let is_sell = match data.get("type") {
            Some(Value::String(s)) => s.eq_ignore_ascii_case("sell"),
            // ORDER_TYPE_SELL = 1
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        };
        Ok(if is_sell { -volume.abs() } else { volume.abs() })
    }

    fn timestamp(data: &Value) -> chrono::DateTime<chrono::Utc> {
        match data.get("time").and_then(Value::as_i64) {
            Some(secs) => secs_to_utc(secs),
            None => chrono::Utc::now(),
        }
    }

    fn parse_position(data: &Value) -> Result<Position> {
        let swap = opt_decimal(data, "swap")?.unwrap_or_default();
        let commission = opt_decimal(data, "commission")?.unwrap_or_default();
        Ok(Position {
            symbol: Symbol::new(text(data, "symbol")?),
            quantity: Self::signed_volume(data)?,
            average_price: decimal(data, "openPrice")?,
            mark_price: opt_decimal(data, "currentPrice")?.unwrap_or_default(),
            unrealized_pnl: opt_decimal(data, "profit")?.unwrap_or_default(),
            realized_pnl: swap + commission,
            timestamp: Self::timestamp(data),
        })
    }

    fn parse_balance(&self, data: &Value) -> Result<AccountInfo> {
        let account_id = match id(data, "accountId") {
            Ok(account_id) => account_id,
            Err(_) => self.account_id.clone(),
        };
        Ok(AccountInfo {
            account_id,
            balance: decimal(data, "balance")?,
            equity: opt_decimal(data, "equity")?.unwrap_or_default(),
            margin: MarginInfo {
                used: opt_decimal(data, "margin")?.unwrap_or_default(),
                available: opt_decimal(data, "freeMargin")?.unwrap_or_default(),
                maintenance: opt_decimal(data, "marginLevel")?.unwrap_or_default(),
            },
            currency: text(data, "currency").unwrap_or_else(|_| "USD".to_string()),
        })
    }

    fn order_payload(&self, request_id: &str, order: &OrderRequest) -> Value {
        json!({
            "type": "request",
            "requestId": request_id,
            "command": "PLACE_ORDER",
            "accountId": self.account_id,
            "symbol": order.symbol.as_str(),
            "side": order.side.to_string(),
            "orderType": Self::order_type_code(order.order_type),
            "volume": order.quantity,
            "price": order.price.unwrap_or_default(),
            "sl": order.stop_price.unwrap_or_default(),
            "tp": 0,
            "deviation": MAX_DEVIATION_POINTS,
            "timeInForce": order.time_in_force,
            "comment": ORDER_COMMENT,
        })
    }
}

impl VenueProtocol for MetaTraderProtocol {
    fn venue(&self) -> &'static str {
        "metatrader"
    }

    fn auth_message(&self, request_id: &str, proof: &AuthProof<'_>) -> Value {
        json!({
            "type": "auth",
            "requestId": request_id,
            "command": "AUTHENTICATE",
            "accountId": proof.account_id.unwrap_or(self.account_id.as_str()),
            "terminal": self.terminal,
            "apiKey": proof.api_key,
            "timestamp": proof.timestamp_ms,
            "signature": proof.signature,
        })
    }

    fn heartbeat_message(&self) -> Value {
        json!({"type": "heartbeat", "command": "PING"})
    }

    fn request_message(&self, request_id: &str, call: &VenueCall) -> Value {
        let (command, extra) = match call {
            VenueCall::AccountInfo => ("GET_ACCOUNT_INFO", json!({})),
            VenueCall::Positions => ("GET_POSITIONS", json!({})),
            VenueCall::PlaceOrder(order) => return self.order_payload(request_id, order),
            VenueCall::CancelOrder(order_id) => {
                let order_id = order_id
                    .parse::<u64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(order_id.as_str()));
                ("CANCEL_ORDER", json!({"orderId": order_id}))
            }
            // quotes come from the TICK stream; ask the bridge to stream it
            VenueCall::MarketData(symbol) => {
                ("SUBSCRIBE_SYMBOLS", json!({"symbols": [symbol.as_str()]}))
            }
            VenueCall::SubscribeSymbols(symbols) => {
                let symbols: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();
                ("SUBSCRIBE_SYMBOLS", json!({"symbols": symbols}))
            }
            VenueCall::SubscribeAccount => ("SUBSCRIBE_ACCOUNT", json!({})),
        };

        let mut msg = json!({
            "type": "request",
            "requestId": request_id,
            "command": command,
            "accountId": self.account_id,
        });
        if let (Value::Object(msg), Value::Object(extra)) = (&mut msg, extra) {
            msg.extend(extra);
        }
        msg
    }

    fn decode_push(&self, kind: &str, data: &Value) -> Result<Option<Push>> {
        let push = match kind.to_ascii_uppercase().as_str() {
            "TICK" => {
                let bid = decimal(data, "bid")?;
                let ask = decimal(data, "ask")?;
                Push::Quote(MarketQuote {
                    symbol: Symbol::new(text(data, "symbol")?),
                    bid,
                    ask,
                    last: (bid + ask) / Decimal::TWO,
                    volume: Decimal::ZERO,
                    timestamp: chrono::Utc::now(),
                })
            }
            "EXECUTION" => Push::Execution(Execution {
                order_id: id(data, "orderId")?,
                symbol: Symbol::new(text(data, "symbol")?),
                quantity: Self::signed_volume(data)?,
                price: decimal(data, "price")?,
                commission: opt_decimal(data, "commission")?.unwrap_or_default(),
                timestamp: Self::timestamp(data),
            }),
            "POSITION_UPDATE" | "POSITION" => Push::Position(Self::parse_position(data)?),
            "BALANCE_UPDATE" | "BALANCE" => Push::Account(self.parse_balance(data)?),
            _ => return Ok(None),
        };
        Ok(Some(push))
    }

    fn parse_account(&self, data: Value) -> Result<AccountInfo> {
        self.parse_balance(&data)
    }

    fn parse_positions(&self, data: Value) -> Result<Vec<Position>> {
        let list = data
            .get("positions")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Protocol("positions reply without 'positions'".to_string()))?;
        list.iter().map(Self::parse_position).collect()
    }

    fn parse_order_id(&self, data: &Value) -> Result<String> {
        id(data, "orderId")
    }

    fn parse_quote(&self, symbol: &Symbol, _data: Value) -> Result<MarketQuote> {
        Err(Error::NoMarketData(symbol.clone()))
    }

    fn quotes_from_stream(&self) -> bool {
        true
    }

    fn session_calls(&self) -> Vec<VenueCall> {
        let mut calls = Vec::with_capacity(2);
        if !self.symbols.is_empty() {
            calls.push(VenueCall::SubscribeSymbols(self.symbols.clone()));
        }
        calls.push(VenueCall::SubscribeAccount);
        calls
    }
}
