//! Interactive Brokers client-portal gateway adapter
//!
//! REST-shaped requests (`method` + `endpoint`) tunnelled over the
//! persistent link; pushes are camelCase JSON objects.

use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{decimal, id, opt_decimal, text};
use crate::client::ConnectionClient;
use crate::client::protocol::{AuthProof, Push, VenueCall, VenueProtocol, millis_to_utc};
use crate::core::{
    AccountInfo, Error, Execution, MarginInfo, MarketQuote, OrderStatus, OrderUpdate, Position,
    Result, Symbol,
};

pub type IbkrClient = ConnectionClient<IbkrProtocol>;

const API_PREFIX: &str = "/v1/portal";

#[derive(Debug, Clone, Copy, Default)]
pub struct IbkrProtocol;

impl IbkrProtocol {
    pub fn new() -> Self {
        Self
    }

    fn timestamp(data: &Value) -> chrono::DateTime<chrono::Utc> {
        data.get("timestamp")
            .and_then(Value::as_i64)
            .map(millis_to_utc)
            .unwrap_or_else(chrono::Utc::now)
    }

    fn parse_position(data: &Value) -> Result<Position> {
        Ok(Position {
            symbol: Symbol::new(text(data, "symbol")?),
            quantity: decimal(data, "quantity")?,
            average_price: opt_decimal(data, "averagePrice")?.unwrap_or_default(),
            mark_price: opt_decimal(data, "marketPrice")?.unwrap_or_default(),
            unrealized_pnl: opt_decimal(data, "unrealizedPnL")?.unwrap_or_default(),
            realized_pnl: opt_decimal(data, "realizedPnL")?.unwrap_or_default(),
            timestamp: Self::timestamp(data),
        })
    }

    fn parse_quote_fields(symbol: Symbol, data: &Value) -> Result<MarketQuote> {
        let bid = opt_decimal(data, "bid")?.unwrap_or_default();
        let ask = opt_decimal(data, "ask")?.unwrap_or_default();
        let last = match opt_decimal(data, "last")? {
            Some(last) => last,
            None if bid > Decimal::ZERO && ask > Decimal::ZERO => (bid + ask) / Decimal::TWO,
            None => Decimal::ZERO,
        };
        Ok(MarketQuote {
            symbol,
            bid,
            ask,
            last,
            volume: opt_decimal(data, "volume")?.unwrap_or_default(),
            timestamp: Self::timestamp(data),
        })
    }

    fn parse_status(raw: &str) -> Result<OrderStatus> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" | "submitted" | "presubmitted" | "pendingsubmit" => Ok(OrderStatus::Pending),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            "rejected" | "inactive" => Ok(OrderStatus::Rejected),
            other => Err(Error::Protocol(format!("unknown order status '{}'", other))),
        }
    }

    fn parse_account_fields(data: &Value) -> Result<AccountInfo> {
        // margin may arrive nested or flattened
        let margin = data.get("margin").filter(|m| m.is_object()).unwrap_or(data);
        Ok(AccountInfo {
            account_id: id(data, "accountId")?,
            balance: decimal(data, "balance")?,
            equity: opt_decimal(data, "equity")?.unwrap_or_default(),
            margin: MarginInfo {
                used: opt_decimal(margin, "used")?
                    .or(opt_decimal(data, "marginUsed")?)
                    .unwrap_or_default(),
                available: opt_decimal(margin, "available")?
                    .or(opt_decimal(data, "marginAvailable")?)
                    .unwrap_or_default(),
                maintenance: opt_decimal(margin, "maintenance")?
                    .or(opt_decimal(data, "maintenanceMargin")?)
                    .unwrap_or_default(),
            },
            currency: text(data, "currency").unwrap_or_else(|_| "USD".to_string()),
        })
    }
}

impl VenueProtocol for IbkrProtocol {
    fn venue(&self) -> &'static str {
        "ibkr"
    }

    fn auth_message(&self, request_id: &str, proof: &AuthProof<'_>) -> Value {
        json!({
            "type": "auth",
            "requestId": request_id,
            "data": {
                "apiKey": proof.api_key,
                "timestamp": proof.timestamp_ms,
                "signature": proof.signature,
            },
        })
    }

    fn heartbeat_message(&self) -> Value {
        json!({"type": "heartbeat"})
    }

    fn request_message(&self, request_id: &str, call: &VenueCall) -> Value {
        let (method, endpoint, data) = match call {
            VenueCall::AccountInfo => ("GET", format!("{}/account", API_PREFIX), Value::Null),
            VenueCall::Positions => ("GET", format!("{}/positions", API_PREFIX), Value::Null),
            VenueCall::PlaceOrder(order) => (
                "POST",
                format!("{}/orders", API_PREFIX),
                json!({
                    "symbol": order.symbol.as_str(),
                    "side": order.side,
                    "quantity": order.quantity,
                    "type": order.order_type,
                    "timeInForce": order.time_in_force,
                    "price": order.price,
                    "stopPrice": order.stop_price,
                }),
            ),
            VenueCall::CancelOrder(order_id) => (
                "DELETE",
                format!("{}/orders/{}", API_PREFIX, order_id),
                Value::Null,
            ),
            VenueCall::MarketData(symbol) => (
                "GET",
                format!("{}/market-data/{}", API_PREFIX, symbol),
                Value::Null,
            ),
            VenueCall::SubscribeSymbols(symbols) => (
                "POST",
                format!("{}/market-data/subscribe", API_PREFIX),
                json!({"symbols": symbols}),
            ),
            VenueCall::SubscribeAccount => (
                "POST",
                format!("{}/account/subscribe", API_PREFIX),
                Value::Null,
            ),
        };

        let mut msg = json!({
            "type": "request",
            "requestId": request_id,
            "method": method,
            "endpoint": endpoint,
        });
        if !data.is_null() {
            msg["data"] = data;
        }
        msg
    }

    fn decode_push(&self, kind: &str, data: &Value) -> Result<Option<Push>> {
        let push = match kind.to_ascii_lowercase().as_str() {
            "marketdata" | "tick" => {
                let symbol = Symbol::new(text(data, "symbol")?);
                Push::Quote(Self::parse_quote_fields(symbol, data)?)
            }
            "execution" => Push::Execution(Execution {
                order_id: id(data, "orderId")?,
                symbol: Symbol::new(text(data, "symbol")?),
                quantity: decimal(data, "quantity")?,
                price: decimal(data, "price")?,
                commission: opt_decimal(data, "commission")?.unwrap_or_default(),
                timestamp: Self::timestamp(data),
            }),
            "position" | "positionupdate" => Push::Position(Self::parse_position(data)?),
            "accountinfo" | "balance" => Push::Account(Self::parse_account_fields(data)?),
            "order" | "orderstatus" => Push::OrderUpdate(OrderUpdate {
                order_id: id(data, "orderId")?,
                status: Self::parse_status(&text(data, "status")?)?,
                filled_quantity: opt_decimal(data, "filledQuantity")?,
                average_price: opt_decimal(data, "averagePrice")?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(push))
    }

    fn parse_account(&self, data: Value) -> Result<AccountInfo> {
        Self::parse_account_fields(&data)
    }

    fn parse_positions(&self, data: Value) -> Result<Vec<Position>> {
        let list = match &data {
            Value::Array(list) => list,
            other => other
                .get("positions")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Protocol("positions reply is not a list".to_string()))?,
        };
        list.iter().map(Self::parse_position).collect()
    }

    fn parse_order_id(&self, data: &Value) -> Result<String> {
        id(data, "orderId").or_else(|_| id(data, "id"))
    }

    fn parse_quote(&self, symbol: &Symbol, data: Value) -> Result<MarketQuote> {
        Self::parse_quote_fields(symbol.clone(), &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderRequest, Side};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_requests_are_rest_shaped() {
        let p = IbkrProtocol::new();
        let msg = p.request_message("r1", &VenueCall::CancelOrder("99".into()));
        assert_eq!(msg["method"], "DELETE");
        assert_eq!(msg["endpoint"], "/v1/portal/orders/99");
        assert!(msg.get("data").is_none());

        let order = OrderRequest::market(Symbol::new("AAPL"), Side::Buy, dec("10"));
        let msg = p.request_message("r2", &VenueCall::PlaceOrder(order));
        assert_eq!(msg["method"], "POST");
        assert_eq!(msg["endpoint"], "/v1/portal/orders");
        assert_eq!(msg["data"]["type"], "market");
        assert_eq!(msg["data"]["side"], "buy");

        let msg = p.request_message("r3", &VenueCall::MarketData(Symbol::new("AAPL")));
        assert_eq!(msg["endpoint"], "/v1/portal/market-data/AAPL");
    }

    #[test]
    fn test_auth_nests_proof() {
        let proof = AuthProof {
            api_key: "ib-key",
            account_id: None,
            timestamp_ms: 42,
            signature: "abc".into(),
        };
        let msg = IbkrProtocol::new().auth_message("a1", &proof);
        assert_eq!(msg["type"], "auth");
        assert_eq!(msg["data"]["apiKey"], "ib-key");
        assert_eq!(msg["data"]["timestamp"], 42);
    }

    #[test]
    fn test_decode_order_status_push() {
        let data = json!({"orderId": 5, "status": "Cancelled", "filledQuantity": "0"});
        match IbkrProtocol::new().decode_push("order", &data).unwrap() {
            Some(Push::OrderUpdate(u)) => {
                assert_eq!(u.order_id, "5");
                assert_eq!(u.status, OrderStatus::Cancelled);
                assert_eq!(u.filled_quantity, Some(Decimal::ZERO));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quote_without_last_uses_mid() {
        let quote = IbkrProtocol::new()
            .parse_quote(&Symbol::new("AAPL"), json!({"bid": 100.0, "ask": 100.2}))
            .unwrap();
        assert_eq!(quote.last, dec("100.1"));
        assert!(quote.is_valid());

        let empty = IbkrProtocol::new()
            .parse_quote(&Symbol::new("AAPL"), json!({}))
            .unwrap();
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_account_with_flat_margin_fields() {
        let data = json!({"accountId": "U123", "balance": 25000, "equity": 25100,
                          "marginUsed": 1000, "marginAvailable": 24000, "currency": "USD"});
        let account = IbkrProtocol::new().parse_account(data).unwrap();
        assert_eq!(account.account_id, "U123");
        assert_eq!(account.margin.used, dec("1000"));
        assert_eq!(account.margin.available, dec("24000"));
    }

    #[test]
    fn test_positions_accept_bare_list() {
        let data = json!([{"symbol": "AAPL", "quantity": -5, "averagePrice": 190.5}]);
        let positions = IbkrProtocol::new().parse_positions(data).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec("-5"));
    }
}
