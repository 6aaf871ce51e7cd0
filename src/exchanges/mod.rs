//! Venue adapters - wire protocols for each supported venue family

pub mod ibkr;
pub mod metatrader;

pub use ibkr::{IbkrClient, IbkrProtocol};
pub use metatrader::{MetaTraderClient, MetaTraderProtocol};

use rust_decimal::Decimal;
use serde_json::Value;

use crate::core::{Error, Result};

/// Decimal from a JSON number or numeric string, exact for decimal literals
pub(crate) fn decimal(data: &Value, field: &str) -> Result<Decimal> {
    opt_decimal(data, field)?
        .ok_or_else(|| Error::Protocol(format!("missing numeric field '{}'", field)))
}

pub(crate) fn opt_decimal(data: &Value, field: &str) -> Result<Option<Decimal>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => parse_decimal(field, &n.to_string()).map(Some),
        Some(Value::String(s)) => parse_decimal(field, s).map(Some),
        Some(other) => Err(Error::Protocol(format!(
            "field '{}' is not numeric: {}",
            field, other
        ))),
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| Error::Protocol(format!("field '{}': bad number {}: {}", field, raw, e)))
}

pub(crate) fn text(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol(format!("missing string field '{}'", field)))
}

/// Identifier that venues send as either a string or an integer
pub(crate) fn id(data: &Value, field: &str) -> Result<String> {
    match data.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::Protocol(format!("missing id field '{}'", field))),
    }
}
