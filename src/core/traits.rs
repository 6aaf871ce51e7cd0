//! Core traits - The capability set every venue connection provides

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::events::BrokerEvent;
use crate::core::{
    AccountInfo, ConnectionStatus, MarketQuote, Order, OrderRequest, Position, Result, Symbol,
};

/// Venue connection trait - implemented by every protocol adapter
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Credential identity (`<venue>:<api key>`)
    fn key(&self) -> &str;

    /// Venue family name (e.g., "metatrader", "ibkr")
    fn venue(&self) -> &str;

    /// Open the connection and authenticate
    async fn connect(&self) -> Result<()>;

    /// Close the connection; cancels timers, reconnection and pending requests
    async fn disconnect(&self) -> Result<()>;

    /// Current externally visible status
    fn status(&self) -> ConnectionStatus;

    /// Fetch account balance and margin
    async fn get_account_info(&self) -> Result<AccountInfo>;

    /// Fetch open positions
    async fn get_positions(&self) -> Result<Vec<Position>>;

    /// Place an order
    async fn place_order(&self, order: OrderRequest) -> Result<Order>;

    /// Cancel an order
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Current quote for a symbol
    async fn get_market_data(&self, symbol: &Symbol) -> Result<MarketQuote>;

    /// Subscribe to the event stream
    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent>;
}
