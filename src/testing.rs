//! In-memory transport, scripted venue and mock broker for tests

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{broadcast, oneshot};

use crate::client::transport::{Link, Transport};
use crate::core::{
    AccountInfo, BrokerConnection, BrokerEvent, ConnectionStatus, Error, MarginInfo, MarketQuote,
    Order, OrderRequest, Position, Result, Symbol,
};

/// How the fake venue answers a request
pub(crate) enum Reply {
    Data(Value),
    Error(String),
    Silent,
}

type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

struct LiveLink {
    to_client: flume::Sender<String>,
    _kill: oneshot::Sender<()>,
}

/// Transport whose far end is a scripted venue task
pub(crate) struct MockTransport {
    opens: AtomicUsize,
    refuse: AtomicBool,
    heartbeats: Arc<AtomicBool>,
    responder: Arc<Mutex<Responder>>,
    received: Arc<Mutex<Vec<Value>>>,
    links: Mutex<Vec<LiveLink>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            heartbeats: Arc::new(AtomicBool::new(true)),
            responder: Arc::new(Mutex::new(Arc::new(|_: &Value| Reply::Data(json!({}))))),
            received: Arc::new(Mutex::new(Vec::new())),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn respond(&self, f: impl Fn(&Value) -> Reply + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(f);
    }

    pub fn set_heartbeats(&self, on: bool) {
        self.heartbeats.store(on, Ordering::SeqCst);
    }

    pub fn refuse_opens(&self, on: bool) {
        self.refuse.store(on, Ordering::SeqCst);
    }

    /// Every `open` call, refused ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Send a raw message to every live link
    pub fn push(&self, msg: Value) {
        let text = msg.to_string();
        for link in self.links.lock().iter() {
            let _ = link.to_client.send(text.clone());
        }
    }

    /// Drop every link from the venue side
    pub fn kill_links(&self) {
        self.links.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<Link> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let (out_tx, out_rx) = flume::unbounded::<String>();
        let (in_tx, in_rx) = flume::unbounded::<String>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let to_client = in_tx.clone();
        let heartbeats = self.heartbeats.clone();
        let responder = self.responder.clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    msg = out_rx.recv_async() => {
                        let Ok(text) = msg else { break };
                        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                        received.lock().push(value.clone());

                        let is_heartbeat = value["type"]
                            .as_str()
                            .is_some_and(|t| t.eq_ignore_ascii_case("heartbeat"));
                        if is_heartbeat {
                            if heartbeats.load(Ordering::SeqCst) {
                                let _ = to_client.send(json!({"type": "heartbeat"}).to_string());
                            }
                            continue;
                        }
                        let Some(request_id) = value["requestId"].as_str() else { continue };
                        let respond = responder.lock().clone();
                        let reply = match respond(&value) {
                            Reply::Data(data) => json!({"requestId": request_id, "data": data}),
                            Reply::Error(error) => json!({"requestId": request_id, "error": error}),
                            Reply::Silent => continue,
                        };
                        let _ = to_client.send(reply.to_string());
                    }
                }
            }
        });

        let mut links = self.links.lock();
        links.retain(|link| !link.to_client.is_disconnected());
        links.push(LiveLink {
            to_client: in_tx,
            _kill: kill_tx,
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Everything currently buffered on a subscription
pub(crate) fn drain(rx: &mut broadcast::Receiver<BrokerEvent>) -> Vec<BrokerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

pub(crate) fn quote(symbol: &str, bid: Decimal, ask: Decimal) -> MarketQuote {
    MarketQuote {
        symbol: Symbol::new(symbol),
        bid,
        ask,
        last: (bid + ask) / Decimal::TWO,
        volume: Decimal::ZERO,
        timestamp: Utc::now(),
    }
}

pub(crate) fn account(balance: Decimal) -> AccountInfo {
    AccountInfo {
        account_id: "acct".to_string(),
        balance,
        equity: balance,
        margin: MarginInfo::default(),
        currency: "USD".to_string(),
    }
}

pub(crate) fn position(symbol: &str, quantity: Decimal) -> Position {
    Position {
        symbol: Symbol::new(symbol),
        quantity,
        average_price: Decimal::ONE,
        mark_price: Decimal::ONE,
        unrealized_pnl: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        timestamp: Utc::now(),
    }
}

/// Scripted `BrokerConnection` for orchestrator tests
pub(crate) struct MockBroker {
    key: String,
    status: RwLock<ConnectionStatus>,
    events: broadcast::Sender<BrokerEvent>,
    pub fail_connect: AtomicBool,
    pub reject_orders: AtomicBool,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub quote: RwLock<Option<MarketQuote>>,
    pub account: RwLock<Option<AccountInfo>>,
    pub positions: RwLock<Vec<Position>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    next_id: AtomicU32,
    orders: Mutex<HashMap<String, Order>>,
}

impl MockBroker {
    pub fn new(key: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            key: key.to_string(),
            status: RwLock::new(ConnectionStatus::Disconnected),
            events,
            fail_connect: AtomicBool::new(false),
            reject_orders: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            quote: RwLock::new(Some(quote("EURUSD", Decimal::ONE, Decimal::TWO))),
            account: RwLock::new(Some(account(Decimal::from(10_000)))),
            positions: RwLock::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            orders: Mutex::new(HashMap::new()),
        })
    }

    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    /// Link drops underneath the client
    pub fn drop_link(&self, reason: &str) {
        *self.status.write() = ConnectionStatus::Disconnected;
        self.emit(BrokerEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }

    pub fn set_fail_connect(&self, on: bool) {
        self.fail_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_reject_orders(&self, on: bool) {
        self.reject_orders.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnection for MockBroker {
    fn key(&self) -> &str {
        &self.key
    }

    fn venue(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            *self.status.write() = ConnectionStatus::Error;
            return Err(Error::Connection("connection refused".to_string()));
        }
        let was = std::mem::replace(&mut *self.status.write(), ConnectionStatus::Connected);
        if was != ConnectionStatus::Connected {
            self.emit(BrokerEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let was = std::mem::replace(&mut *self.status.write(), ConnectionStatus::Disconnected);
        if was == ConnectionStatus::Connected {
            self.emit(BrokerEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        self.account
            .read()
            .clone()
            .ok_or_else(|| Error::Venue("account unavailable".to_string()))
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.read().clone())
    }

    async fn place_order(&self, request: OrderRequest) -> Result<Order> {
        self.placed.lock().push(request.clone());
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(Error::OrderRejected("rejected by mock".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let order = Order::from_request(id.clone(), &request, Utc::now());
        self.orders.lock().insert(id, order.clone());
        self.emit(BrokerEvent::Order(order.clone()));
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.cancelled.lock().push(order_id.to_string());
        if self.orders.lock().remove(order_id).is_none() {
            return Err(Error::Venue(format!("unknown order {}", order_id)));
        }
        Ok(())
    }

    async fn get_market_data(&self, symbol: &Symbol) -> Result<MarketQuote> {
        self.quote
            .read()
            .clone()
            .filter(|q| &q.symbol == symbol)
            .ok_or_else(|| Error::NoMarketData(symbol.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}
