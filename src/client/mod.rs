//! Connection client - one persistent, authenticated venue link
//!
//! `ConnectionClient` is generic over a [`VenueProtocol`]. It owns the link
//! state machine, the signed handshake, request correlation, heartbeats and
//! reconnection with exponential backoff; the protocol only frames and
//! decodes messages.

pub mod protocol;
pub mod transport;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{
    AccountInfo, BrokerConfig, BrokerConnection, BrokerEvent, BrokerFault, ClientSettings,
    ConnectionStatus, Error, ErrorKind, MarketQuote, Order, OrderRequest, OrderStatus,
    OrderUpdate, Position, Result, Symbol,
};
use crate::signer::HmacSigner;

use protocol::{AuthProof, Inbound, Push, VenueCall, VenueProtocol, classify};
use transport::Transport;

/// Internal link state; `Reconnecting` and `Failed` are reported as
/// `Disconnected` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl LinkState {
    fn external(self) -> ConnectionStatus {
        match self {
            LinkState::Disconnected | LinkState::Reconnecting { .. } => {
                ConnectionStatus::Disconnected
            }
            LinkState::Connecting => ConnectionStatus::Connecting,
            LinkState::Connected => ConnectionStatus::Connected,
            LinkState::Failed => ConnectionStatus::Error,
        }
    }
}

#[derive(Default)]
struct Tasks {
    io: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

type Reply = oneshot::Sender<Result<Value>>;

struct Shared<P> {
    key: String,
    config: BrokerConfig,
    protocol: P,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    signer: HmacSigner,

    state: RwLock<LinkState>,
    /// Bumped on every new link and every teardown; callbacks from older
    /// links are ignored.
    generation: AtomicU64,
    attempts: AtomicU32,
    connect_lock: AsyncMutex<()>,
    outbound: Mutex<Option<flume::Sender<String>>>,
    pending: Mutex<HashMap<String, Reply>>,
    tasks: Mutex<Tasks>,
    last_heartbeat: Mutex<Instant>,
    events: broadcast::Sender<BrokerEvent>,

    orders: RwLock<HashMap<String, Order>>,
    positions: RwLock<HashMap<Symbol, Position>>,
    quotes: RwLock<HashMap<Symbol, MarketQuote>>,
    account: RwLock<Option<AccountInfo>>,
}

/// Venue connection generic over its wire protocol
pub struct ConnectionClient<P: VenueProtocol> {
    inner: Arc<Shared<P>>,
}

impl<P: VenueProtocol> ConnectionClient<P> {
    pub fn new(
        config: BrokerConfig,
        protocol: P,
        transport: Arc<dyn Transport>,
        settings: ClientSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(16));
        let signer = HmacSigner::new(config.api_key.clone(), config.api_secret.clone());
        Self {
            inner: Arc::new(Shared {
                key: config.credential_key(),
                config,
                protocol,
                transport,
                settings,
                signer,
                state: RwLock::new(LinkState::Disconnected),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                connect_lock: AsyncMutex::new(()),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Tasks::default()),
                last_heartbeat: Mutex::new(Instant::now()),
                events,
                orders: RwLock::new(HashMap::new()),
                positions: RwLock::new(HashMap::new()),
                quotes: RwLock::new(HashMap::new()),
                account: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Locally tracked order
    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.inner.orders.read().get(order_id).cloned()
    }

    /// Last account snapshot seen on this connection
    pub fn cached_account(&self) -> Option<AccountInfo> {
        self.inner.account.read().clone()
    }
}

impl<P: VenueProtocol> Shared<P> {
    fn emit(&self, event: BrokerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &Error) {
        self.emit(BrokerEvent::Error(BrokerFault::from_error(error)));
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self.tasks.lock().reconnect.take() {
            handle.abort();
        }
    }

    fn fail_pending(&self, reason: &str) {
        let pending: Vec<Reply> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(Error::Connection(reason.to_string())));
        }
    }

    /// Stop io + heartbeat, close the link, fail in-flight requests.
    fn teardown(&self, reason: &str) {
        {
            let mut tasks = self.tasks.lock();
            if let Some(handle) = tasks.io.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
        }
        self.outbound.lock().take();
        self.fail_pending(reason);
        // quotes from a dead link must not answer health checks
        self.quotes.write().clear();
    }

    fn send(&self, msg: &Value) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection(format!("{} not connected", self.key)))?;
        let text = msg.to_string();
        debug!("[{}] -> {}", self.key, text);
        tx.send(text)
            .map_err(|_| Error::Connection(format!("{} link closed", self.key)))
    }

    async fn roundtrip(&self, request_id: String, msg: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.send(&msg) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(self.settings.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(format!(
                "{} closed before response",
                self.key
            ))),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "request {} to {} timed out",
                    request_id, self.key
                )))
            }
        }
    }

    /// Next streamed quote for `symbol`, bounded by the request timeout
    async fn first_tick(
        &self,
        symbol: &Symbol,
        events: &mut broadcast::Receiver<BrokerEvent>,
    ) -> Result<MarketQuote> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(BrokerEvent::MarketData(quote)) if &quote.symbol == symbol => {
                        return Some(quote);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let cached = self.quotes.read().get(symbol).cloned();
                        if cached.is_some() {
                            return cached;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match timeout(self.settings.request_timeout(), wait).await {
            Ok(Some(quote)) => Ok(quote),
            _ => {
                debug!("[{}] no {} tick after subscribing", self.key, symbol);
                Err(Error::NoMarketData(symbol.clone()))
            }
        }
    }

    async fn call(&self, call: VenueCall) -> Result<Value> {
        if *self.state.read() != LinkState::Connected {
            return Err(Error::Connection(format!("{} not connected", self.key)));
        }
        let request_id = Uuid::new_v4().to_string();
        let msg = self.protocol.request_message(&request_id, &call);
        let is_order = matches!(call, VenueCall::PlaceOrder(_));

        match self.roundtrip(request_id, msg).await {
            Err(Error::Venue(reason)) if is_order => Err(Error::OrderRejected(reason)),
            other => other,
        }
    }

    /// Open a link, authenticate, start heartbeats. Caller holds `connect_lock`.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let link = timeout(
            self.settings.connect_timeout(),
            self.transport.open(&self.config.server_url),
        )
        .await
        .map_err(|_| Error::Timeout(format!("connect to {} timed out", self.key)))??;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.outbound.lock() = Some(link.outbound);
        let io = tokio::spawn(self.clone().read_loop(generation, link.inbound));
        self.tasks.lock().io = Some(io);

        let timestamp_ms = Utc::now().timestamp_millis();
        let proof = AuthProof {
            api_key: &self.config.api_key,
            account_id: self.config.account_id.as_deref(),
            timestamp_ms,
            signature: self.signer.handshake_signature(timestamp_ms),
        };
        let request_id = Uuid::new_v4().to_string();
        let auth = self.protocol.auth_message(&request_id, &proof);

        if let Err(e) = self.roundtrip(request_id, auth).await {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.teardown("handshake failed");
            return Err(match e {
                Error::Venue(reason) => Error::Authentication(reason),
                other => other,
            });
        }

        *self.last_heartbeat.lock() = Instant::now();
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(generation));
        self.tasks.lock().heartbeat = Some(heartbeat);

        *self.state.write() = LinkState::Connected;
        self.attempts.store(0, Ordering::SeqCst);
        info!("[{}] connected to {}", self.key, self.config.server_url);
        self.emit(BrokerEvent::Connected);

        for call in self.protocol.session_calls() {
            let name = call.name();
            if let Err(e) = self.call(call).await {
                warn!("[{}] session call {} failed: {}", self.key, name, e);
                self.emit_error(&e);
            }
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, generation: u64, inbound: flume::Receiver<String>) {
        while let Ok(text) = inbound.recv_async().await {
            if self.current_generation() != generation {
                return;
            }
            self.handle_text(&text);
        }
        self.on_link_lost(generation, "connection closed");
    }

    /// Pings every interval and wakes at the silence deadline in between
    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let period = self.settings.heartbeat_interval();
        let limit = self.settings.heartbeat_timeout();
        let mut next_ping = Instant::now() + period;
        loop {
            // first instant at which the silence exceeds the limit
            let deadline = *self.last_heartbeat.lock() + limit + Duration::from_millis(1);
            sleep_until(next_ping.min(deadline)).await;
            if self.current_generation() != generation {
                return;
            }
            let silent_for = self.last_heartbeat.lock().elapsed();
            if silent_for > limit {
                warn!(
                    "[{}] no heartbeat for {:?}, dropping link",
                    self.key, silent_for
                );
                self.emit_error(&Error::Timeout("heartbeat timeout".to_string()));
                self.on_link_lost(generation, "heartbeat timeout");
                return;
            }
            if Instant::now() >= next_ping {
                next_ping += period;
                if let Err(e) = self.send(&self.protocol.heartbeat_message()) {
                    debug!("[{}] heartbeat send failed: {}", self.key, e);
                }
            }
        }
    }

    /// Link died underneath us. Must not await: it may run on the io or
    /// heartbeat task that `teardown` aborts.
    fn on_link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.current_generation() != generation {
            return;
        }
        let was_connected = {
            let mut state = self.state.write();
            if *state == LinkState::Connected {
                *state = LinkState::Reconnecting { attempt: 0 };
                true
            } else {
                false
            }
        };
        if !was_connected {
            // mid-handshake: let the pending auth fail fast
            self.fail_pending(reason);
            return;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown(reason);
        warn!("[{}] link lost: {}", self.key, reason);
        self.emit(BrokerEvent::Disconnected {
            reason: reason.to_string(),
        });

        let handle = tokio::spawn(self.clone().reconnect_loop());
        self.tasks.lock().reconnect = Some(handle);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let max = self.settings.max_reconnect_attempts;
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > max {
                *self.state.write() = LinkState::Failed;
                error!("[{}] giving up after {} reconnect attempts", self.key, max);
                self.emit(BrokerEvent::Error(BrokerFault::fatal(
                    ErrorKind::Connection,
                    format!("reconnect attempts exhausted after {}", max),
                )));
                return;
            }

            *self.state.write() = LinkState::Reconnecting { attempt };
            let delay = self.settings.reconnect_delay(attempt);
            info!(
                "[{}] reconnect attempt {}/{} in {:?}",
                self.key, attempt, max, delay
            );
            sleep(delay).await;

            let _guard = self.connect_lock.lock().await;
            match self.establish().await {
                Ok(()) => return,
                Err(e) => {
                    warn!("[{}] reconnect attempt {} failed: {}", self.key, attempt, e);
                    self.emit_error(&e);
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        debug!("[{}] <- {}", self.key, text);
        let msg: Value = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] unparseable message: {}", self.key, e);
                self.emit_error(&Error::Protocol(format!("unparseable message: {}", e)));
                return;
            }
        };

        match classify(msg) {
            Inbound::Response { request_id, result } => {
                match self.pending.lock().remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(Error::Venue));
                    }
                    None => debug!("[{}] response for unknown request {}", self.key, request_id),
                }
            }
            Inbound::Heartbeat => *self.last_heartbeat.lock() = Instant::now(),
            Inbound::Push { kind, data } => match self.protocol.decode_push(&kind, &data) {
                Ok(Some(push)) => self.apply_push(push),
                Ok(None) => debug!("[{}] ignoring push {}", self.key, kind),
                Err(e) => {
                    warn!("[{}] bad {} push: {}", self.key, kind, e);
                    self.emit_error(&e);
                }
            },
            Inbound::Unknown => debug!("[{}] unclassified message", self.key),
        }
    }

    fn apply_push(&self, push: Push) {
        match push {
            Push::Quote(quote) => {
                self.quotes.write().insert(quote.symbol.clone(), quote.clone());
                self.emit(BrokerEvent::MarketData(quote));
            }
            Push::Execution(execution) => {
                let updated = {
                    let mut orders = self.orders.write();
                    orders
                        .get_mut(&execution.order_id)
                        .and_then(|order| order.apply_execution(&execution).then(|| order.clone()))
                };
                self.emit(BrokerEvent::Execution(execution));
                if let Some(order) = updated {
                    self.emit(BrokerEvent::Order(order));
                }
            }
            Push::Position(position) => {
                {
                    let mut positions = self.positions.write();
                    if position.is_flat() {
                        positions.remove(&position.symbol);
                    } else {
                        positions.insert(position.symbol.clone(), position.clone());
                    }
                }
                self.emit(BrokerEvent::Position(position));
            }
            Push::Account(account) => {
                *self.account.write() = Some(account.clone());
                self.emit(BrokerEvent::AccountInfo(account));
            }
            Push::OrderUpdate(update) => self.apply_order_update(&update),
        }
    }

    fn apply_order_update(&self, update: &OrderUpdate) {
        let updated = {
            let mut orders = self.orders.write();
            orders
                .get_mut(&update.order_id)
                .and_then(|order| order.apply_update(update).then(|| order.clone()))
        };
        match updated {
            Some(order) => self.emit(BrokerEvent::Order(order)),
            None => debug!("[{}] update for unknown or closed order {}", self.key, update.order_id),
        }
    }
}

#[async_trait]
impl<P: VenueProtocol> BrokerConnection for ConnectionClient<P> {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn venue(&self) -> &str {
        self.inner.protocol.venue()
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_reconnect();
        let _guard = inner.connect_lock.lock().await;

        if *inner.state.read() == LinkState::Connected {
            return Ok(());
        }
        *inner.state.write() = LinkState::Connecting;
        inner.attempts.store(0, Ordering::SeqCst);

        match inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *inner.state.write() = LinkState::Failed;
                warn!("[{}] connect failed: {}", inner.key, e);
                inner.emit_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_reconnect();
        let _guard = inner.connect_lock.lock().await;

        let previous = std::mem::replace(&mut *inner.state.write(), LinkState::Disconnected);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.teardown("disconnected");
        inner.attempts.store(0, Ordering::SeqCst);

        if matches!(
            previous,
            LinkState::Connected | LinkState::Connecting | LinkState::Reconnecting { .. }
        ) {
            info!("[{}] disconnected", inner.key);
            inner.emit(BrokerEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.state.read().external()
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let data = self.inner.call(VenueCall::AccountInfo).await?;
        let account = self.inner.protocol.parse_account(data)?;
        *self.inner.account.write() = Some(account.clone());
        Ok(account)
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        let data = self.inner.call(VenueCall::Positions).await?;
        let positions = self.inner.protocol.parse_positions(data)?;
        {
            let mut cache = self.inner.positions.write();
            cache.clear();
            for position in positions.iter().filter(|p| !p.is_flat()) {
                cache.insert(position.symbol.clone(), position.clone());
            }
        }
        Ok(positions)
    }

    async fn place_order(&self, request: OrderRequest) -> Result<Order> {
        info!(
            "[{}] placing {} {} {} {}",
            self.inner.key, request.order_type, request.side, request.quantity, request.symbol
        );
        let submitted = Utc::now();
        let data = self
            .inner
            .call(VenueCall::PlaceOrder(request.clone()))
            .await?;
        let order_id = self.inner.protocol.parse_order_id(&data)?;
        let order = Order::from_request(order_id, &request, submitted);

        self.inner
            .orders
            .write()
            .insert(order.id.clone(), order.clone());
        self.inner.emit(BrokerEvent::Order(order.clone()));
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.inner
            .call(VenueCall::CancelOrder(order_id.to_string()))
            .await?;
        self.inner.apply_order_update(&OrderUpdate {
            order_id: order_id.to_string(),
            status: OrderStatus::Cancelled,
            filled_quantity: None,
            average_price: None,
        });
        Ok(())
    }

    async fn get_market_data(&self, symbol: &Symbol) -> Result<MarketQuote> {
        if self.inner.protocol.quotes_from_stream() {
            if *self.inner.state.read() != LinkState::Connected {
                return Err(Error::Connection(format!("{} not connected", self.inner.key)));
            }
            // subscribed before the cache check so the first tick can't slip by
            let mut events = self.inner.events.subscribe();
            let cached = self.inner.quotes.read().get(symbol).cloned();
            if let Some(quote) = cached {
                return Ok(quote);
            }
            self.inner
                .call(VenueCall::MarketData(symbol.clone()))
                .await?;
            return self.inner.first_tick(symbol, &mut events).await;
        }
        let data = self
            .inner
            .call(VenueCall::MarketData(symbol.clone()))
            .await?;
        let quote = self.inner.protocol.parse_quote(symbol, data)?;
        self.inner
            .quotes
            .write()
            .insert(symbol.clone(), quote.clone());
        Ok(quote)
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }
}

impl<P: VenueProtocol> Drop for ConnectionClient<P> {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock();
        for handle in [tasks.io.take(), tasks.heartbeat.take(), tasks.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}
