//! Failover orchestrator - primary/backup pairing with health-driven switching
//!
//! A single dispatch task owns the decision state. It consumes both clients'
//! event streams and the command queue one message at a time, runs the
//! recovery and cleanup timers, and supervises mirror jobs. The handle only
//! sends commands and reads snapshots.

pub mod health;
pub mod reconcile;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, interval_at, sleep_until};
use tracing::{debug, error, info, warn};

use crate::core::{
    BrokerConnection, BrokerEvent, BrokerFault, ConnectionStatus, Error, Execution,
    FailoverConfig, Order, OrderRequest, OrderStatus, Position, Result, Symbol, SyncStrategy,
};

pub use health::{Breach, HealthSnapshot, HealthWindow};
use reconcile::{MIRROR_TAG, converge_order, net_by_symbol, sync_positions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerSide {
    Primary,
    Backup,
}

impl BrokerSide {
    pub fn other(self) -> Self {
        match self {
            BrokerSide::Primary => BrokerSide::Backup,
            BrokerSide::Backup => BrokerSide::Primary,
        }
    }
}

impl std::fmt::Display for BrokerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerSide::Primary => write!(f, "primary"),
            BrokerSide::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Order,
    Position,
}

/// Orchestrator notifications
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FailoverEvent {
    Initialized,
    BrokerConnected { side: BrokerSide },
    BrokerDisconnected { side: BrokerSide, reason: String },
    BrokerError { side: BrokerSide, fault: BrokerFault },
    BrokerExecution { side: BrokerSide, execution: Execution },
    FailoverCompleted { from: BrokerSide, to: BrokerSide, reason: String },
    FailoverFailed { reason: String },
    RecoveryCompleted,
    RecoveryFailed { reason: String },
    SyncFailed { target: BrokerSide, failed_legs: usize, reason: String },
    MirrorFailed { kind: MirrorKind, reason: String },
}

impl FailoverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FailoverEvent::Initialized => "initialized",
            FailoverEvent::BrokerConnected { .. } => "broker:connected",
            FailoverEvent::BrokerDisconnected { .. } => "broker:disconnected",
            FailoverEvent::BrokerError { .. } => "broker:error",
            FailoverEvent::BrokerExecution { .. } => "broker:execution",
            FailoverEvent::FailoverCompleted { .. } => "failover:completed",
            FailoverEvent::FailoverFailed { .. } => "failover:failed",
            FailoverEvent::RecoveryCompleted => "recovery:completed",
            FailoverEvent::RecoveryFailed { .. } => "recovery:failed",
            FailoverEvent::SyncFailed { .. } => "sync:failed",
            FailoverEvent::MirrorFailed { .. } => "mirror:failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverStatus {
    pub active: BrokerSide,
    pub primary_status: ConnectionStatus,
    pub backup_status: ConnectionStatus,
    pub sync_strategy: SyncStrategy,
    pub failover_enabled: bool,
    pub recovery_pending: bool,
    pub primary_health: HealthSnapshot,
    pub backup_health: HealthSnapshot,
}

/// Shared with the handle for snapshot reads; written only by the dispatcher
#[derive(Debug)]
struct State {
    active: BrokerSide,
    enabled: bool,
    recovery_pending: bool,
    primary: HealthWindow,
    backup: HealthWindow,
}

impl State {
    fn window(&mut self, side: BrokerSide) -> &mut HealthWindow {
        match side {
            BrokerSide::Primary => &mut self.primary,
            BrokerSide::Backup => &mut self.backup,
        }
    }
}

enum Command {
    Initialize(oneshot::Sender<Result<()>>),
    Failover {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    RecordOrder {
        side: BrokerSide,
        latency_ms: f64,
        error: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Disconnect,
    Error,
    Fatal,
}

/// Handle to the dispatch task
pub struct FailoverOrchestrator {
    primary: Arc<dyn BrokerConnection>,
    backup: Arc<dyn BrokerConnection>,
    sync_strategy: SyncStrategy,
    commands: flume::Sender<Command>,
    events: broadcast::Sender<FailoverEvent>,
    state: Arc<RwLock<State>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverOrchestrator {
    /// Spawns the dispatch task; must be called inside a tokio runtime.
    pub fn new(
        primary: Arc<dyn BrokerConnection>,
        backup: Arc<dyn BrokerConnection>,
        config: FailoverConfig,
    ) -> Self {
        let (commands, command_rx) = flume::unbounded();
        let (events, _) = broadcast::channel(1024);
        let state = Arc::new(RwLock::new(State {
            active: BrokerSide::Primary,
            enabled: true,
            recovery_pending: false,
            primary: HealthWindow::default(),
            backup: HealthWindow::default(),
        }));

        let dispatcher = Dispatcher {
            primary_rx: primary.subscribe(),
            backup_rx: backup.subscribe(),
            primary_live: true,
            backup_live: true,
            primary: primary.clone(),
            backup: backup.clone(),
            sync_strategy: config.sync_strategy,
            config,
            state: state.clone(),
            events: events.clone(),
            recovery_at: None,
            mirrors: JoinSet::new(),
            mirrored: HashSet::new(),
            mirror_book: BTreeMap::new(),
            book_epoch: 0,
            settled: HashSet::new(),
        };
        let sync_strategy = dispatcher.sync_strategy;
        let task = tokio::spawn(dispatcher.run(command_rx));

        Self {
            primary,
            backup,
            sync_strategy,
            commands,
            events,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send_async(make(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Connect the primary (and the backup under `full` sync)
    pub async fn initialize(&self) -> Result<()> {
        self.request(Command::Initialize)
            .await
            .unwrap_or_else(|| Err(Error::InvalidState("orchestrator is shut down".to_string())))
    }

    /// Switch to the backup. Returns false if already there or the switch failed.
    pub async fn failover(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.request(|reply| Command::Failover { reason, reply })
            .await
            .unwrap_or(false)
    }

    /// Place on the active side; latency and failures feed its health window
    pub async fn place_order(&self, request: OrderRequest) -> Result<Order> {
        let side = self.active_side();
        let broker = self.broker(side).clone();

        let started = Instant::now();
        let result = broker.place_order(request).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let error = result.as_ref().err().map(ToString::to_string);

        // the breach check finishes before the caller can place again
        self.request(|reply| Command::RecordOrder {
            side,
            latency_ms,
            error,
            reply,
        })
        .await;
        result
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.active_broker().cancel_order(order_id).await
    }

    pub fn active_side(&self) -> BrokerSide {
        self.state.read().active
    }

    pub fn active_broker(&self) -> Arc<dyn BrokerConnection> {
        self.broker(self.active_side()).clone()
    }

    fn broker(&self, side: BrokerSide) -> &Arc<dyn BrokerConnection> {
        match side {
            BrokerSide::Primary => &self.primary,
            BrokerSide::Backup => &self.backup,
        }
    }

    pub fn status(&self) -> FailoverStatus {
        let now = Instant::now();
        let state = self.state.read();
        FailoverStatus {
            active: state.active,
            primary_status: self.primary.status(),
            backup_status: self.backup.status(),
            sync_strategy: self.sync_strategy,
            failover_enabled: state.enabled,
            recovery_pending: state.recovery_pending,
            primary_health: state.primary.snapshot(now),
            backup_health: state.backup.snapshot(now),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    /// Disable failover, stop timers and mirror jobs, disconnect both sides
    pub async fn shutdown(&self) {
        self.request(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Failover dispatcher ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for FailoverOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// A finished mirror job and the signed quantity it was meant to add
struct MirrorOutcome {
    book_epoch: u64,
    kind: MirrorKind,
    symbol: Symbol,
    quantity: Decimal,
    result: Result<()>,
}

struct Dispatcher {
    primary: Arc<dyn BrokerConnection>,
    backup: Arc<dyn BrokerConnection>,
    primary_rx: broadcast::Receiver<BrokerEvent>,
    backup_rx: broadcast::Receiver<BrokerEvent>,
    primary_live: bool,
    backup_live: bool,
    config: FailoverConfig,
    sync_strategy: SyncStrategy,
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<FailoverEvent>,
    recovery_at: Option<Instant>,
    mirrors: JoinSet<MirrorOutcome>,
    /// Order ids already reproduced on the inactive side
    mirrored: HashSet<String>,
    /// Net quantity per symbol the inactive side holds or has been sent
    mirror_book: BTreeMap<Symbol, Decimal>,
    /// Bumped on every reload; stale mirror jobs don't touch the new book
    book_epoch: u64,
    /// Orders whose fill outcome is already in a health window
    settled: HashSet<(BrokerSide, String)>,
}

impl Dispatcher {
    async fn run(mut self, commands: flume::Receiver<Command>) {
        let period = self.config.metrics_cleanup_period();
        let mut cleanup = interval_at(Instant::now() + period, period);

        loop {
            let recovery_at = self.recovery_at;
            let recovery = async move {
                match recovery_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.primary_rx.recv(), if self.primary_live => {
                    self.on_recv(BrokerSide::Primary, event).await;
                }
                event = self.backup_rx.recv(), if self.backup_live => {
                    self.on_recv(BrokerSide::Backup, event).await;
                }
                command = commands.recv_async() => match command {
                    Ok(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Ok(command) => self.on_command(command).await,
                    Err(_) => {
                        // handle dropped without shutdown
                        self.shutdown().await;
                        return;
                    }
                },
                _ = recovery => self.attempt_recovery().await,
                _ = cleanup.tick() => self.prune(),
                Some(joined) = self.mirrors.join_next(), if !self.mirrors.is_empty() => {
                    self.on_mirror_done(joined);
                }
            }
        }
    }

    fn emit(&self, event: FailoverEvent) {
        debug!("Failover event: {}", event.name());
        let _ = self.events.send(event);
    }

    fn active(&self) -> BrokerSide {
        self.state.read().active
    }

    fn broker(&self, side: BrokerSide) -> &Arc<dyn BrokerConnection> {
        match side {
            BrokerSide::Primary => &self.primary,
            BrokerSide::Backup => &self.backup,
        }
    }

    fn schedule_recovery(&mut self, at: Instant) {
        self.recovery_at = Some(at);
        self.state.write().recovery_pending = true;
    }

    async fn on_recv(
        &mut self,
        side: BrokerSide,
        event: std::result::Result<BrokerEvent, broadcast::error::RecvError>,
    ) {
        match event {
            Ok(event) => self.on_broker_event(side, event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Dropped {} events from {} broker", skipped, side);
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("{} broker event stream closed", side);
                match side {
                    BrokerSide::Primary => self.primary_live = false,
                    BrokerSide::Backup => self.backup_live = false,
                }
            }
        }
    }

    async fn on_broker_event(&mut self, side: BrokerSide, event: BrokerEvent) {
        let now = Instant::now();
        let is_active = side == self.active();
        let enabled = self.state.read().enabled;

        match event {
            BrokerEvent::Connected => self.emit(FailoverEvent::BrokerConnected { side }),
            BrokerEvent::Disconnected { reason } => {
                self.state.write().window(side).record_disconnect(now);
                self.emit(FailoverEvent::BrokerDisconnected {
                    side,
                    reason: reason.clone(),
                });
                if is_active && enabled {
                    self.on_active_fault(Trigger::Disconnect, reason).await;
                }
            }
            BrokerEvent::Error(fault) => {
                self.state.write().window(side).record_error(now);
                let trigger = if fault.fatal { Trigger::Fatal } else { Trigger::Error };
                let reason = fault.to_string();
                self.emit(FailoverEvent::BrokerError { side, fault });
                if is_active && enabled {
                    self.on_active_fault(trigger, reason).await;
                }
            }
            BrokerEvent::Execution(execution) => {
                self.settle(side, &execution.order_id, now, true);
                self.emit(FailoverEvent::BrokerExecution { side, execution });
            }
            BrokerEvent::Order(order) => {
                if order.status == OrderStatus::Rejected {
                    self.settle(side, &order.id, now, false);
                }
                if is_active && self.sync_strategy == SyncStrategy::Full {
                    self.mirror_order(&order);
                }
            }
            BrokerEvent::Position(position) => {
                if is_active && self.sync_strategy == SyncStrategy::Full {
                    self.mirror_position(position);
                }
            }
            BrokerEvent::MarketData(_) | BrokerEvent::AccountInfo(_) => {}
        }
    }

    /// First outcome per order counts; partial fills and late rejects don't
    fn settle(&mut self, side: BrokerSide, order_id: &str, now: Instant, filled: bool) {
        if self.settled.insert((side, order_id.to_string())) {
            self.state.write().window(side).record_fill(now, filled);
        }
    }

    async fn on_active_fault(&mut self, trigger: Trigger, detail: String) {
        match self.active() {
            BrokerSide::Primary => {
                let breach = {
                    let state = self.state.read();
                    state.primary.breach(Instant::now(), &self.config.thresholds)
                };
                let reason = match (breach, trigger) {
                    (Some(breach), _) => Some(breach.to_string()),
                    (None, Trigger::Disconnect) => Some(format!("primary disconnected: {}", detail)),
                    (None, Trigger::Fatal) => Some(format!("primary failed: {}", detail)),
                    (None, Trigger::Error) => None,
                };
                if let Some(reason) = reason {
                    self.failover(reason).await;
                }
            }
            BrokerSide::Backup => {
                if trigger != Trigger::Error {
                    info!("Active backup lost ({}), attempting recovery now", detail);
                    self.schedule_recovery(Instant::now());
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initialize(reply) => {
                let result = self.initialize().await;
                let _ = reply.send(result);
            }
            Command::Failover { reason, reply } => {
                let switched = self.failover(reason).await;
                let _ = reply.send(switched);
            }
            Command::RecordOrder {
                side,
                latency_ms,
                error,
                reply,
            } => {
                {
                    let now = Instant::now();
                    let mut state = self.state.write();
                    let window = state.window(side);
                    window.record_latency(latency_ms);
                    if error.is_some() {
                        window.record_error(now);
                        window.record_fill(now, false);
                    }
                }
                let enabled = self.state.read().enabled;
                if let Some(error) = error {
                    if side == self.active() && enabled {
                        self.on_active_fault(Trigger::Error, error).await;
                    }
                }
                let _ = reply.send(());
            }
            // handled by the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        self.primary.connect().await?;
        if self.sync_strategy == SyncStrategy::Full {
            self.backup.connect().await?;
            self.reload_mirror_book().await;
        }
        info!(
            "Failover initialized: primary={} backup={} sync={}",
            self.primary.key(),
            self.backup.key(),
            self.sync_strategy
        );
        self.emit(FailoverEvent::Initialized);
        Ok(())
    }

    async fn failover(&mut self, reason: String) -> bool {
        if self.active() == BrokerSide::Backup {
            debug!("Failover requested while on backup: {}", reason);
            return false;
        }
        warn!("Failing over to backup: {}", reason);

        if self.backup.status() != ConnectionStatus::Connected {
            if let Err(e) = self.backup.connect().await {
                error!("Failover failed, backup unreachable: {}", e);
                self.emit(FailoverEvent::FailoverFailed {
                    reason: e.to_string(),
                });
                return false;
            }
        }

        if self.sync_strategy != SyncStrategy::None {
            self.sync(BrokerSide::Primary, BrokerSide::Backup).await;
        }

        self.state.write().active = BrokerSide::Backup;
        self.reload_mirror_book().await;
        self.emit(FailoverEvent::FailoverCompleted {
            from: BrokerSide::Primary,
            to: BrokerSide::Backup,
            reason,
        });
        self.schedule_recovery(Instant::now() + self.config.recovery_delay());
        true
    }

    async fn attempt_recovery(&mut self) {
        self.recovery_at = None;
        self.state.write().recovery_pending = false;
        if self.active() == BrokerSide::Primary || !self.state.read().enabled {
            return;
        }

        match self.check_primary().await {
            Ok(()) => {
                if self.sync_strategy != SyncStrategy::None {
                    self.sync(BrokerSide::Backup, BrokerSide::Primary).await;
                }
                {
                    let mut state = self.state.write();
                    state.active = BrokerSide::Primary;
                    state.primary.reset();
                }
                self.reload_mirror_book().await;
                info!("Recovered to primary {}", self.primary.key());
                self.emit(FailoverEvent::RecoveryCompleted);
            }
            Err(e) => {
                warn!("Recovery failed: {}", e);
                self.emit(FailoverEvent::RecoveryFailed {
                    reason: e.to_string(),
                });
                self.schedule_recovery(Instant::now() + self.config.recovery_delay());
            }
        }
    }

    /// Both checks must pass in the same attempt
    async fn check_primary(&self) -> Result<()> {
        self.primary.connect().await?;

        let symbol = Symbol::new(&self.config.reference_symbol);
        let (quote, account) = tokio::join!(
            self.primary.get_market_data(&symbol),
            self.primary.get_account_info()
        );
        let quote = quote.map_err(|e| Error::HealthCheckFailed(format!("market data: {}", e)))?;
        let account = account.map_err(|e| Error::HealthCheckFailed(format!("account: {}", e)))?;

        if !quote.is_valid() {
            return Err(Error::HealthCheckFailed(format!(
                "{} quote has no bid/ask",
                symbol
            )));
        }
        if !account.is_valid() {
            return Err(Error::HealthCheckFailed("account balance is zero".to_string()));
        }
        Ok(())
    }

    async fn sync(&self, from: BrokerSide, to: BrokerSide) {
        let source = self.broker(from).as_ref();
        let target = self.broker(to).as_ref();
        match sync_positions(source, target).await {
            Ok(report) if report.failed == 0 => {}
            Ok(report) => self.emit(FailoverEvent::SyncFailed {
                target: to,
                failed_legs: report.failed,
                reason: format!("{} of {} legs failed", report.failed, report.legs),
            }),
            Err(e) => {
                warn!("Position sync {} -> {} failed: {}", from, to, e);
                self.emit(FailoverEvent::SyncFailed {
                    target: to,
                    failed_legs: 0,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Start the book from the inactive side's actual positions
    async fn reload_mirror_book(&mut self) {
        self.mirror_book.clear();
        self.book_epoch += 1;
        if self.sync_strategy != SyncStrategy::Full {
            return;
        }
        let target = self.broker(self.active().other()).clone();
        match target.get_positions().await {
            Ok(positions) => self.mirror_book = net_by_symbol(&positions),
            Err(e) => warn!("Positions of {} unavailable, mirror book empty: {}", target.key(), e),
        }
    }

    fn spawn_mirror(&mut self, kind: MirrorKind, request: OrderRequest) {
        let target = self.broker(self.active().other()).clone();
        let symbol = request.symbol.clone();
        let quantity = request.side.sign() * request.quantity;
        *self.mirror_book.entry(symbol.clone()).or_default() += quantity;
        debug!("Mirroring {:?} {} {} to {}", kind, quantity, symbol, target.key());
        let book_epoch = self.book_epoch;
        self.mirrors.spawn(async move {
            let result = target.place_order(request).await.map(|_| ());
            MirrorOutcome {
                book_epoch,
                kind,
                symbol,
                quantity,
                result,
            }
        });
    }

    fn mirror_order(&mut self, order: &Order) {
        if order.status != OrderStatus::Pending || order.tag.is_some() {
            return;
        }
        if !self.mirrored.insert(order.id.clone()) {
            return;
        }
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
            tag: Some(MIRROR_TAG.to_string()),
        };
        self.spawn_mirror(MirrorKind::Order, request);
    }

    /// Tops up the inactive side only by what mirrored orders haven't covered
    fn mirror_position(&mut self, position: Position) {
        let sent = self
            .mirror_book
            .get(&position.symbol)
            .copied()
            .unwrap_or_default();
        if let Some(request) = converge_order(&position.symbol, position.quantity, sent, MIRROR_TAG) {
            self.spawn_mirror(MirrorKind::Position, request);
        }
    }

    fn on_mirror_done(&mut self, joined: std::result::Result<MirrorOutcome, JoinError>) {
        match joined {
            Ok(MirrorOutcome { result: Ok(()), .. }) => {}
            Ok(MirrorOutcome {
                book_epoch,
                kind,
                symbol,
                quantity,
                result: Err(e),
            }) => {
                warn!("Mirror {:?} of {} {} failed: {}", kind, quantity, symbol, e);
                // the next position update converges the difference
                if book_epoch == self.book_epoch {
                    if let Some(net) = self.mirror_book.get_mut(&symbol) {
                        *net -= quantity;
                    }
                }
                self.emit(FailoverEvent::MirrorFailed {
                    kind,
                    reason: e.to_string(),
                });
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Mirror job panicked: {}", e),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        let mut state = self.state.write();
        state.primary.prune(now);
        state.backup.prune(now);
        drop(state);
        self.mirrored.clear();
        self.settled.clear();
        debug!("Pruned health windows");
    }

    async fn shutdown(&mut self) {
        {
            let mut state = self.state.write();
            state.enabled = false;
            state.recovery_pending = false;
        }
        self.recovery_at = None;
        self.mirrors.abort_all();

        for side in [BrokerSide::Primary, BrokerSide::Backup] {
            if let Err(e) = self.broker(side).disconnect().await {
                warn!("Disconnect of {} failed: {}", side, e);
            }
        }
        info!("Failover orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailoverThresholds, Side};
    use crate::testing::{MockBroker, account, position, quote};
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config(sync_strategy: SyncStrategy) -> FailoverConfig {
        FailoverConfig {
            primary: "primary".into(),
            backup: "backup".into(),
            thresholds: FailoverThresholds {
                max_latency_ms: 1000.0,
                max_errors_per_minute: 2,
                min_fill_rate: 0.8,
                max_disconnects_per_hour: 3,
            },
            sync_strategy,
            recovery_delay_ms: 60_000,
            ..FailoverConfig::default()
        }
    }

    fn pair(sync: SyncStrategy) -> (Arc<MockBroker>, Arc<MockBroker>, FailoverOrchestrator) {
        let primary = MockBroker::new("primary");
        let backup = MockBroker::new("backup");
        let orchestrator = FailoverOrchestrator::new(primary.clone(), backup.clone(), config(sync));
        (primary, backup, orchestrator)
    }

    fn order() -> OrderRequest {
        OrderRequest::market(Symbol::new("EURUSD"), Side::Buy, Decimal::ONE)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<FailoverEvent>,
        pred: impl Fn(&FailoverEvent) -> bool,
    ) -> FailoverEvent {
        timeout(Duration::from_secs(3600), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("event not seen")
    }

    fn count(events: &mut broadcast::Receiver<FailoverEvent>, name: &str) -> usize {
        let mut n = 0;
        while let Ok(event) = events.try_recv() {
            if event.name() == name {
                n += 1;
            }
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_connects_backup_only_under_full_sync() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Positions);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();
        wait_for(&mut events, |e| matches!(e, FailoverEvent::Initialized)).await;
        assert_eq!(primary.status(), ConnectionStatus::Connected);
        assert_eq!(backup.status(), ConnectionStatus::Disconnected);

        let (_, backup, orchestrator) = pair(SyncStrategy::Full);
        orchestrator.initialize().await.unwrap();
        assert_eq!(backup.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_disconnect_fails_over_with_nominal_metrics() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Positions);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);

        primary.drop_link("network unreachable");
        let event = wait_for(&mut events, |e| {
            matches!(e, FailoverEvent::FailoverCompleted { .. })
        })
        .await;
        match event {
            FailoverEvent::FailoverCompleted { to, reason, .. } => {
                assert_eq!(to, BrokerSide::Backup);
                assert!(reason.contains("network unreachable"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(orchestrator.active_broker().key(), "backup");
        assert_eq!(backup.status(), ConnectionStatus::Connected);

        let status = orchestrator.status();
        assert_eq!(status.active, BrokerSide::Backup);
        assert!(status.recovery_pending);
        assert_eq!(status.primary_health.disconnects_last_hour, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_on_backup_is_noop() {
        let (_, backup, orchestrator) = pair(SyncStrategy::None);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        assert!(orchestrator.failover("manual").await);
        assert!(!orchestrator.failover("manual again").await);
        assert_eq!(count(&mut events, "failover:completed"), 1);
        assert_eq!(backup.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_order_failure_switches_before_fourth_order() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Positions);
        orchestrator.initialize().await.unwrap();
        primary.set_reject_orders(true);

        for i in 0..3 {
            assert!(orchestrator.place_order(order()).await.is_err());
            let expected = if i < 2 { BrokerSide::Primary } else { BrokerSide::Backup };
            assert_eq!(orchestrator.active_side(), expected);
        }

        orchestrator.place_order(order()).await.unwrap();
        assert_eq!(primary.placed().len(), 3);
        assert_eq!(backup.placed().len(), 1);
        assert_eq!(orchestrator.status().primary_health.errors_last_minute, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_errors_are_recorded_only() {
        let (_, backup, orchestrator) = pair(SyncStrategy::Positions);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        for _ in 0..5 {
            backup.emit(BrokerEvent::Error(BrokerFault::fatal(
                crate::core::ErrorKind::Connection,
                "backup down",
            )));
        }
        for _ in 0..5 {
            wait_for(&mut events, |e| matches!(e, FailoverEvent::BrokerError { .. })).await;
        }
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
        assert_eq!(orchestrator.status().backup_health.errors_last_minute, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_fails_when_backup_unreachable() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Positions);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();
        backup.set_fail_connect(true);

        primary.drop_link("gone");
        wait_for(&mut events, |e| matches!(e, FailoverEvent::FailoverFailed { .. })).await;
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_requires_both_checks() {
        let (primary, _, orchestrator) = pair(SyncStrategy::Positions);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        *primary.quote.write() = None;
        primary.drop_link("gone");
        wait_for(&mut events, |e| matches!(e, FailoverEvent::FailoverCompleted { .. })).await;

        // no quote
        wait_for(&mut events, |e| matches!(e, FailoverEvent::RecoveryFailed { .. })).await;
        assert_eq!(orchestrator.active_side(), BrokerSide::Backup);

        // quote fine, zero balance
        *primary.quote.write() = Some(quote("EURUSD", Decimal::ONE, Decimal::TWO));
        *primary.account.write() = Some(account(Decimal::ZERO));
        wait_for(&mut events, |e| matches!(e, FailoverEvent::RecoveryFailed { .. })).await;
        assert_eq!(orchestrator.active_side(), BrokerSide::Backup);

        // zero bid
        *primary.quote.write() = Some(quote("EURUSD", Decimal::ZERO, Decimal::TWO));
        *primary.account.write() = Some(account(Decimal::from(5000)));
        wait_for(&mut events, |e| matches!(e, FailoverEvent::RecoveryFailed { .. })).await;

        *primary.quote.write() = Some(quote("EURUSD", Decimal::ONE, Decimal::TWO));
        wait_for(&mut events, |e| matches!(e, FailoverEvent::RecoveryCompleted)).await;
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
        let status = orchestrator.status();
        assert!(!status.recovery_pending);
        assert_eq!(status.primary_health.disconnects_last_hour, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_disconnect_triggers_immediate_recovery() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::None);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();
        primary.drop_link("gone");
        wait_for(&mut events, |e| matches!(e, FailoverEvent::FailoverCompleted { .. })).await;

        let started = Instant::now();
        backup.drop_link("backup gone");
        wait_for(&mut events, |e| matches!(e, FailoverEvent::RecoveryCompleted)).await;
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_reconciles_positions_to_backup() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Positions);
        orchestrator.initialize().await.unwrap();
        *primary.positions.write() = vec![position("EURUSD", Decimal::from(2))];
        *backup.positions.write() = vec![position("GBPUSD", Decimal::ONE)];

        assert!(orchestrator.failover("manual").await);
        let placed = backup.placed();
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|o| o.tag.as_deref() == Some(reconcile::RECONCILE_TAG)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_mirrors_untagged_orders_and_positions() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Full);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        orchestrator.place_order(order()).await.unwrap();
        primary.emit(BrokerEvent::Position(position("EURUSD", Decimal::from(3))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the order, then the two lots it didn't cover
        let mirrored = backup.placed();
        assert_eq!(mirrored.len(), 2);
        assert!(mirrored.iter().all(|o| o.tag.as_deref() == Some(MIRROR_TAG)));
        assert!(mirrored.iter().any(|o| o.quantity == Decimal::ONE));
        assert!(mirrored.iter().any(|o| o.quantity == Decimal::TWO));
        // backup's own order events are not mirrored back
        assert_eq!(primary.placed().len(), 1);

        backup.set_reject_orders(true);
        orchestrator.place_order(order()).await.unwrap();
        let event = wait_for(&mut events, |e| matches!(e, FailoverEvent::MirrorFailed { .. })).await;
        assert!(matches!(event, FailoverEvent::MirrorFailed { kind: MirrorKind::Order, .. }));
        assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
    }

    fn backup_net(backup: &MockBroker, accepted: usize) -> Decimal {
        backup
            .placed()
            .iter()
            .take(accepted)
            .map(|o| o.side.sign() * o.quantity)
            .sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_covered_by_mirrored_order_is_not_mirrored_again() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Full);
        orchestrator.initialize().await.unwrap();

        orchestrator.place_order(order()).await.unwrap();
        primary.emit(BrokerEvent::Position(position("EURUSD", Decimal::ONE)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(backup.placed().len(), 1);
        assert_eq!(backup_net(&backup, 1), Decimal::ONE);

        // closing on the primary flattens the backup once
        primary.emit(BrokerEvent::Position(position("EURUSD", Decimal::ZERO)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let placed = backup.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].side, Side::Sell);
        assert_eq!(backup_net(&backup, 2), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mirror_is_made_up_by_next_position() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Full);
        let mut events = orchestrator.subscribe();
        *backup.positions.write() = vec![position("EURUSD", Decimal::from(5))];
        orchestrator.initialize().await.unwrap();

        backup.set_reject_orders(true);
        orchestrator.place_order(order()).await.unwrap();
        wait_for(&mut events, |e| matches!(e, FailoverEvent::MirrorFailed { .. })).await;
        backup.set_reject_orders(false);

        // backup started at 5, the lost mirror leaves it one short of 6
        primary.emit(BrokerEvent::Position(position("EURUSD", Decimal::from(6))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let placed = backup.placed();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].side, Side::Buy);
        assert_eq!(placed[1].quantity, Decimal::ONE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_placements_breach_fill_rate_on_venue_client() {
        use crate::client::ConnectionClient;
        use crate::core::{BrokerConfig, ClientSettings};
        use crate::exchanges::metatrader::MetaTraderProtocol;
        use crate::testing::{MockTransport, Reply};
        use serde_json::json;

        let transport = MockTransport::new();
        transport.respond(|msg| match msg["command"].as_str() {
            Some("PLACE_ORDER") => Reply::Error("off quotes".into()),
            Some("GET_POSITIONS") => Reply::Data(json!({"positions": []})),
            _ => Reply::Data(json!({})),
        });
        let mut broker = BrokerConfig::new("metatrader", "mt-key", "mt-secret", "wss://mt.test/ws");
        broker.account_id = Some("1001".to_string());
        let protocol = MetaTraderProtocol::new(&broker);
        let primary = Arc::new(ConnectionClient::new(
            broker,
            protocol,
            transport,
            ClientSettings::default(),
        ));
        let backup = MockBroker::new("backup");

        let mut config = config(SyncStrategy::Positions);
        config.thresholds.max_errors_per_minute = 1000;
        let orchestrator = FailoverOrchestrator::new(primary, backup.clone(), config);
        orchestrator.initialize().await.unwrap();

        for _ in 1..health::MIN_FILL_SAMPLES {
            let err = orchestrator.place_order(order()).await.unwrap_err();
            assert!(matches!(err, Error::OrderRejected(_)));
            assert_eq!(orchestrator.active_side(), BrokerSide::Primary);
        }
        assert!(orchestrator.place_order(order()).await.is_err());
        assert_eq!(orchestrator.active_side(), BrokerSide::Backup);

        let snapshot = orchestrator.status().primary_health;
        assert_eq!(snapshot.fills_last_minute, health::MIN_FILL_SAMPLES);
        assert_eq!(snapshot.fill_rate, 0.0);
        orchestrator.place_order(order()).await.unwrap();
        assert_eq!(backup.placed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_outcome_counted_once_per_order() {
        let (primary, _, orchestrator) = pair(SyncStrategy::None);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        let partial = Execution {
            order_id: "7".to_string(),
            symbol: Symbol::new("EURUSD"),
            quantity: Decimal::ONE,
            price: Decimal::ONE,
            commission: Decimal::ZERO,
            timestamp: chrono::Utc::now(),
        };
        for _ in 0..3 {
            primary.emit(BrokerEvent::Execution(partial.clone()));
        }
        let mut late_reject = Order::from_request("7".to_string(), &order(), chrono::Utc::now());
        late_reject.status = OrderStatus::Rejected;
        primary.emit(BrokerEvent::Order(late_reject));

        for _ in 0..3 {
            wait_for(&mut events, |e| matches!(e, FailoverEvent::BrokerExecution { .. })).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let health = orchestrator.status().primary_health;
        assert_eq!(health.fills_last_minute, 1);
        assert_eq!(health.fill_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_disables() {
        let (primary, backup, orchestrator) = pair(SyncStrategy::Full);
        let mut events = orchestrator.subscribe();
        orchestrator.initialize().await.unwrap();

        orchestrator.shutdown().await;
        assert_eq!(primary.status(), ConnectionStatus::Disconnected);
        assert_eq!(backup.status(), ConnectionStatus::Disconnected);
        assert!(!orchestrator.status().failover_enabled);

        assert!(!orchestrator.failover("after shutdown").await);
        assert!(orchestrator.initialize().await.is_err());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count(&mut events, "failover:completed"), 0);
    }
}
