use anyhow::Context;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use brokerlink::analysis::{ExecutionQualityAnalyzer, MarketConditions, RollingMeanBackend};
use brokerlink::client::transport::WsTransport;
use brokerlink::core::{AppConfig, BrokerConfig, BrokerEvent, MarketQuote, Symbol};
use brokerlink::failover::{FailoverEvent, FailoverOrchestrator};
use brokerlink::registry::ConnectionRegistry;

/// Latest quote per symbol plus the bps move between the last two mids
#[derive(Default)]
struct QuoteBook {
    quotes: HashMap<Symbol, (MarketQuote, f64)>,
}

impl QuoteBook {
    fn update(&mut self, quote: MarketQuote) {
        let moved_bps = self
            .quotes
            .get(&quote.symbol)
            .and_then(|(prev, _)| {
                let prev_mid = prev.mid();
                if prev_mid.is_zero() {
                    return None;
                }
                ((quote.mid() - prev_mid) / prev_mid * rust_decimal::Decimal::from(10_000)).to_f64()
            })
            .map(f64::abs)
            .unwrap_or(0.0);
        self.quotes.insert(quote.symbol.clone(), (quote, moved_bps));
    }

    fn get(&self, symbol: &Symbol) -> Option<&(MarketQuote, f64)> {
        self.quotes.get(symbol)
    }
}

fn broker_config(config: &AppConfig, name: &str) -> anyhow::Result<BrokerConfig> {
    let mut broker = config
        .broker(name)
        .cloned()
        .with_context(|| format!("no [[brokers]] entry named {}", name))?;
    broker.resolve_credentials();
    broker.validate()?;
    Ok(broker)
}

fn on_broker_event(
    source: &str,
    event: BrokerEvent,
    quotes: &mut QuoteBook,
    analyzer: &mut ExecutionQualityAnalyzer,
) {
    match event {
        BrokerEvent::MarketData(quote) => quotes.update(quote),
        BrokerEvent::Order(order) if order.status.is_terminal() => {
            let Some((snapshot, volatility)) = quotes.get(&order.symbol).cloned() else {
                debug!("[{}] no quote for {}, order {} not analyzed", source, order.symbol, order.id);
                return;
            };
            let now = Utc::now();
            let conditions = MarketConditions::from_quote(&snapshot, volatility, now);
            analyzer.record(order, snapshot, conditions, now);
        }
        _ => {}
    }
}

fn on_failover_event(event: &FailoverEvent) {
    let detail = serde_json::to_string(event).unwrap_or_default();
    match event {
        FailoverEvent::FailoverFailed { .. }
        | FailoverEvent::RecoveryFailed { .. }
        | FailoverEvent::SyncFailed { .. }
        | FailoverEvent::MirrorFailed { .. } => warn!("{} {}", event.name(), detail),
        FailoverEvent::BrokerExecution { .. } => debug!("{} {}", event.name(), detail),
        _ => info!("{} {}", event.name(), detail),
    }
}

fn log_metrics(analyzer: &ExecutionQualityAnalyzer) {
    let Some(metrics) = analyzer.analyze() else {
        return;
    };
    info!(
        "Execution quality over {}: slippage avg {:.2}bps p95 {:.2}bps, fill rate {:.1}%, latency p95 {:.0}ms",
        metrics.executions,
        metrics.slippage.average_bps,
        metrics.slippage.p95_bps,
        metrics.fill_rate.overall * 100.0,
        metrics.latency.p95_ms
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = AppConfig::load(Path::new(&path)).with_context(|| format!("loading {}", path))?;

    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},brokerlink=debug", config.app.log_level)));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("brokerlink starting with {}", path);

    let failover = config
        .failover
        .clone()
        .context("missing [failover] section")?;
    let registry = ConnectionRegistry::new(Arc::new(WsTransport), config.client.clone());
    let primary = registry.create_broker(broker_config(&config, &failover.primary)?)?;
    let backup = registry.create_broker(broker_config(&config, &failover.backup)?)?;
    info!("Primary {} / backup {}", primary.key(), backup.key());

    let mut primary_events = primary.subscribe();
    let mut backup_events = backup.subscribe();
    let orchestrator = FailoverOrchestrator::new(primary.clone(), backup.clone(), failover);
    let mut failover_events = orchestrator.subscribe();

    if let Err(e) = orchestrator.initialize().await {
        error!("Initialization failed: {}", e);
        orchestrator.shutdown().await;
        registry.destroy_all_brokers().await;
        return Err(e.into());
    }

    let mut analyzer = ExecutionQualityAnalyzer::with_backend(Box::new(RollingMeanBackend::new(
        config.analysis.min_forecast_samples,
    )));
    let mut quotes = QuoteBook::default();
    let mut report = tokio::time::interval(Duration::from_secs(60));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = failover_events.recv() => match event {
                Ok(event) => on_failover_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} failover events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Ok(event) = primary_events.recv() => {
                on_broker_event(primary.key(), event, &mut quotes, &mut analyzer);
            }
            Ok(event) = backup_events.recv() => {
                on_broker_event(backup.key(), event, &mut quotes, &mut analyzer);
            }
            _ = report.tick() => log_metrics(&analyzer),
        }
    }

    orchestrator.shutdown().await;
    registry.destroy_all_brokers().await;
    log_metrics(&analyzer);
    info!("brokerlink stopped");
    Ok(())
}
