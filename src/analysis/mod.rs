//! Execution quality analysis - slippage, fill rate, latency and cost over
//! recorded executions.
//!
//! The analyzer is read-only with respect to connections: callers feed it
//! terminal orders together with the quote seen at submission.

pub mod backend;
pub mod stats;

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::core::{MarketQuote, Order, OrderStatus, OrderType, Symbol};
pub use backend::{AnalyticsBackend, ExecutionSample, Forecast, NullBackend, RollingMeanBackend};
use stats::{Tertiles, mean, percentile, std_dev};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Trading session windows in UTC hours, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    Asia,
    London,
    NewYork,
}

impl Session {
    pub const ALL: [Session; 3] = [Session::Asia, Session::London, Session::NewYork];

    pub fn hours(self) -> (u32, u32) {
        match self {
            Session::Asia => (1, 10),
            Session::London => (8, 17),
            Session::NewYork => (13, 22),
        }
    }

    pub fn contains(self, hour: u32) -> bool {
        let (start, end) = self.hours();
        hour >= start && hour < end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketConditions {
    pub volatility: f64,
    pub spread: f64,
    pub depth: f64,
    pub volume: f64,
    /// UTC hour
    pub time_of_day: u32,
    pub is_market_hours: bool,
}

impl MarketConditions {
    pub fn from_quote(quote: &MarketQuote, volatility: f64, at: DateTime<Utc>) -> Self {
        let hour = at.hour();
        Self {
            volatility,
            spread: quote.spread().to_f64().unwrap_or(0.0),
            depth: 0.0,
            volume: quote.volume.to_f64().unwrap_or(0.0),
            time_of_day: hour,
            is_market_hours: Session::ALL.iter().any(|s| s.contains(hour)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub order: Order,
    /// Quote at submission
    pub snapshot: MarketQuote,
    pub conditions: MarketConditions,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Expected price: last for market orders, else limit, else stop, else last
    pub fn reference_price(&self) -> Decimal {
        match self.order.order_type {
            OrderType::Market => self.snapshot.last,
            _ => self
                .order
                .price
                .or(self.order.stop_price)
                .unwrap_or(self.snapshot.last),
        }
    }

    fn executed_quantity(&self) -> Decimal {
        if self.order.filled_quantity.is_zero() {
            self.order.quantity.abs()
        } else {
            self.order.filled_quantity.abs()
        }
    }

    fn is_filled(&self) -> bool {
        self.order.status == OrderStatus::Filled
    }

    fn hour(&self) -> u32 {
        self.executed_at.hour()
    }

    fn latency_ms(&self) -> f64 {
        (self.executed_at - self.order.timestamp).num_microseconds().unwrap_or(i64::MAX) as f64
            / 1000.0
    }

    /// Slippage in bps; None without a fill price or a usable reference
    fn slippage_bps(&self) -> Option<Decimal> {
        let executed = self.order.average_price?;
        let reference = self.reference_price();
        if reference <= Decimal::ZERO {
            return None;
        }
        Some((executed - reference) / reference * BPS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlippageMetrics {
    pub average_bps: f64,
    pub std_dev_bps: f64,
    pub p95_bps: f64,
    pub worst_case_bps: f64,
    pub by_hour: BTreeMap<u32, f64>,
    pub by_volume: Tertiles,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRateMetrics {
    pub overall: f64,
    pub by_order_type: BTreeMap<OrderType, f64>,
    pub by_session: BTreeMap<Session, f64>,
    /// Filled orders short of their requested quantity / filled orders
    pub partial_fill_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub average_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub by_hour: BTreeMap<u32, f64>,
    pub by_volatility: Tertiles,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostMetrics {
    pub total_commission: f64,
    pub commission_per_unit: f64,
    pub total_slippage_cost: f64,
    pub average_spread_cost: f64,
    /// Slippage plus spread cost
    pub implicit_cost: f64,
    pub cost_per_million: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketImpact {
    pub average_price_move_bps: f64,
    pub temporary_impact_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub executions: usize,
    pub slippage: SlippageMetrics,
    pub fill_rate: FillRateMetrics,
    pub latency: LatencyMetrics,
    pub cost: CostMetrics,
    pub market_impact: MarketImpact,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn by_hour(hours: &[u32], values: &[f64]) -> BTreeMap<u32, f64> {
    let mut grouped: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (hour, value) in hours.iter().zip(values) {
        grouped.entry(*hour).or_default().push(*value);
    }
    grouped
        .into_iter()
        .map(|(hour, values)| (hour, mean(&values)))
        .collect()
}

pub struct ExecutionQualityAnalyzer {
    records: Vec<ExecutionRecord>,
    backend: Box<dyn AnalyticsBackend>,
}

impl Default for ExecutionQualityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQualityAnalyzer {
    pub fn new() -> Self {
        Self::with_backend(Box::new(NullBackend))
    }

    pub fn with_backend(backend: Box<dyn AnalyticsBackend>) -> Self {
        Self {
            records: Vec::new(),
            backend,
        }
    }

    pub fn record(
        &mut self,
        order: Order,
        snapshot: MarketQuote,
        conditions: MarketConditions,
        executed_at: DateTime<Utc>,
    ) {
        let record = ExecutionRecord {
            order,
            snapshot,
            conditions,
            executed_at,
        };
        if let Some(slippage) = record.slippage_bps() {
            self.backend.observe(&ExecutionSample {
                symbol: record.order.symbol.clone(),
                slippage_bps: to_f64(slippage),
                latency_ms: record.latency_ms(),
                volatility: record.conditions.volatility,
            });
        }
        debug!(
            "Recorded {} {} ({:?}) for analysis",
            record.order.symbol, record.order.id, record.order.status
        );
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn forecast(&self, symbol: &Symbol) -> Option<Forecast> {
        self.backend.forecast(symbol)
    }

    /// Metrics over everything recorded; None when nothing was recorded
    pub fn analyze(&self) -> Option<ExecutionMetrics> {
        if self.records.is_empty() {
            return None;
        }

        let priced: Vec<(&ExecutionRecord, Decimal)> = self
            .records
            .iter()
            .filter_map(|r| r.slippage_bps().map(|s| (r, s)))
            .collect();

        Some(ExecutionMetrics {
            executions: self.records.len(),
            slippage: slippage_metrics(&priced),
            fill_rate: self.fill_rate_metrics(),
            latency: latency_metrics(&priced),
            cost: self.cost_metrics(&priced),
            market_impact: impact_metrics(&priced),
        })
    }

    fn fill_rate_metrics(&self) -> FillRateMetrics {
        let total = self.records.len();
        let filled = self.records.iter().filter(|r| r.is_filled()).count();
        let partial = self
            .records
            .iter()
            .filter(|r| r.is_filled() && r.order.filled_quantity < r.order.quantity)
            .count();

        let mut by_type: BTreeMap<OrderType, (usize, usize)> = BTreeMap::new();
        let mut by_session: BTreeMap<Session, (usize, usize)> = BTreeMap::new();
        for record in &self.records {
            let hit = usize::from(record.is_filled());
            let entry = by_type.entry(record.order.order_type).or_default();
            entry.0 += hit;
            entry.1 += 1;

            let hour = record.hour();
            for session in Session::ALL.into_iter().filter(|s| s.contains(hour)) {
                let entry = by_session.entry(session).or_default();
                entry.0 += hit;
                entry.1 += 1;
            }
        }

        FillRateMetrics {
            overall: ratio(filled, total),
            by_order_type: by_type.into_iter().map(|(k, (f, n))| (k, ratio(f, n))).collect(),
            by_session: by_session.into_iter().map(|(k, (f, n))| (k, ratio(f, n))).collect(),
            partial_fill_ratio: ratio(partial, filled),
        }
    }

    fn cost_metrics(&self, priced: &[(&ExecutionRecord, Decimal)]) -> CostMetrics {
        let total_commission: Decimal = self.records.iter().map(|r| r.order.commission).sum();

        let mut volume = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        let mut slippage_cost = Decimal::ZERO;
        let mut spread_cost = Decimal::ZERO;
        for (record, _) in priced {
            let qty = record.executed_quantity();
            let executed = record.order.average_price.unwrap_or(Decimal::ZERO);
            volume += qty;
            notional += (qty * executed).abs();
            slippage_cost += ((executed - record.reference_price()) * qty).abs();
            spread_cost += record.snapshot.spread() * qty;
        }

        let commission_per_unit = if volume.is_zero() {
            Decimal::ZERO
        } else {
            total_commission / volume
        };
        let average_spread_cost = if priced.is_empty() {
            Decimal::ZERO
        } else {
            spread_cost / Decimal::from(priced.len())
        };
        let cost_per_million = if notional.is_zero() {
            0.0
        } else {
            to_f64(total_commission + slippage_cost + spread_cost) / (to_f64(notional) / 1_000_000.0)
        };

        CostMetrics {
            total_commission: to_f64(total_commission),
            commission_per_unit: to_f64(commission_per_unit),
            total_slippage_cost: to_f64(slippage_cost),
            average_spread_cost: to_f64(average_spread_cost),
            implicit_cost: to_f64(slippage_cost + spread_cost),
            cost_per_million,
        }
    }
}

fn slippage_metrics(priced: &[(&ExecutionRecord, Decimal)]) -> SlippageMetrics {
    let values: Vec<f64> = priced.iter().map(|(_, s)| to_f64(*s)).collect();
    let hours: Vec<u32> = priced.iter().map(|(r, _)| r.hour()).collect();
    let volumes: Vec<f64> = priced.iter().map(|(r, _)| r.conditions.volume).collect();

    SlippageMetrics {
        average_bps: mean(&values),
        std_dev_bps: std_dev(&values),
        p95_bps: percentile(&values, 0.95),
        worst_case_bps: stats::max(&values),
        by_hour: by_hour(&hours, &values),
        by_volume: Tertiles::split(&volumes, &values),
    }
}

fn latency_metrics(priced: &[(&ExecutionRecord, Decimal)]) -> LatencyMetrics {
    let values: Vec<f64> = priced.iter().map(|(r, _)| r.latency_ms()).collect();
    let hours: Vec<u32> = priced.iter().map(|(r, _)| r.hour()).collect();
    let volatility: Vec<f64> = priced.iter().map(|(r, _)| r.conditions.volatility).collect();

    LatencyMetrics {
        average_ms: mean(&values),
        median_ms: percentile(&values, 0.5),
        p95_ms: percentile(&values, 0.95),
        by_hour: by_hour(&hours, &values),
        by_volatility: Tertiles::split(&volatility, &values),
    }
}

/// Absolute move of the fill away from the pre-trade last
fn impact_metrics(priced: &[(&ExecutionRecord, Decimal)]) -> MarketImpact {
    let moves: Vec<f64> = priced
        .iter()
        .filter_map(|(r, _)| {
            let before = r.snapshot.last;
            let after = r.order.average_price?;
            (before > Decimal::ZERO).then(|| to_f64(((after - before) / before * BPS).abs()))
        })
        .collect();
    let average = mean(&moves);
    MarketImpact {
        average_price_move_bps: average,
        temporary_impact_bps: average,
    }
}
