//! Pluggable analytics backend fed with every recorded execution

use std::collections::HashMap;

use crate::core::Symbol;

/// Per-execution observation handed to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSample {
    pub symbol: Symbol,
    pub slippage_bps: f64,
    pub latency_ms: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Forecast {
    pub expected_slippage_bps: f64,
    pub expected_latency_ms: f64,
    pub samples: usize,
}

pub trait AnalyticsBackend: Send + Sync {
    fn name(&self) -> &str;

    fn observe(&mut self, sample: &ExecutionSample);

    /// None until the backend has enough data for `symbol`
    fn forecast(&self, symbol: &Symbol) -> Option<Forecast>;
}

/// Discards samples, never forecasts
#[derive(Debug, Default)]
pub struct NullBackend;

impl AnalyticsBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn observe(&mut self, _sample: &ExecutionSample) {}

    fn forecast(&self, _symbol: &Symbol) -> Option<Forecast> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    count: usize,
    slippage_bps: f64,
    latency_ms: f64,
}

/// Forecasts from per-symbol running means once `min_samples` are seen
#[derive(Debug)]
pub struct RollingMeanBackend {
    min_samples: usize,
    totals: HashMap<Symbol, Totals>,
}

impl RollingMeanBackend {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(1),
            totals: HashMap::new(),
        }
    }
}

impl AnalyticsBackend for RollingMeanBackend {
    fn name(&self) -> &str {
        "rolling-mean"
    }

    fn observe(&mut self, sample: &ExecutionSample) {
        let totals = self.totals.entry(sample.symbol.clone()).or_default();
        totals.count += 1;
        totals.slippage_bps += sample.slippage_bps;
        totals.latency_ms += sample.latency_ms;
    }

    fn forecast(&self, symbol: &Symbol) -> Option<Forecast> {
        let totals = self.totals.get(symbol)?;
        if totals.count < self.min_samples {
            return None;
        }
        let n = totals.count as f64;
        Some(Forecast {
            expected_slippage_bps: totals.slippage_bps / n,
            expected_latency_ms: totals.latency_ms / n,
            samples: totals.count,
        })
    }
}
