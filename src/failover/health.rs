//! Rolling health windows driving failover decisions

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::FailoverThresholds;

/// Latency samples kept
pub const LATENCY_CAPACITY: usize = 100;
/// Latency samples averaged for the threshold check
pub const LATENCY_WINDOW: usize = 10;
/// Order outcomes needed in the last minute before the fill rate is judged
pub const MIN_FILL_SAMPLES: usize = 5;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub average_latency_ms: f64,
    pub errors_last_minute: usize,
    /// Successful / attempted fills over the last minute (1.0 when idle)
    pub fill_rate: f64,
    pub fills_last_minute: usize,
    pub disconnects_last_hour: usize,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            average_latency_ms: 0.0,
            errors_last_minute: 0,
            fill_rate: 1.0,
            fills_last_minute: 0,
            disconnects_last_hour: 0,
        }
    }
}

/// Which threshold was crossed
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    Latency { average_ms: f64, limit_ms: f64 },
    Errors { count: usize, limit: usize },
    FillRate { rate: f64, min: f64 },
    Disconnects { count: usize, limit: usize },
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breach::Latency { average_ms, limit_ms } => {
                write!(f, "average latency {:.1}ms > {:.1}ms", average_ms, limit_ms)
            }
            Breach::Errors { count, limit } => write!(f, "{} errors in the last minute > {}", count, limit),
            Breach::FillRate { rate, min } => write!(f, "fill rate {:.2} < {:.2}", rate, min),
            Breach::Disconnects { count, limit } => {
                write!(f, "{} disconnects in the last hour > {}", count, limit)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthWindow {
    latencies: VecDeque<f64>,
    errors: VecDeque<Instant>,
    disconnects: VecDeque<Instant>,
    fills: VecDeque<(Instant, bool)>,
}

fn count_within(stamps: impl Iterator<Item = Instant>, now: Instant, window: Duration) -> usize {
    stamps
        .filter(|t| now.saturating_duration_since(*t) <= window)
        .count()
}

impl HealthWindow {
    pub fn record_latency(&mut self, ms: f64) {
        if self.latencies.len() == LATENCY_CAPACITY {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    pub fn record_error(&mut self, at: Instant) {
        self.errors.push_back(at);
    }

    pub fn record_disconnect(&mut self, at: Instant) {
        self.disconnects.push_back(at);
    }

    pub fn record_fill(&mut self, at: Instant, success: bool) {
        self.fills.push_back((at, success));
    }

    /// Mean of the most recent samples; 0 with no samples
    pub fn average_latency(&self) -> f64 {
        let n = self.latencies.len().min(LATENCY_WINDOW);
        if n == 0 {
            return 0.0;
        }
        self.latencies.iter().rev().take(n).sum::<f64>() / n as f64
    }

    pub fn errors_last_minute(&self, now: Instant) -> usize {
        count_within(self.errors.iter().copied(), now, MINUTE)
    }

    pub fn disconnects_last_hour(&self, now: Instant) -> usize {
        count_within(self.disconnects.iter().copied(), now, HOUR)
    }

    pub fn fill_rate(&self, now: Instant) -> f64 {
        let recent: Vec<bool> = self
            .fills
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= MINUTE)
            .map(|(_, ok)| *ok)
            .collect();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|ok| **ok).count() as f64 / recent.len() as f64
    }

    /// Order outcomes (filled or failed) in the last minute
    pub fn fills_last_minute(&self, now: Instant) -> usize {
        count_within(self.fills.iter().map(|(t, _)| *t), now, MINUTE)
    }

    /// Drop everything older than an hour
    pub fn prune(&mut self, now: Instant) {
        let stale = |t: &Instant| now.saturating_duration_since(*t) > HOUR;
        while self.errors.front().is_some_and(stale) {
            self.errors.pop_front();
        }
        while self.disconnects.front().is_some_and(stale) {
            self.disconnects.pop_front();
        }
        while self.fills.front().is_some_and(|(t, _)| stale(t)) {
            self.fills.pop_front();
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            average_latency_ms: self.average_latency(),
            errors_last_minute: self.errors_last_minute(now),
            fill_rate: self.fill_rate(now),
            fills_last_minute: self.fills_last_minute(now),
            disconnects_last_hour: self.disconnects_last_hour(now),
        }
    }

    /// First threshold crossed, if any
    pub fn breach(&self, now: Instant, limits: &FailoverThresholds) -> Option<Breach> {
        let average_ms = self.average_latency();
        if average_ms > limits.max_latency_ms {
            return Some(Breach::Latency {
                average_ms,
                limit_ms: limits.max_latency_ms,
            });
        }
        let errors = self.errors_last_minute(now);
        if errors > limits.max_errors_per_minute {
            return Some(Breach::Errors {
                count: errors,
                limit: limits.max_errors_per_minute,
            });
        }
        if self.fills_last_minute(now) >= MIN_FILL_SAMPLES {
            let rate = self.fill_rate(now);
            if rate < limits.min_fill_rate {
                return Some(Breach::FillRate {
                    rate,
                    min: limits.min_fill_rate,
                });
            }
        }
        let disconnects = self.disconnects_last_hour(now);
        if disconnects > limits.max_disconnects_per_hour {
            return Some(Breach::Disconnects {
                count: disconnects,
                limit: limits.max_disconnects_per_hour,
            });
        }
        None
    }
}
