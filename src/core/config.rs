//! Configuration - Type-safe TOML config with per-field defaults

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub app: AppSettings,

    /// Venue connections
    #[serde(default)]
    pub brokers: Vec<BrokerConfig>,

    /// Primary/backup pairing
    pub failover: Option<FailoverConfig>,

    /// Connection timing
    #[serde(default)]
    pub client: ClientSettings,

    /// Execution analysis
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Supported venue families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueKind {
    MetaTrader,
    Ibkr,
}

impl VenueKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "metatrader" | "mt4" | "mt5" => Ok(VenueKind::MetaTrader),
            "ibkr" | "interactivebrokers" => Ok(VenueKind::Ibkr),
            other => Err(Error::Config(format!("unsupported broker: {}", other))),
        }
    }

    /// Canonical venue name, shared by every alias
    pub fn as_str(self) -> &'static str {
        match self {
            VenueKind::MetaTrader => "metatrader",
            VenueKind::Ibkr => "ibkr",
        }
    }
}

/// MetaTrader terminal generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Terminal {
    Mt4,
    #[default]
    Mt5,
}

/// Per-venue credentials and account settings. Immutable once a client is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Venue name (metatrader, ibkr, ...)
    pub name: String,

    /// API key (loaded from env if not provided)
    #[serde(default)]
    pub api_key: String,

    /// API secret (loaded from env if not provided)
    #[serde(default, skip_serializing)]
    pub api_secret: String,

    /// WebSocket endpoint
    pub server_url: String,

    /// Trading account (MetaTrader bridges address accounts explicitly)
    #[serde(default)]
    pub account_id: Option<String>,

    #[serde(default)]
    pub terminal: Terminal,

    /// Symbols subscribed after connect
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub margin: MarginSettings,
}

impl BrokerConfig {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            server_url: server_url.into(),
            account_id: None,
            terminal: Terminal::default(),
            symbols: vec![],
            margin: MarginSettings::default(),
        }
    }

    /// Credential identity used by the registry; venue aliases share one key
    pub fn credential_key(&self) -> String {
        let venue = match VenueKind::from_name(&self.name) {
            Ok(kind) => kind.as_str().to_string(),
            Err(_) => self.name.trim().to_ascii_lowercase(),
        };
        format!("{}:{}", venue, self.api_key)
    }

    /// Fill missing credentials from `<NAME>_API_KEY` / `<NAME>_API_SECRET`
    pub fn resolve_credentials(&mut self) {
        let prefix = self.name.trim().to_ascii_uppercase().replace('-', "_");
        if self.api_key.is_empty() {
            if let Ok(key) = std::env::var(format!("{}_API_KEY", prefix)) {
                self.api_key = key;
            }
        }
        if self.api_secret.is_empty() {
            if let Ok(secret) = std::env::var(format!("{}_API_SECRET", prefix)) {
                self.api_secret = secret;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Config(format!("{}: missing api_key", self.name)));
        }
        if self.api_secret.is_empty() {
            return Err(Error::Config(format!("{}: missing api_secret", self.name)));
        }
        url::Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("{}: bad server_url: {}", self.name, e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginSettings {
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Margin level (%) at which the venue warns
    #[serde(default)]
    pub margin_call_level: Option<Decimal>,

    /// Margin level (%) at which the venue liquidates
    #[serde(default)]
    pub stop_out_level: Option<Decimal>,

    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
}

fn default_leverage() -> u32 {
    1
}
fn default_lot_size() -> Decimal {
    Decimal::ONE
}

impl Default for MarginSettings {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            margin_call_level: None,
            stop_out_level: None,
            lot_size: default_lot_size(),
        }
    }
}

/// How the inactive side is kept in line with the active one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Mirror every order and position update in near-real-time
    Full,
    /// Reconcile positions at failover/recovery only
    #[default]
    Positions,
    None,
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStrategy::Full => write!(f, "full"),
            SyncStrategy::Positions => write!(f, "positions"),
            SyncStrategy::None => write!(f, "none"),
        }
    }
}

/// Health limits; breaching any one demotes the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverThresholds {
    /// Mean of the last 10 latency samples
    pub max_latency_ms: f64,
    /// Errors in the rolling minute
    pub max_errors_per_minute: usize,
    /// Successful / attempted fills in the rolling minute (0.0-1.0)
    pub min_fill_rate: f64,
    /// Disconnects in the rolling hour
    pub max_disconnects_per_hour: usize,
}

impl Default for FailoverThresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: 1000.0,
            max_errors_per_minute: 5,
            min_fill_rate: 0.8,
            max_disconnects_per_hour: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Broker name used as primary
    pub primary: String,
    /// Broker name used as backup
    pub backup: String,

    #[serde(default)]
    pub thresholds: FailoverThresholds,

    #[serde(default)]
    pub sync_strategy: SyncStrategy,

    /// Delay before each recovery attempt
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Symbol quoted by the recovery health check
    #[serde(default = "default_reference_symbol")]
    pub reference_symbol: String,

    /// Period of the rolling-metrics cleanup
    #[serde(default = "default_metrics_cleanup_secs")]
    pub metrics_cleanup_secs: u64,
}

fn default_recovery_delay_ms() -> u64 {
    30_000
}
fn default_reference_symbol() -> String {
    "EURUSD".to_string()
}
fn default_metrics_cleanup_secs() -> u64 {
    3600
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary: "primary".to_string(),
            backup: "backup".to_string(),
            thresholds: FailoverThresholds::default(),
            sync_strategy: SyncStrategy::default(),
            recovery_delay_ms: default_recovery_delay_ms(),
            reference_symbol: default_reference_symbol(),
            metrics_cleanup_secs: default_metrics_cleanup_secs(),
        }
    }
}

impl FailoverConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn metrics_cleanup_period(&self) -> Duration {
        Duration::from_secs(self.metrics_cleanup_secs.max(1))
    }
}

/// Connection timing; defaults follow the venue protocol contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub event_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            event_capacity: 1024,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Backoff before reconnect attempt `attempt` (1-based): base * 2^(attempt-1)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Samples required before the rolling-mean backend forecasts
    pub min_forecast_samples: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            min_forecast_samples: 1000,
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get broker config by name
    pub fn broker(&self, name: &str) -> Option<&BrokerConfig> {
        self.brokers.iter().find(|b| b.name.eq_ignore_ascii_case(name))
    }
}
