//! brokerlink - Core Library
//! Broker connectivity with automatic failover and execution-quality analysis

// Public modules
pub mod analysis;
pub mod client;
pub mod core;
pub mod exchanges;
pub mod failover;
pub mod registry;
pub mod signer;

#[cfg(test)]
mod testing;

// Re-exports
pub use analysis::{ExecutionMetrics, ExecutionQualityAnalyzer, MarketConditions};
pub use core::{AppConfig, BrokerConnection, BrokerEvent, Error, Result};
pub use failover::{BrokerSide, FailoverEvent, FailoverOrchestrator, FailoverStatus};
pub use registry::ConnectionRegistry;
