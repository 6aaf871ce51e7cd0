//! Core module - Common types, traits, events, config and error handling

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::{
    AppConfig, BrokerConfig, ClientSettings, FailoverConfig, FailoverThresholds, SyncStrategy,
    VenueKind,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{BrokerEvent, BrokerFault};
pub use traits::*;
pub use types::*;
