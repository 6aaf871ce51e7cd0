//! Connection registry - at most one client per credential key

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::transport::Transport;
use crate::core::{BrokerConfig, BrokerConnection, ClientSettings, Error, Result};
use crate::exchanges::{IbkrClient, IbkrProtocol, MetaTraderClient, MetaTraderProtocol};

pub use crate::core::VenueKind;

type Constructor = fn(BrokerConfig, Arc<dyn Transport>, ClientSettings) -> Arc<dyn BrokerConnection>;

fn metatrader(
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
) -> Arc<dyn BrokerConnection> {
    let protocol = MetaTraderProtocol::new(&config);
    Arc::new(MetaTraderClient::new(config, protocol, transport, settings))
}

fn ibkr(
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
) -> Arc<dyn BrokerConnection> {
    Arc::new(IbkrClient::new(config, IbkrProtocol::new(), transport, settings))
}

const CONSTRUCTORS: &[(VenueKind, Constructor)] =
    &[(VenueKind::MetaTrader, metatrader), (VenueKind::Ibkr, ibkr)];

/// Keyed client cache; clients are created unconnected
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    clients: RwLock<HashMap<String, Arc<dyn BrokerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        Self {
            transport,
            settings,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Existing client for the config's credential key, or a new unconnected one
    pub fn create_broker(&self, config: BrokerConfig) -> Result<Arc<dyn BrokerConnection>> {
        let key = config.credential_key();
        if let Some(existing) = self.clients.read().get(&key) {
            return Ok(existing.clone());
        }

        let kind = VenueKind::from_name(&config.name)?;
        let constructor = CONSTRUCTORS
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| Error::Config(format!("no constructor for {:?}", kind)))?;

        let mut clients = self.clients.write();
        // raced with another creator
        if let Some(existing) = clients.get(&key) {
            return Ok(existing.clone());
        }
        let client = constructor(config, self.transport.clone(), self.settings.clone());
        info!("Registered broker {}", key);
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn BrokerConnection>> {
        self.clients.read().get(key).cloned()
    }

    /// Disconnect and evict. Returns false for unknown keys.
    pub async fn destroy_broker(&self, key: &str) -> bool {
        let removed = self.clients.write().remove(key);
        match removed {
            Some(client) => {
                if let Err(e) = client.disconnect().await {
                    warn!("Disconnect of {} failed: {}", key, e);
                }
                info!("Destroyed broker {}", key);
                true
            }
            None => false,
        }
    }

    pub async fn destroy_all_brokers(&self) {
        let drained: Vec<(String, Arc<dyn BrokerConnection>)> =
            self.clients.write().drain().collect();
        for (key, client) in drained {
            if let Err(e) = client.disconnect().await {
                warn!("Disconnect of {} failed: {}", key, e);
            }
        }
        info!("All brokers destroyed");
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.clients.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionStatus;
    use crate::testing::MockTransport;

    fn registry(transport: &Arc<MockTransport>) -> ConnectionRegistry {
        ConnectionRegistry::new(transport.clone(), ClientSettings::default())
    }

    fn mt(key: &str) -> BrokerConfig {
        BrokerConfig::new("metatrader", key, "secret", "wss://mt.test/ws")
    }

    #[test]
    fn test_unsupported_venue_is_config_error() {
        let transport = MockTransport::new();
        let err = registry(&transport)
            .create_broker(BrokerConfig::new("kraken", "k", "s", "wss://x.test"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_credential() {
        let transport = MockTransport::new();
        let registry = registry(&transport);

        let a = registry.create_broker(mt("k1")).unwrap();
        let b = registry.create_broker(mt("k1")).unwrap();
        let c = registry.create_broker(mt("k2")).unwrap();
        let d = registry
            .create_broker(BrokerConfig::new("IBKR", "k1", "s", "wss://ib.test"))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(d.venue(), "ibkr");
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.keys(), vec!["ibkr:k1", "metatrader:k1", "metatrader:k2"]);
        // created unconnected
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_venue_aliases_share_one_client() {
        let transport = MockTransport::new();
        let registry = registry(&transport);

        let mt5 = registry
            .create_broker(BrokerConfig::new("mt5", "K", "s", "wss://mt.test/ws"))
            .unwrap();
        let canonical = registry.create_broker(mt("K")).unwrap();
        let ib = registry
            .create_broker(BrokerConfig::new("InteractiveBrokers", "K", "s", "wss://ib.test"))
            .unwrap();
        let ib_again = registry
            .create_broker(BrokerConfig::new("ibkr", "K", "s", "wss://ib.test"))
            .unwrap();

        assert!(Arc::ptr_eq(&mt5, &canonical));
        assert!(Arc::ptr_eq(&ib, &ib_again));
        assert_eq!(mt5.key(), "metatrader:K");
        assert_eq!(registry.keys(), vec!["ibkr:K", "metatrader:K"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_disconnects_and_evicts() {
        let transport = MockTransport::new();
        let registry = registry(&transport);

        let client = registry.create_broker(mt("k1")).unwrap();
        client.connect().await.unwrap();
        registry.create_broker(mt("k2")).unwrap();

        assert!(registry.destroy_broker("metatrader:k1").await);
        assert!(!registry.destroy_broker("metatrader:k1").await);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(registry.get("metatrader:k1").is_none());

        registry.destroy_all_brokers().await;
        assert!(registry.is_empty());
    }
}
