//! # Connector Cluster
//!
//! Process-wide registry mapping ports to connectors and event types to
//! subscriber nodes. Built once at bootstrap and passed by reference to the
//! components that route through it; read-mostly afterward.

use crate::connector::Connector;
use dashmap::DashMap;
use nceph_config::Subscription;
use std::sync::Arc;

/// Bootstrap-built routing registry.
#[derive(Default)]
pub struct ConnectorCluster {
    connectors: DashMap<u16, Arc<Connector>>,
    subscribers: DashMap<u16, Vec<Subscription>>,
}

impl ConnectorCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, connector: Arc<Connector>) {
        self.connectors.insert(connector.port(), connector);
    }

    pub fn connector(&self, port: u16) -> Option<Arc<Connector>> {
        self.connectors.get(&port).map(|entry| entry.clone())
    }

    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.iter().map(|entry| entry.clone()).collect()
    }

    pub fn subscribe(&self, subscription: Subscription) {
        self.subscribers
            .entry(subscription.event_type)
            .or_default()
            .push(subscription);
    }

    /// Fan-out targets for one event type. Subscription is a simple static
    /// event-type→node map; no pattern matching.
    pub fn subscribers_for(&self, event_type: u16) -> Vec<Subscription> {
        self.subscribers
            .get(&event_type)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NullDispatcher;
    use nceph_config::NetworkConfig;

    #[test]
    fn subscriber_lookup_is_per_event_type() {
        let cluster = ConnectorCluster::new();
        cluster.subscribe(Subscription {
            event_type: 1001,
            node_id: 301,
            host: "127.0.0.1".into(),
            port: 1301,
        });
        cluster.subscribe(Subscription {
            event_type: 1001,
            node_id: 302,
            host: "127.0.0.1".into(),
            port: 1302,
        });
        assert_eq!(cluster.subscribers_for(1001).len(), 2);
        assert!(cluster.subscribers_for(2002).is_empty());
    }

    #[test]
    fn connector_lookup_by_port() {
        let cluster = ConnectorCluster::new();
        let connector = Connector::new(
            1980,
            NetworkConfig::default(),
            std::sync::Arc::new(NullDispatcher),
        );
        cluster.register(connector);
        assert!(cluster.connector(1980).is_some());
        assert!(cluster.connector(1981).is_none());
    }
}
