//! Application receptor registry: event type → business handler.
//!
//! Relay delivery culminates in invoking consumer business logic exactly
//! here; the logic itself is an external collaborator behind [`AppReceptor`].

use async_trait::async_trait;
use dashmap::DashMap;
use nceph_codec::EventData;
use std::sync::Arc;

/// One consumer-side business handler, invoked per successful relay
/// delivery. Handlers should be idempotent: the network guarantees
/// at-least-once invocation, not exactly-once.
#[async_trait]
pub trait AppReceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, event: &EventData) -> anyhow::Result<()>;
}

/// Static event-type→handler registry, populated at bootstrap.
#[derive(Default)]
pub struct AppReceptorRegistry {
    receptors: DashMap<u16, Arc<dyn AppReceptor>>,
}

impl AppReceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: u16, receptor: Arc<dyn AppReceptor>) {
        self.receptors.insert(event_type, receptor);
    }

    pub fn resolve(&self, event_type: u16) -> Option<Arc<dyn AppReceptor>> {
        self.receptors.get(&event_type).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl AppReceptor for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn execute(&self, _event: &EventData) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolves_by_event_type() {
        let registry = AppReceptorRegistry::new();
        registry.register(1001, Arc::new(Noop));
        assert!(registry.resolve(1001).is_some());
        assert!(registry.resolve(1002).is_none());
    }
}
