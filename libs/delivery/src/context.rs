//! Shared delivery context threaded through receptors, affectors and the
//! monitor. Built once at bootstrap; replaces the original design's global
//! static registries.

use crate::app::AppReceptorRegistry;
use crate::poa::ProofOfAuthentication;
use crate::pod::ProofOfPublish;
use crate::por::ProofOfRelay;
use crate::store::{DocumentStore, RecordCache};
use nceph_codec::MessageId;
use nceph_config::NcephConfig;
use nceph_network::ConnectorCluster;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which side of the network this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Producer/consumer application node.
    Synapse,
    /// Central relay node.
    Cerebrum,
}

pub struct DeliveryContext {
    pub role: NodeRole,
    pub config: NcephConfig,
    pub cluster: Arc<ConnectorCluster>,
    pub poa_cache: RecordCache<ProofOfAuthentication>,
    pub pod_cache: RecordCache<ProofOfPublish>,
    pub por_cache: RecordCache<ProofOfRelay>,
    pub archive: Arc<dyn DocumentStore>,
    pub app_receptors: AppReceptorRegistry,
    message_seq: AtomicU64,
}

impl DeliveryContext {
    pub fn new(
        role: NodeRole,
        config: NcephConfig,
        cluster: Arc<ConnectorCluster>,
        archive: Arc<dyn DocumentStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            config,
            cluster,
            poa_cache: RecordCache::new(),
            pod_cache: RecordCache::new(),
            por_cache: RecordCache::new(),
            archive,
            app_receptors: AppReceptorRegistry::new(),
            message_seq: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.config.node.id
    }

    pub fn local_port(&self) -> u16 {
        self.config.network.port
    }

    /// Monotonic per-source message id for frames this node originates.
    pub fn next_message_id(&self) -> MessageId {
        MessageId::new(
            self.config.node.id,
            self.message_seq.fetch_add(1, Ordering::AcqRel),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;

    #[test]
    fn message_ids_are_monotonic_per_source() {
        let mut config = NcephConfig::default();
        config.node.id = 123;
        let ctx = DeliveryContext::new(
            NodeRole::Synapse,
            config,
            ConnectorCluster::new(),
            Arc::new(InMemoryDocumentStore::new()),
        );
        let a = ctx.next_message_id();
        let b = ctx.next_message_id();
        assert_eq!(a.source_id, 123);
        assert!(b.message_id > a.message_id);
    }
}
