//! # Delivery Monitor
//!
//! ## Purpose
//! The periodic sweep that turns at-least-once from a goal into a guarantee.
//! Every interval it re-drives whatever the happy path dropped: parked
//! messages move onto connections, stalled delivery records are re-sent,
//! terminal records are archived out of the cache, the outbound pool is
//! refilled, idle connections are retired, and relay-queue depth originates
//! PAUSE/RESUME toward the peers.
//!
//! Re-sends use [`SendContext::Monitor`], bypassing duplicate suppression:
//! the sweep has already judged the prior attempt stale by record age.

use crate::context::{DeliveryContext, NodeRole};
use crate::error::DeliveryResult;
use crate::por::ProofOfRelay;
use crate::receptors::{handshake, relay::retire_pod};
use crate::state::DeliveryState;
use crate::store::archive_record;
use crate::timing::AttemptCounter;
use nceph_codec::{Message, MessageId, MessageType, RelayAckData};
use nceph_network::{Connector, DeliveryLink, SendContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One monitor instance per connector.
pub struct Monitor {
    ctx: Arc<DeliveryContext>,
    connector: Arc<Connector>,
}

impl Monitor {
    pub fn new(ctx: Arc<DeliveryContext>, connector: Arc<Connector>) -> Arc<Self> {
        Arc::new(Self { ctx, connector })
    }

    /// Start the periodic sweep task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_millis(monitor.ctx.config.monitor.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.sweep().await;
            }
        })
    }

    /// One full pass. Steps are independent; a failure in one never stops
    /// the others.
    pub async fn sweep(&self) {
        if self.ctx.role == NodeRole::Synapse {
            self.replenish_connections().await;
        }

        let moved = self.connector.drain_relay_queue();
        if moved > 0 {
            debug!(port = self.connector.port(), moved, "drained parked messages");
        }

        self.sweep_pods().await;
        self.sweep_pors().await;
        self.retire_idle_connections().await;
        self.apply_backpressure();
    }

    /// Client role: keep the outbound pool at its configured minimum. Each
    /// new connection immediately starts its handshake.
    async fn replenish_connections(&self) {
        let settings = self.connector.settings();
        if settings.cerebrum_host.is_none() {
            return;
        }
        while self.connector.active_count() < settings.min_connections {
            match self.connector.open_connection().await {
                Ok(conn) => {
                    let link: Arc<dyn DeliveryLink> = conn;
                    if let Err(e) = handshake::initiate(&self.ctx, &link).await {
                        warn!(error = %e, "handshake initiation failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(port = self.connector.port(), error = %e,
                          "could not open outbound connection");
                    break;
                }
            }
        }
    }

    /// Re-drive stalled PODs and retire terminal ones.
    async fn sweep_pods(&self) {
        let window = self.ctx.config.transmission_window();
        for key in self.ctx.pod_cache.keys() {
            let Some(pod) = self.ctx.pod_cache.get(&key) else {
                continue;
            };

            // Terminal records whose archive was deferred by an earlier
            // failure. The cerebrum additionally waits for fan-out to fold.
            let terminal = match self.ctx.role {
                NodeRole::Cerebrum => {
                    pod.state >= DeliveryState::Finished
                        && (pod.subscriber_count == 0 || pod.fully_relayed())
                }
                NodeRole::Synapse => pod.state >= DeliveryState::Finished,
            };
            if terminal {
                let result = match self.ctx.role {
                    NodeRole::Cerebrum => retire_pod(&self.ctx, &key).await,
                    NodeRole::Synapse => self.retire_finished_pod(&key).await,
                };
                if let Err(e) = result {
                    warn!(message_id = %key, error = %e, "deferred POD retirement failed");
                }
                continue;
            }

            if pod.age() < window {
                continue;
            }
            let Ok(id) = key.parse::<MessageId>() else {
                warn!(message_id = %key, "unparseable record key, skipping");
                continue;
            };

            let result = match (self.ctx.role, pod.state) {
                // Producer never saw the ack: re-send the event itself.
                (NodeRole::Synapse, DeliveryState::Initial | DeliveryState::Delivered) => {
                    self.resend(
                        &key,
                        MessageType::PublishEvent,
                        id,
                        pod.event.to_bytes(),
                        self.peer_node(),
                        |pod| &mut pod.event_attempts,
                    )
                }
                // Producer's 3-way never landed: re-send it.
                (NodeRole::Synapse, DeliveryState::Acknowledged | DeliveryState::AckReceived) => {
                    self.resend(
                        &key,
                        MessageType::AckReceived,
                        id,
                        Vec::new(),
                        self.peer_node(),
                        |pod| &mut pod.threeway_attempts,
                    )
                }
                // Relay's ack never reached the producer. The producer node
                // is the id's source; a shared listening port can hold
                // connections to other nodes too.
                (NodeRole::Cerebrum, DeliveryState::Initial | DeliveryState::Delivered) => self
                    .resend(
                        &key,
                        MessageType::NcephEventAck,
                        id,
                        Vec::new(),
                        Some(id.source_id),
                        |pod| &mut pod.ack_attempts,
                    ),
                // Producer confirmed but never got told to delete.
                (NodeRole::Cerebrum, DeliveryState::AckReceived) => self.resend(
                    &key,
                    MessageType::DeletePod,
                    id,
                    Vec::new(),
                    Some(id.source_id),
                    |pod| &mut pod.threeway_attempts,
                ),
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(message_id = %key, state = ?pod.state, error = %e, "POD re-send failed");
            }
        }
    }

    /// Re-drive stalled PORs. The cerebrum owns the relay and 3-way legs;
    /// the consumer owns the ack leg.
    async fn sweep_pors(&self) {
        let window = self.ctx.config.transmission_window();
        for key in self.ctx.por_cache.keys() {
            let Some(por) = self.ctx.por_cache.get(&key) else {
                continue;
            };

            // Finished but still cached: an earlier inline retirement failed.
            if por.state >= DeliveryState::Finished {
                if let Err(e) = self.retire_finished_por(&key, &por).await {
                    warn!(key, error = %e, "deferred POR retirement failed");
                }
                continue;
            }

            if por.age() < window {
                continue;
            }
            let Ok(id) = por.message_id.parse::<MessageId>() else {
                warn!(key, "unparseable record key, skipping");
                continue;
            };
            let ack_body = || {
                serde_json::to_vec(&RelayAckData {
                    consumer_port: por.consumer_port,
                })
            };

            let result = match (self.ctx.role, por.state) {
                // Subscriber never acked the relay: re-send the event to it.
                (NodeRole::Cerebrum, DeliveryState::Initial | DeliveryState::Delivered) => self
                    .resend_por(&key, MessageType::RelayEvent, id, por.event.to_bytes(),
                        Some(por.consumer_node), |por| &mut por.relay_attempts),
                // The 3-way toward the subscriber never landed.
                (NodeRole::Cerebrum, DeliveryState::Acknowledged | DeliveryState::AckReceived) => {
                    match ack_body() {
                        Ok(body) => self.resend_por(
                            &key,
                            MessageType::RelayAckReceived,
                            id,
                            body,
                            Some(por.consumer_node),
                            |por| &mut por.threeway_attempts,
                        ),
                        Err(e) => Err(e.into()),
                    }
                }
                // Consumer's ack never reached the relay.
                (NodeRole::Synapse, DeliveryState::Initial | DeliveryState::Acknowledged) => {
                    match ack_body() {
                        Ok(body) => self.resend_por(
                            &key,
                            MessageType::RelayedEventAck,
                            id,
                            body,
                            self.peer_node(),
                            |por| &mut por.ack_attempts,
                        ),
                        Err(e) => Err(e.into()),
                    }
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(key, state = ?por.state, error = %e, "POR re-send failed");
            }
        }
    }

    /// Increment-then-send with rollback: the counter records attempts that
    /// actually left for the engine, never failed constructions.
    fn resend(
        &self,
        key: &str,
        kind: MessageType,
        id: MessageId,
        body: Vec<u8>,
        target_node: Option<u16>,
        counter: fn(&mut crate::pod::ProofOfPublish) -> &mut AttemptCounter,
    ) -> DeliveryResult<()> {
        self.ctx
            .pod_cache
            .update(key, |pod| counter(pod).increment());
        let attempt = || -> DeliveryResult<()> {
            let message = Message::new(kind, id, body)?;
            self.connector
                .dispatch(message, target_node, SendContext::Monitor)?;
            Ok(())
        };
        if let Err(e) = attempt() {
            self.ctx
                .pod_cache
                .update(key, |pod| counter(pod).rollback());
            return Err(e);
        }
        info!(message_id = %key, ?kind, "stalled delivery re-driven");
        Ok(())
    }

    fn resend_por(
        &self,
        key: &str,
        kind: MessageType,
        id: MessageId,
        body: Vec<u8>,
        target_node: Option<u16>,
        counter: fn(&mut ProofOfRelay) -> &mut AttemptCounter,
    ) -> DeliveryResult<()> {
        self.ctx
            .por_cache
            .update(key, |por| counter(por).increment());
        let attempt = || -> DeliveryResult<()> {
            let message = Message::new(kind, id, body)?;
            self.connector
                .dispatch(message, target_node, SendContext::Monitor)?;
            Ok(())
        };
        if let Err(e) = attempt() {
            self.ctx
                .por_cache
                .update(key, |por| counter(por).rollback());
            return Err(e);
        }
        info!(key, ?kind, "stalled relay re-driven");
        Ok(())
    }

    /// Node id the connector's handshaken connections point at. On a synapse
    /// that is the cerebrum, learned from the READY exchange; `None` before
    /// the first handshake completes.
    fn peer_node(&self) -> Option<u16> {
        self.connector
            .connections()
            .iter()
            .find_map(|conn| conn.node_id())
    }

    /// Producer-side terminal POD whose inline archive failed earlier.
    async fn retire_finished_pod(&self, key: &str) -> DeliveryResult<()> {
        let Some(mut pod) = self.ctx.pod_cache.get(key) else {
            return Ok(());
        };
        pod.archived = true;
        let (partition, sort) = pod.archive_key();
        archive_record(self.ctx.archive.as_ref(), &partition, &sort, &pod).await?;
        self.ctx.pod_cache.remove(key);
        info!(message_id = %key, "deferred POD archived and evicted");
        Ok(())
    }

    /// Finished POR whose inline retirement was cut short. The cerebrum side
    /// still owes the parent POD its relay tally; the consumer side still
    /// owes the cerebrum a POR_DELETED.
    async fn retire_finished_por(&self, key: &str, por: &ProofOfRelay) -> DeliveryResult<()> {
        let mut record = por.clone();
        record.archived = true;
        let (partition, sort) = record.archive_key();
        archive_record(self.ctx.archive.as_ref(), &partition, &sort, &record).await?;
        self.ctx.por_cache.remove(key);
        match self.ctx.role {
            NodeRole::Cerebrum => {
                self.ctx
                    .pod_cache
                    .update(&por.message_id, |pod| pod.record_relayed());
            }
            NodeRole::Synapse => {
                let id: MessageId = por.message_id.parse()?;
                let notice = Message::new(
                    MessageType::PorDeleted,
                    id,
                    serde_json::to_vec(&RelayAckData {
                        consumer_port: por.consumer_port,
                    })?,
                )?;
                self.connector
                    .dispatch(notice, self.peer_node(), SendContext::Monitor)?;
            }
        }
        info!(key, "deferred POR archived and evicted");
        Ok(())
    }

    /// Tear down connections idle past the configured timeout, but only with
    /// zero in-flight work and an empty outbound queue; anything else is
    /// deferred to a later sweep.
    async fn retire_idle_connections(&self) {
        let timeout = Duration::from_millis(self.connector.settings().idle_timeout_ms);
        let min = self.connector.settings().min_connections;
        for conn in self.connector.connections() {
            if self.connector.active_count() <= min {
                break;
            }
            if conn.idle_for() < timeout {
                continue;
            }
            if conn.active_requests() > 0 || conn.queue_len() > 0 {
                debug!(id = conn.id(), "idle connection still has work, deferring teardown");
                continue;
            }
            info!(id = conn.id(), idle_ms = conn.idle_for().as_millis() as u64,
                  "tearing down idle connection");
            conn.close().await;
        }
    }

    /// Originate PAUSE when the relay queue is past the high-water mark and
    /// RESUME once it has drained below the low-water mark.
    fn apply_backpressure(&self) {
        let depth = self.connector.queue_depth();
        let settings = self.connector.settings();
        if !self.connector.pause_signalled() && depth >= settings.pause_threshold {
            warn!(port = self.connector.port(), depth, "relay queue over threshold, signalling PAUSE");
            if let Ok(pause) = Message::new(
                MessageType::PauseTransmission,
                self.ctx.next_message_id(),
                Vec::new(),
            ) {
                self.connector.broadcast_flow_control(pause);
                self.connector.set_pause_signalled(true);
            }
        } else if self.connector.pause_signalled() && depth <= settings.resume_threshold {
            info!(port = self.connector.port(), depth, "relay queue drained, signalling RESUME");
            if let Ok(resume) = Message::new(
                MessageType::ResumeTransmission,
                self.ctx.next_message_id(),
                Vec::new(),
            ) {
                self.connector.broadcast_flow_control(resume);
                self.connector.set_pause_signalled(false);
            }
        }
    }
}

// Consumer-side PORs stuck with a permanently failing application receptor
// are not retried here; the cerebrum's 3-way re-send drives the retry so the
// outcome is recorded against a live exchange.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeliveryContext;
    use crate::pod::ProofOfPublish;
    use crate::store::InMemoryDocumentStore;
    use chrono::Utc;
    use nceph_codec::EventData;
    use nceph_config::NcephConfig;
    use nceph_network::{Connection, ConnectionState, ConnectorCluster, NullDispatcher};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn context(role: NodeRole, window_ms: u64) -> (Arc<DeliveryContext>, Arc<Connector>) {
        let mut config = NcephConfig::default();
        config.node.id = 123;
        config.monitor.transmission_window_ms = window_ms;
        let cluster = ConnectorCluster::new();
        let connector = Connector::new(
            config.network.port,
            config.network.clone(),
            Arc::new(NullDispatcher),
        );
        cluster.register(connector.clone());
        let ctx = DeliveryContext::new(
            role,
            config,
            cluster,
            Arc::new(InMemoryDocumentStore::new()),
        );
        (ctx, connector)
    }

    fn event() -> EventData {
        EventData {
            event_type: 1001,
            producer_port: 1000,
            payload: json!({"v": 1}),
            created_on: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stalled_initial_pod_is_resent_without_state_change() {
        let (ctx, connector) = context(NodeRole::Synapse, 0);
        ctx.pod_cache.create("123-7", || {
            let mut pod = ProofOfPublish::new("123-7".into(), event());
            pod.event_attempts.increment();
            pod
        });

        let monitor = Monitor::new(ctx.clone(), connector.clone());
        monitor.sweep().await;

        let pod = ctx.pod_cache.get("123-7").unwrap();
        assert_eq!(pod.state, DeliveryState::Initial);
        assert_eq!(pod.event_attempts.count(), 2);
        // No connections exist, so the re-send parked on the relay queue.
        assert_eq!(connector.queue_depth(), 1);
    }

    #[tokio::test]
    async fn fresh_pod_is_left_alone() {
        let (ctx, connector) = context(NodeRole::Synapse, 60_000);
        ctx.pod_cache
            .create("123-8", || ProofOfPublish::new("123-8".into(), event()));

        let monitor = Monitor::new(ctx.clone(), connector.clone());
        monitor.sweep().await;

        assert_eq!(ctx.pod_cache.get("123-8").unwrap().event_attempts.count(), 0);
        assert_eq!(connector.queue_depth(), 0);
    }

    #[tokio::test]
    async fn terminal_pod_is_archived_and_evicted() {
        let (ctx, connector) = context(NodeRole::Cerebrum, 60_000);
        ctx.pod_cache.create("123-9", || {
            let mut pod = ProofOfPublish::new("123-9".into(), event());
            pod.advance_state(DeliveryState::Finished);
            pod
        });

        let monitor = Monitor::new(ctx.clone(), connector);
        monitor.sweep().await;

        assert!(ctx.pod_cache.get("123-9").is_none());
        let doc = ctx.archive.load("P:1000", "123-9").await.unwrap();
        assert!(doc.is_some());
    }

    #[tokio::test]
    async fn cerebrum_pod_resend_targets_the_producer_node() {
        let (ctx, connector) = context(NodeRole::Cerebrum, 0);
        // Only a consumer (node 301) is connected; the producer's ack must
        // not land on its socket.
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let conn = Connection::spawn(
            Box::new(near),
            "consumer".to_string(),
            &connector,
            Arc::new(NullDispatcher),
        );
        conn.set_node_id(301);
        conn.set_connection_state(ConnectionState::Ready);

        ctx.pod_cache
            .create("123-7", || ProofOfPublish::new("123-7".into(), event()));
        Monitor::new(ctx.clone(), connector.clone()).sweep().await;

        // The ack parked targeted at node 123 instead of riding the
        // consumer's connection.
        assert_eq!(connector.queue_depth(), 1);
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(100), far.read(&mut buf)).await;
        assert!(read.is_err(), "no frame may reach the consumer");
    }

    #[tokio::test]
    async fn deferred_finished_records_are_retired_on_sweep() {
        let (ctx, connector) = context(NodeRole::Synapse, 60_000);
        ctx.pod_cache.create("123-4", || {
            let mut pod = ProofOfPublish::new("123-4".into(), event());
            pod.advance_state(DeliveryState::Finished);
            pod
        });
        ctx.por_cache.create("123-4|1300", || {
            let mut por = ProofOfRelay::new("123-4".into(), 1300, 300, event());
            por.advance_state(DeliveryState::Finished);
            por
        });

        Monitor::new(ctx.clone(), connector.clone()).sweep().await;

        assert!(ctx.pod_cache.get("123-4").is_none());
        assert!(ctx.por_cache.get("123-4|1300").is_none());
        assert!(ctx.archive.load("P:1000", "123-4").await.unwrap().is_some());
        assert!(ctx.archive.load("R:1300", "123-4").await.unwrap().is_some());
        // The consumer still owes the cerebrum its POR_DELETED; with no
        // connection up it parks on the relay queue.
        assert_eq!(connector.queue_depth(), 1);
    }

    #[tokio::test]
    async fn finished_por_retirement_folds_into_the_parent_pod() {
        let (ctx, connector) = context(NodeRole::Cerebrum, 60_000);
        ctx.pod_cache.create("123-5", || {
            let mut pod = ProofOfPublish::new("123-5".into(), event());
            pod.subscriber_count = 1;
            pod.advance_state(DeliveryState::Finished);
            pod
        });
        ctx.por_cache.create("123-5|1300", || {
            let mut por = ProofOfRelay::new("123-5".into(), 1300, 300, event());
            por.advance_state(DeliveryState::Finished);
            por
        });

        let monitor = Monitor::new(ctx.clone(), connector);
        monitor.sweep().await;
        // POR retired and tallied; the POD is now fully relayed.
        assert!(ctx.por_cache.get("123-5|1300").is_none());
        assert!(ctx.archive.load("R:1300", "123-5").await.unwrap().is_some());
        assert_eq!(ctx.pod_cache.get("123-5").unwrap().relay_count, 1);

        monitor.sweep().await;
        assert!(ctx.pod_cache.get("123-5").is_none());
        assert!(ctx.archive.load("P:1000", "123-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backpressure_signals_once_per_crossing() {
        let (ctx, connector) = {
            let mut config = NcephConfig::default();
            config.network.pause_threshold = 1;
            config.network.resume_threshold = 0;
            let cluster = ConnectorCluster::new();
            let connector = Connector::new(
                config.network.port,
                config.network.clone(),
                Arc::new(NullDispatcher),
            );
            cluster.register(connector.clone());
            let ctx = DeliveryContext::new(
                NodeRole::Cerebrum,
                config,
                cluster,
                Arc::new(InMemoryDocumentStore::new()),
            );
            (ctx, connector)
        };
        let monitor = Monitor::new(ctx, connector.clone());

        let msg = Message::new(
            MessageType::PublishEvent,
            MessageId::new(1, 1),
            b"{}".to_vec(),
        )
        .unwrap();
        connector.dispatch(msg, None, SendContext::Initial).unwrap();
        assert!(connector.queue_depth() >= 1);

        monitor.apply_backpressure();
        assert!(connector.pause_signalled());

        // Queue still deep; flag prevents a second PAUSE broadcast.
        monitor.apply_backpressure();
        assert!(connector.pause_signalled());
    }
}
