//! # Connector
//!
//! ## Purpose
//! Owns every connection to/from one logical endpoint: the accept loop on a
//! cerebrum listening port, or the outbound pool a synapse keeps toward the
//! cerebrum. Holds the load balancer, the relay queue for messages with no
//! ready connection, the duplicate-suppression registers, and the node-wise
//! connection groups that backpressure addresses.
//!
//! ## Duplicate Suppression
//! Three independent registers combine so one logical send attempt queues a
//! message at most once system-wide: "already fully sent", "already queued on
//! a connection" (held per connection) and "already queued on the connector".
//! Monitor-context re-sends bypass all three; the monitor has already
//! verified the prior attempt is stale.

use crate::balancer::LoadBalancer;
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{DeliveryLink, MessageDispatcher, SendContext};
use crate::error::{NetworkError, NetworkResult};
use crate::tls;
use crate::transport;
use dashmap::{DashMap, DashSet};
use nceph_codec::{Message, MessageId, MessageType};
use nceph_config::NetworkConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of one logical send: message kind, message id and the node it is
/// addressed to. Fan-out relays the same (kind, id) to several subscribers,
/// so the target participates in the key; untargeted traffic uses `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterKey {
    pub message_type: MessageType,
    pub id: MessageId,
    pub target: Option<u16>,
}

impl RegisterKey {
    pub fn of(message: &Message, target: Option<u16>) -> Self {
        Self {
            message_type: message.message_type(),
            id: message.id(),
            target,
        }
    }
}

/// A message waiting on the connector because no ready connection could take
/// it; `target_node` pins fan-out traffic to its subscriber.
struct Parked {
    message: Message,
    target_node: Option<u16>,
}

/// All connections to/from one logical endpoint.
pub struct Connector {
    port: u16,
    settings: NetworkConfig,
    dispatcher: Arc<dyn MessageDispatcher>,
    balancer: LoadBalancer<Connection>,
    active: DashMap<u64, Arc<Connection>>,
    node_groups: DashMap<u16, Vec<u64>>,
    relay_queue: Mutex<VecDeque<Parked>>,
    sent_register: DashSet<RegisterKey>,
    queued_register: DashSet<RegisterKey>,
    paused_nodes: DashSet<u16>,
    /// Set while this connector has PAUSE outstanding toward its peers.
    pause_signalled: AtomicBool,
    next_id: AtomicU64,
}

impl Connector {
    pub fn new(
        port: u16,
        settings: NetworkConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            port,
            settings,
            dispatcher,
            balancer: LoadBalancer::new(),
            active: DashMap::new(),
            node_groups: DashMap::new(),
            relay_queue: Mutex::new(VecDeque::new()),
            sent_register: DashSet::new(),
            queued_register: DashSet::new(),
            paused_nodes: DashSet::new(),
            pause_signalled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn settings(&self) -> &NetworkConfig {
        &self.settings
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Server role: bind the configured port and accept connections until
    /// the task is dropped.
    pub async fn listen(self: &Arc<Self>) -> NetworkResult<JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let acceptor = tls::build_acceptor(&self.settings.tls)?;
        let connector = self.clone();
        info!(port = self.port, tls = self.settings.tls.enabled, "connector listening");
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        match transport::accept(socket, acceptor.as_ref()).await {
                            Ok(stream) => {
                                Connection::spawn(
                                    stream,
                                    peer.to_string(),
                                    &connector,
                                    connector.dispatcher.clone(),
                                );
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "inbound handshake failed");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(port = connector.port, error = %e, "accept failed");
                    }
                }
            }
        }))
    }

    /// Client role: open one new outbound connection to the configured
    /// cerebrum endpoint.
    pub async fn open_connection(self: &Arc<Self>) -> NetworkResult<Arc<Connection>> {
        let host = self.settings.cerebrum_host.clone().ok_or_else(|| {
            NetworkError::TlsConfig("network.cerebrum_host is not configured".into())
        })?;
        let port = self.settings.cerebrum_port.ok_or_else(|| {
            NetworkError::TlsConfig("network.cerebrum_port is not configured".into())
        })?;
        let stream = transport::connect(&host, port, &self.settings.tls).await?;
        Ok(Connection::spawn(
            stream,
            format!("{host}:{port}"),
            self,
            self.dispatcher.clone(),
        ))
    }

    pub(crate) fn attach(&self, conn: Arc<Connection>) {
        self.active.insert(conn.id(), conn);
    }

    pub(crate) fn detach(&self, id: u64, node: Option<u16>) {
        self.balancer.remove(id);
        self.active.remove(&id);
        if let Some(node) = node {
            if let Some(mut group) = self.node_groups.get_mut(&node) {
                group.retain(|&member| member != id);
            }
        }
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.active.get(&id).map(|entry| entry.clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn balanced(&self, id: u64) -> bool {
        self.balancer.contains(id)
    }

    /// READY promotion hook: join the balancer unless the peer node is
    /// currently paused.
    pub(crate) fn on_connection_ready(&self, conn: &Arc<Connection>) {
        if let Some(node) = conn.node_id() {
            if self.paused_nodes.contains(&node) {
                debug!(node, "connection ready but node is paused, staying out of balancer");
                return;
            }
        }
        if conn.balance_enabled() {
            self.balancer.add(conn.clone());
        }
    }

    pub(crate) fn on_connection_ready_by_id(&self, id: u64) {
        if let Some(conn) = self.connection(id) {
            self.on_connection_ready(&conn);
        }
    }

    pub(crate) fn withdraw_from_balancer(&self, id: u64) {
        self.balancer.remove(id);
    }

    pub(crate) fn register_node_group(&self, node_id: u16, conn_id: u64) {
        self.node_groups.entry(node_id).or_default().push(conn_id);
    }

    pub fn already_sent(&self, key: &RegisterKey) -> bool {
        self.sent_register.contains(key)
    }

    pub fn queued_on_connector(&self, key: &RegisterKey) -> bool {
        self.queued_register.contains(key)
    }

    pub(crate) fn mark_sent(&self, key: RegisterKey) {
        self.sent_register.insert(key);
    }

    /// Forget a message's sent/queued marks, making a deliberate re-send
    /// possible outside monitor context (used once a record is retired).
    pub fn clear_registers(&self, key: &RegisterKey) {
        self.sent_register.remove(key);
        self.queued_register.remove(key);
    }

    /// Forget every mark for one message id, regardless of kind or target.
    /// Called when the record behind the id is archived and deleted.
    pub fn clear_registers_for(&self, id: MessageId) {
        self.sent_register.retain(|key| key.id != id);
        self.queued_register.retain(|key| key.id != id);
    }

    /// Place a message on the least-loaded ready connection, or park it on
    /// the relay queue when none exists.
    pub fn dispatch(
        &self,
        message: Message,
        target_node: Option<u16>,
        ctx: SendContext,
    ) -> NetworkResult<()> {
        let key = RegisterKey::of(&message, target_node);
        if ctx != SendContext::Monitor
            && (self.sent_register.contains(&key) || self.queued_register.contains(&key))
        {
            debug!(message_id = %message.id(), kind = ?message.message_type(),
                   "duplicate dispatch suppressed at connector");
            return Ok(());
        }

        let selected = match target_node {
            Some(node) => self.balancer.peek_node(node),
            None => self.balancer.peek(),
        };
        match selected {
            Some(conn) => conn.enqueue(message, ctx),
            None => {
                debug!(port = self.port, message_id = %message.id(), ?target_node,
                       "no ready connection, parking message on relay queue");
                self.queued_register.insert(key);
                self.relay_queue.lock().push_back(Parked {
                    message,
                    target_node,
                });
                Ok(())
            }
        }
    }

    /// Teardown path: preserve unsent messages for reassignment.
    pub(crate) fn requeue(&self, messages: Vec<(Message, Option<u16>)>) {
        let mut queue = self.relay_queue.lock();
        for (message, target_node) in messages {
            self.queued_register
                .insert(RegisterKey::of(&message, target_node));
            queue.push_back(Parked {
                message,
                target_node,
            });
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.relay_queue.lock().len()
    }

    /// Monitor pass: move parked messages onto connections that have since
    /// become available. Returns how many were transferred.
    pub fn drain_relay_queue(&self) -> usize {
        let mut moved = 0;
        let parked: Vec<Parked> = {
            let mut queue = self.relay_queue.lock();
            queue.drain(..).collect()
        };
        let mut still_parked = Vec::new();
        for item in parked {
            let selected = match item.target_node {
                Some(node) => self.balancer.peek_node(node),
                None => self.balancer.peek(),
            };
            match selected {
                Some(conn) => {
                    self.queued_register
                        .remove(&RegisterKey::of(&item.message, item.target_node));
                    // Already register-checked when parked; bypass re-check.
                    if let Err(e) = conn.enqueue(item.message.clone(), SendContext::Monitor) {
                        warn!(error = %e, "failed to transfer parked message");
                        self.queued_register
                            .insert(RegisterKey::of(&item.message, item.target_node));
                        still_parked.push(item);
                    } else {
                        moved += 1;
                    }
                }
                None => still_parked.push(item),
            }
        }
        if !still_parked.is_empty() {
            let mut queue = self.relay_queue.lock();
            for item in still_parked.into_iter().rev() {
                queue.push_front(item);
            }
        }
        moved
    }

    /// Peer-originated backpressure: withdraw the node's connections from
    /// dispatch without severing them.
    pub fn pause_node(&self, node_id: u16) {
        self.paused_nodes.insert(node_id);
        let removed = self.balancer.remove_node(node_id);
        info!(node = node_id, connections = removed.len(), "node paused, withdrawn from balancing");
    }

    /// Peer-originated resume: restore the node's READY connections.
    pub fn resume_node(&self, node_id: u16) {
        self.paused_nodes.remove(&node_id);
        let mut restored = 0;
        if let Some(group) = self.node_groups.get(&node_id) {
            for conn_id in group.iter() {
                if let Some(conn) = self.connection(*conn_id) {
                    if conn.state() == ConnectionState::Ready && conn.balance_enabled() {
                        self.balancer.add(conn);
                        restored += 1;
                    }
                }
            }
        }
        info!(node = node_id, connections = restored, "node resumed");
    }

    /// Whether any connection from `node_id` is attached here. Used for
    /// fan-out routing: a subscriber is addressed through the connector its
    /// connection arrived on.
    pub fn serves_node(&self, node_id: u16) -> bool {
        self.node_groups
            .get(&node_id)
            .is_some_and(|group| !group.is_empty())
    }

    pub fn is_node_paused(&self, node_id: u16) -> bool {
        self.paused_nodes.contains(&node_id)
    }

    /// Whether this connector currently has PAUSE outstanding to its peers.
    pub fn pause_signalled(&self) -> bool {
        self.pause_signalled.load(Ordering::Acquire)
    }

    pub fn set_pause_signalled(&self, value: bool) {
        self.pause_signalled.store(value, Ordering::Release);
    }

    /// Send a flow-control frame toward every known peer node, one
    /// connection per group. Flow control bypasses the registers.
    pub fn broadcast_flow_control(&self, message: Message) {
        for group in self.node_groups.iter() {
            let conn = group
                .value()
                .iter()
                .find_map(|conn_id| self.connection(*conn_id));
            if let Some(conn) = conn {
                if let Err(e) = conn.enqueue(message.clone(), SendContext::Monitor) {
                    warn!(node = *group.key(), error = %e, "flow-control send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NullDispatcher;
    use nceph_codec::{MessageId, MessageType};

    fn connector() -> Arc<Connector> {
        Connector::new(1000, NetworkConfig::default(), Arc::new(NullDispatcher))
    }

    fn message(id: u64) -> Message {
        Message::new(
            MessageType::PublishEvent,
            MessageId::new(7, id),
            b"{}".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn dispatch_without_connections_parks_on_relay_queue() {
        let connector = connector();
        connector.dispatch(message(1), None, SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 1);
        // Second attempt is suppressed by the connector queued register.
        connector.dispatch(message(1), None, SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 1);
    }

    #[test]
    fn monitor_context_can_park_again() {
        let connector = connector();
        connector.dispatch(message(2), None, SendContext::Initial).unwrap();
        connector.dispatch(message(2), None, SendContext::Monitor).unwrap();
        assert_eq!(connector.queue_depth(), 2);
    }

    #[test]
    fn sent_register_suppresses_redispatch() {
        let connector = connector();
        let msg = message(3);
        connector.mark_sent(RegisterKey::of(&msg, None));
        connector.dispatch(msg.clone(), None, SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 0);

        connector.clear_registers(&RegisterKey::of(&msg, None));
        connector.dispatch(msg, None, SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 1);
    }

    #[test]
    fn fan_out_targets_register_independently() {
        let connector = connector();
        // Same (kind, id) addressed to two subscribers must not collapse.
        connector.dispatch(message(4), Some(301), SendContext::Initial).unwrap();
        connector.dispatch(message(4), Some(302), SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 2);
        // But a repeat toward the same subscriber does.
        connector.dispatch(message(4), Some(301), SendContext::Initial).unwrap();
        assert_eq!(connector.queue_depth(), 2);
    }

    #[test]
    fn pause_marks_node() {
        let connector = connector();
        connector.pause_node(301);
        assert!(connector.is_node_paused(301));
        connector.resume_node(301);
        assert!(!connector.is_node_paused(301));
    }
}
