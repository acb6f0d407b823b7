//! # Connection I/O Engine
//!
//! ## Purpose
//! Owns one socket to a peer: a reader task feeding the incremental
//! assembler, a writer task draining a FIFO outbound queue under a
//! per-message wall-clock budget, and the engage/disengage bookkeeping the
//! load balancer orders connections by.
//!
//! ## Lifecycle
//! ```text
//! AUTH_PENDING → (PRE_READY →) READY → { AUTH_FAILED
//!                                      | TEARDOWN_REQUESTED → DECOMMISSIONED }
//! ```
//! A connection carries event traffic only in READY; handshake frames are the
//! only thing allowed earlier. Teardown is idempotent and drains queued
//! messages back to the owning connector's relay queue for reassignment.
//!
//! ## Write Timeout
//! A peer that accepts no bytes within the configured budget does not cost us
//! the message: the frame keeps its queue-head slot (with its partial-write
//! offset), the connection leaves the load balancer, and a delayed re-arm
//! task restores it and wakes the writer.

use crate::balancer::{Balanced, LoadKey};
use crate::connector::{Connector, RegisterKey};
use crate::dispatch::{DeliveryLink, MessageDispatcher, SendContext};
use crate::error::{NetworkError, NetworkResult};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashSet;
use nceph_codec::{encode, AssembledMessage, Message, MessageAssembler};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const NODE_UNSET: u32 = u32::MAX;

/// Connection lifecycle states, numerically increasing by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    AuthPending = 0,
    PreReady = 1,
    Ready = 2,
    AuthFailed = 3,
    TeardownRequested = 4,
    Decommissioned = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::AuthPending,
            1 => ConnectionState::PreReady,
            2 => ConnectionState::Ready,
            3 => ConnectionState::AuthFailed,
            4 => ConnectionState::TeardownRequested,
            _ => ConnectionState::Decommissioned,
        }
    }
}

/// One queued outbound frame. `encoded`/`offset` survive a write timeout so
/// a resumed write continues exactly where it stopped.
struct Outbound {
    message: Message,
    ctx: SendContext,
    key: RegisterKey,
    encoded: Vec<u8>,
    offset: usize,
}

/// One TCP/TLS socket to a peer, owned by exactly one [`Connector`].
pub struct Connection {
    id: u64,
    peer: String,
    local_port: u16,
    state: AtomicU8,
    node_id: AtomicU32,
    /// Outbound wire counter, wraps at 256.
    counter: AtomicU8,
    active_requests: AtomicUsize,
    total_requests: AtomicU64,
    last_used: Mutex<Instant>,
    outbound: Mutex<VecDeque<Outbound>>,
    /// Frames queued on this connection, for duplicate suppression.
    queued_register: DashSet<RegisterKey>,
    writer_wake: Notify,
    shutdown: Notify,
    /// Cleared after a write timeout until the re-arm delay elapses.
    balance_enabled: AtomicBool,
    connector: Weak<Connector>,
    dispatcher: Arc<dyn MessageDispatcher>,
    buffer_size: usize,
    write_timeout: Duration,
    rearm_delay: Duration,
}

impl Connection {
    /// Create the connection and start its reader and writer tasks.
    pub fn spawn(
        stream: BoxedStream,
        peer: String,
        connector: &Arc<Connector>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<Self> {
        let settings = connector.settings();
        let conn = Arc::new(Self {
            id: connector.next_connection_id(),
            peer,
            local_port: connector.port(),
            state: AtomicU8::new(ConnectionState::AuthPending as u8),
            node_id: AtomicU32::new(NODE_UNSET),
            counter: AtomicU8::new(0),
            active_requests: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            last_used: Mutex::new(Instant::now()),
            outbound: Mutex::new(VecDeque::new()),
            queued_register: DashSet::new(),
            writer_wake: Notify::new(),
            shutdown: Notify::new(),
            balance_enabled: AtomicBool::new(true),
            connector: Arc::downgrade(connector),
            dispatcher,
            buffer_size: settings.buffer_size,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            rearm_delay: Duration::from_millis(settings.rearm_delay_ms),
        });
        connector.attach(conn.clone());

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(Self::read_loop(conn.clone(), reader));
        tokio::spawn(Self::write_loop(conn.clone(), writer));
        info!(peer = %conn.peer, id = conn.id, port = conn.local_port, "connection established");
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn queue_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn balance_enabled(&self) -> bool {
        self.balance_enabled.load(Ordering::Acquire)
    }

    /// Queue a frame for transmission.
    ///
    /// Duplicate suppression applies to every context except monitor
    /// re-sends: a frame already fully sent, already queued here, or already
    /// waiting on the connector's relay queue is silently dropped.
    pub fn enqueue(&self, message: Message, ctx: SendContext) -> NetworkResult<()> {
        let state = self.state();
        if state >= ConnectionState::TeardownRequested {
            return Err(NetworkError::Decommissioned {
                peer: self.peer.clone(),
            });
        }
        if !message.message_type().is_handshake() && state != ConnectionState::Ready {
            return Err(NetworkError::NotReady {
                peer: self.peer.clone(),
                state,
            });
        }

        let key = RegisterKey::of(&message, self.node_id());
        if ctx != SendContext::Monitor {
            let connector = self.connector.upgrade();
            let already_sent = connector
                .as_ref()
                .is_some_and(|c| c.already_sent(&key));
            let queued_on_connector = connector
                .as_ref()
                .is_some_and(|c| c.queued_on_connector(&key));
            if already_sent || queued_on_connector || self.queued_register.contains(&key) {
                debug!(peer = %self.peer, message_id = %message.id(), kind = ?message.message_type(),
                       "duplicate enqueue suppressed");
                return Ok(());
            }
        }

        self.queued_register.insert(key);
        self.outbound.lock().push_back(Outbound {
            message,
            ctx,
            key,
            encoded: Vec::new(),
            offset: 0,
        });
        self.writer_wake.notify_one();
        Ok(())
    }

    /// Idempotent teardown: withdraw from the connector, requeue unsent
    /// frames, and stop both I/O tasks.
    pub async fn close(self: &Arc<Self>) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ConnectionState::TeardownRequested as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnectionState::TeardownRequested as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        let node = self.node_id();
        if let Some(connector) = self.connector.upgrade() {
            connector.detach(self.id, node);
            let drained: Vec<(Message, Option<u16>)> = {
                let mut queue = self.outbound.lock();
                queue
                    .drain(..)
                    .map(|out| (out.message, node))
                    .collect()
            };
            self.queued_register.clear();
            if !drained.is_empty() {
                debug!(peer = %self.peer, count = drained.len(),
                       "requeueing unsent messages to connector relay queue");
                connector.requeue(drained);
            }
        }
        self.shutdown.notify_waiters();
        self.state
            .store(ConnectionState::Decommissioned as u8, Ordering::Release);
        info!(peer = %self.peer, id = self.id, "connection decommissioned");
    }

    async fn read_loop(conn: Arc<Self>, mut reader: ReadHalf<BoxedStream>) {
        let mut assembler = MessageAssembler::new(conn.peer.clone());
        let mut buf = BytesMut::with_capacity(conn.buffer_size);
        loop {
            tokio::select! {
                _ = conn.shutdown.notified() => break,
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(peer = %conn.peer, "peer closed the socket");
                        conn.close().await;
                        break;
                    }
                    Ok(_) => {
                        let chunk = buf.split();
                        match assembler.ingest(&chunk) {
                            Ok(assembled) => {
                                for item in assembled {
                                    conn.dispatch_inbound(item);
                                }
                            }
                            Err(e) => {
                                error!(peer = %conn.peer, error = %e,
                                       "wire corruption, tearing connection down");
                                conn.close().await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %conn.peer, error = %e, "socket read failed");
                        conn.close().await;
                        break;
                    }
                }
            }
        }
    }

    /// Engage, hand the message to the receptor layer on its own task, and
    /// disengage once the receptor finishes. A slow receptor never blocks
    /// the read loop.
    fn dispatch_inbound(self: &Arc<Self>, assembled: AssembledMessage) {
        self.engage();
        let conn = self.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let link: Arc<dyn DeliveryLink> = conn.clone();
            dispatcher.message_received(assembled, link).await;
            conn.disengage();
        });
    }

    fn engage(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        *self.last_used.lock() = Instant::now();
    }

    fn disengage(&self) {
        self.active_requests.fetch_sub(1, Ordering::AcqRel);
    }

    async fn write_loop(conn: Arc<Self>, mut writer: WriteHalf<BoxedStream>) {
        loop {
            if conn.state() >= ConnectionState::TeardownRequested {
                break;
            }
            // The frame keeps its queue-head slot for the whole write; only
            // a completed write removes it, so a close() racing the write
            // still drains it back to the connector.
            let job = {
                let mut queue = conn.outbound.lock();
                queue.front_mut().map(|front| {
                    if front.encoded.is_empty() {
                        let counter = conn.counter.fetch_add(1, Ordering::AcqRel);
                        front.encoded = encode(&front.message.clone().with_counter(counter));
                    }
                    (
                        front.message.clone(),
                        front.ctx,
                        front.key,
                        front.encoded.clone(),
                        front.offset,
                    )
                })
            };
            let Some((message, ctx, key, encoded, mut offset)) = job else {
                tokio::select! {
                    _ = conn.shutdown.notified() => break,
                    _ = conn.writer_wake.notified() => continue,
                }
            };

            match conn.write_frame(&mut writer, &encoded, &mut offset).await {
                Ok(()) => {
                    {
                        let mut queue = conn.outbound.lock();
                        if queue.front().is_some_and(|front| front.key == key) {
                            queue.pop_front();
                        }
                    }
                    conn.total_requests.fetch_add(1, Ordering::AcqRel);
                    *conn.last_used.lock() = Instant::now();
                    conn.queued_register.remove(&key);
                    if let Some(connector) = conn.connector.upgrade() {
                        connector.mark_sent(key);
                    }
                    if ctx == SendContext::Monitor {
                        debug!(peer = %conn.peer, message_id = %message.id(),
                               "monitor re-send written");
                    }
                    let dispatcher = conn.dispatcher.clone();
                    let link: Arc<dyn DeliveryLink> = conn.clone();
                    tokio::spawn(async move {
                        dispatcher.message_sent(message, link).await;
                    });
                }
                Err(NetworkError::WriteTimeout { peer, elapsed_ms }) => {
                    warn!(peer = %peer, elapsed_ms, message_id = %message.id(),
                          "relay timeout, deprioritizing connection");
                    // Save the partial progress; the frame never left the
                    // queue head.
                    {
                        let mut queue = conn.outbound.lock();
                        if let Some(front) = queue.front_mut() {
                            if front.key == key {
                                front.offset = offset;
                            }
                        }
                    }
                    conn.disengage_from_balancing().await;
                }
                Err(e) => {
                    warn!(peer = %conn.peer, error = %e, "socket write failed");
                    conn.close().await;
                    break;
                }
            }
        }
    }

    /// Write one frame, looping while bytes remain, under the wall-clock
    /// write budget. `offset` carries partial progress back to the caller on
    /// timeout.
    async fn write_frame(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        encoded: &[u8],
        offset: &mut usize,
    ) -> NetworkResult<()> {
        let started = Instant::now();
        while *offset < encoded.len() {
            let remaining = self
                .write_timeout
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO);
            match timeout(remaining, writer.write(&encoded[*offset..])).await {
                Ok(Ok(0)) => {
                    return Err(NetworkError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "peer stopped accepting bytes",
                    )))
                }
                Ok(Ok(n)) => *offset += n,
                Ok(Err(e)) => return Err(NetworkError::Io(e)),
                Err(_) => {
                    return Err(NetworkError::WriteTimeout {
                        peer: self.peer.clone(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
        timeout(self.write_timeout, writer.flush())
            .await
            .map_err(|_| NetworkError::WriteTimeout {
                peer: self.peer.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(NetworkError::Io)?;
        Ok(())
    }

    /// Write-timeout path: leave the balancer, wait out the re-arm delay,
    /// rejoin and wake the writer for another attempt.
    async fn disengage_from_balancing(self: &Arc<Self>) {
        self.balance_enabled.store(false, Ordering::Release);
        if let Some(connector) = self.connector.upgrade() {
            connector.withdraw_from_balancer(self.id);
        }
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(conn.rearm_delay).await;
            if conn.state() >= ConnectionState::TeardownRequested {
                return;
            }
            conn.balance_enabled.store(true, Ordering::Release);
            if conn.state() == ConnectionState::Ready {
                if let Some(connector) = conn.connector.upgrade() {
                    connector.on_connection_ready(&conn);
                }
            }
            conn.writer_wake.notify_one();
        });
        // Writer parks until the re-arm (or new traffic) wakes it.
        tokio::select! {
            _ = self.shutdown.notified() => {}
            _ = self.writer_wake.notified() => {}
        }
    }
}

impl Balanced for Connection {
    fn balance_id(&self) -> u64 {
        self.id
    }

    fn load_key(&self) -> LoadKey {
        LoadKey {
            active_requests: self.active_requests.load(Ordering::Relaxed),
            queued_messages: self.outbound.lock().len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }

    fn balance_node(&self) -> Option<u16> {
        let raw = self.node_id.load(Ordering::Acquire);
        (raw != NODE_UNSET).then_some(raw as u16)
    }
}

#[async_trait]
impl DeliveryLink for Connection {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    fn set_connection_state(&self, state: ConnectionState) {
        let previous = self.state();
        if state < previous {
            warn!(peer = %self.peer, ?previous, requested = ?state,
                  "ignoring backward connection state transition");
            return;
        }
        self.state.store(state as u8, Ordering::Release);
        debug!(peer = %self.peer, ?previous, current = ?state, "connection state advanced");
        if state == ConnectionState::Ready {
            if let Some(connector) = self.connector.upgrade() {
                connector.on_connection_ready_by_id(self.id);
            }
        }
    }

    fn node_id(&self) -> Option<u16> {
        self.balance_node()
    }

    fn set_node_id(&self, node_id: u16) {
        self.node_id.store(node_id as u32, Ordering::Release);
        if let Some(connector) = self.connector.upgrade() {
            connector.register_node_group(node_id, self.id);
        }
    }

    async fn send(&self, message: Message, ctx: SendContext) -> NetworkResult<()> {
        self.enqueue(message, ctx)
    }

    async fn teardown(&self) {
        // DeliveryLink is only handed out as Arc<Connection>.
        if let Some(connector) = self.connector.upgrade() {
            if let Some(conn) = connector.connection(self.id) {
                conn.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use crate::dispatch::NullDispatcher;
    use nceph_codec::{MessageId, MessageType};
    use nceph_config::NetworkConfig;

    fn test_settings(write_timeout_ms: u64) -> NetworkConfig {
        NetworkConfig {
            write_timeout_ms,
            rearm_delay_ms: 50,
            ..NetworkConfig::default()
        }
    }

    fn publish_message(id: u64) -> Message {
        Message::new(
            MessageType::PublishEvent,
            MessageId::new(42, id),
            b"{}".to_vec(),
        )
        .unwrap()
    }

    async fn spawn_pair(
        settings: NetworkConfig,
        far_buffer: usize,
    ) -> (Arc<Connector>, Arc<Connection>, tokio::io::DuplexStream) {
        let connector = Connector::new(1000, settings, Arc::new(NullDispatcher));
        let (near, far) = tokio::io::duplex(far_buffer);
        let conn = Connection::spawn(
            Box::new(near),
            "test-peer".to_string(),
            &connector,
            Arc::new(NullDispatcher),
        );
        (connector, conn, far)
    }

    #[tokio::test]
    async fn event_traffic_requires_ready_state() {
        let (_connector, conn, _far) = spawn_pair(test_settings(1000), 4096).await;
        let result = conn.enqueue(publish_message(1), SendContext::Initial);
        assert!(matches!(result, Err(NetworkError::NotReady { .. })));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_suppressed() {
        let (_connector, conn, mut far) = spawn_pair(test_settings(1000), 64 * 1024).await;
        conn.set_connection_state(ConnectionState::Ready);

        let msg = publish_message(7);
        conn.enqueue(msg.clone(), SendContext::Initial).unwrap();
        conn.enqueue(msg.clone(), SendContext::Initial).unwrap();

        // Give the writer a moment, then confirm exactly one frame arrived.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut buf = vec![0u8; 4096];
        let n = far.read(&mut buf).await.unwrap();
        let mut assembler = MessageAssembler::new("far");
        let frames = assembler.ingest(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.id(), msg.id());
    }

    #[tokio::test]
    async fn monitor_context_bypasses_suppression() {
        let (_connector, conn, mut far) = spawn_pair(test_settings(1000), 64 * 1024).await;
        conn.set_connection_state(ConnectionState::Ready);

        let msg = publish_message(8);
        conn.enqueue(msg.clone(), SendContext::Initial).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Already sent once; a monitor re-send must still go through.
        conn.enqueue(msg.clone(), SendContext::Monitor).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut collected = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match timeout(Duration::from_millis(100), far.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let mut assembler = MessageAssembler::new("far");
        let frames = assembler.ingest(&collected).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn write_timeout_keeps_message_and_disables_balancing() {
        // Tiny duplex buffer that nobody reads: the write stalls.
        let (connector, conn, _far) = spawn_pair(test_settings(100), 8).await;
        conn.set_connection_state(ConnectionState::Ready);
        assert!(connector.balanced(conn.id()));

        let big = Message::new(
            MessageType::PublishEvent,
            MessageId::new(42, 9),
            vec![0u8; 4096],
        )
        .unwrap();
        conn.enqueue(big, SendContext::Initial).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        // Message survived at queue head, connection left the balancer.
        assert_eq!(conn.queue_len(), 1);
        assert!(!connector.balanced(conn.id()) || conn.balance_enabled());
    }

    #[tokio::test]
    async fn close_during_stalled_write_preserves_the_frame() {
        // Long write budget, tiny unread buffer: the write stalls mid-frame
        // while close() runs.
        let (connector, conn, _far) = spawn_pair(test_settings(5_000), 8).await;
        conn.set_connection_state(ConnectionState::Ready);
        let big = Message::new(
            MessageType::PublishEvent,
            MessageId::new(42, 12),
            vec![0u8; 4096],
        )
        .unwrap();
        conn.enqueue(big, SendContext::Initial).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close().await;
        // The in-flight frame was still at queue head and got requeued.
        assert_eq!(connector.queue_depth(), 1);
    }

    #[tokio::test]
    async fn ready_connection_of_paused_node_stays_out_of_balancer() {
        let (connector, conn, _far) = spawn_pair(test_settings(1000), 4096).await;
        conn.set_node_id(301);
        connector.pause_node(301);
        conn.set_connection_state(ConnectionState::Ready);
        assert!(!connector.balanced(conn.id()));

        connector.resume_node(301);
        assert!(connector.balanced(conn.id()));
    }

    #[tokio::test]
    async fn teardown_requeues_unsent_messages() {
        let (connector, conn, _far) = spawn_pair(test_settings(1000), 8).await;
        conn.set_connection_state(ConnectionState::Ready);
        conn.enqueue(publish_message(10), SendContext::Initial).unwrap();
        conn.enqueue(publish_message(11), SendContext::Initial).unwrap();

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Decommissioned);
        // At least the never-attempted frame is back on the connector.
        assert!(connector.queue_depth() >= 1);

        // Idempotent.
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Decommissioned);
    }
}
