use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::{ConnectionId, ConnectionState, PacketSink};
use crate::events::TransportEventListener;
use crate::io::{DatagramHandler, PooledBuffer, UdpBase};
use crate::packet::{OutgoingPacket, PacketCategory, PacketKind};
use crate::packet::packet_header::PacketHeader;
use crate::throttle::TokenBucket;
use crate::util::atomic_map::AtomicMap;

/// Receives the datagrams that the transport does not consume itself, i.e. everything except
///  duplicates of reliable packets. `connection` is `None` for datagrams from unknown peers, which
///  may be the start of a new circuit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketDispatcher: Send + Sync + 'static {
    async fn on_packet(&self, buf: &[u8], from: SocketAddr, connection: Option<ConnectionId>);
}

/// The transport for all viewer connections of a single UDP listener: it owns the socket, the
///  registry of connections and the listener-wide token bucket, and it runs the scheduler that
///  moves packets from the connections' queues to the socket.
pub struct EndPoint {
    config: Arc<TransportConfig>,
    udp: Arc<UdpBase>,
    scene_bucket: Option<Arc<TokenBucket>>,
    connections: AtomicMap<ConnectionId, Arc<ConnectionState>>,
    connections_by_addr: AtomicMap<SocketAddr, ConnectionId>,
    dispatcher: Arc<dyn PacketDispatcher>,
    listeners: RwLock<Vec<Arc<dyn TransportEventListener>>>,
}

impl EndPoint {
    pub fn new(config: TransportConfig, dispatcher: Arc<dyn PacketDispatcher>) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;
        let udp = UdpBase::bind(&config)?;
        Ok(Self::with_udp_base(udp, config, dispatcher))
    }

    pub fn with_udp_base(udp: Arc<UdpBase>, config: TransportConfig, dispatcher: Arc<dyn PacketDispatcher>) -> Arc<EndPoint> {
        let scene_bucket = config.scene_throttle
            .map(|t| Arc::new(TokenBucket::new(None, t.drip_rate, t.max_burst)));

        Arc::new(EndPoint {
            config: Arc::new(config),
            udp,
            scene_bucket,
            connections: Default::default(),
            connections_by_addr: Default::default(),
            dispatcher,
            listeners: Default::default(),
        })
    }

    /// Spawns the receive loop and the scheduler
    pub fn start(self: &Arc<Self>) -> anyhow::Result<(JoinHandle<()>, JoinHandle<()>)> {
        let handler: Arc<dyn DatagramHandler> = self.clone();
        let recv_handle = self.udp.start(Arc::downgrade(&handler))?;
        let scheduler_handle = tokio::spawn(self.clone().run_scheduler());
        Ok((recv_handle, scheduler_handle))
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn scene_bucket(&self) -> Option<&Arc<TokenBucket>> {
        self.scene_bucket.as_ref()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportEventListener>) {
        self.listeners.write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn TransportEventListener>> {
        self.listeners.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a connection for a peer whose circuit was established by the layer above. If
    ///  the id is registered already, the existing connection is returned.
    pub fn add_connection(&self, id: ConnectionId, remote_addr: SocketAddr) -> Arc<ConnectionState> {
        let connection = self.connections.update(|m| {
            m.entry(id)
                .or_insert_with(|| Arc::new(ConnectionState::new(id, remote_addr, self.config.clone(), self.scene_bucket.clone())))
                .clone()
        });
        self.connections_by_addr.insert(connection.remote_addr(), id);
        connection
    }

    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(&id) else {
            return false;
        };
        self.connections_by_addr.update(|m| {
            if m.get(&connection.remote_addr()) == Some(&id) {
                m.remove(&connection.remote_addr());
            }
        });
        connection.shutdown();
        info!("removed connection {}", id);
        true
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(&id)
    }

    pub fn connection_by_addr(&self, addr: SocketAddr) -> Option<Arc<ConnectionState>> {
        self.connections_by_addr.get(&addr)
            .and_then(|id| self.connection(id))
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    fn get_connection(&self, id: ConnectionId) -> anyhow::Result<Arc<ConnectionState>> {
        self.connection(id)
            .ok_or_else(|| anyhow!("no connection for {}", id))
    }

    /// Queues a serialized packet for sending. Returns `Ok(false)` if the packet was dropped by
    ///  the connection's overflow policy.
    pub fn enqueue_outgoing(&self, id: ConnectionId, category: PacketCategory, reliable: bool, kind: PacketKind, payload: Bytes) -> anyhow::Result<bool> {
        let connection = self.get_connection(id)?;
        let packet = OutgoingPacket::new(connection.remote_addr(), category, reliable, kind, payload)?;
        Ok(connection.enqueue_outgoing(Arc::new(packet)))
    }

    pub fn set_client_throttles(&self, id: ConnectionId, blob: &[u8]) -> anyhow::Result<bool> {
        self.get_connection(id)?
            .set_throttles(blob)
    }

    pub fn get_current_throttles_wire_format(&self, id: ConnectionId, multiplier: f32) -> anyhow::Result<Bytes> {
        Ok(self.get_connection(id)?
            .get_current_throttles_wire_format(multiplier))
    }

    /// One dequeue pass over all connections, followed by queue-drained notifications and the
    ///  dynamic throttle adjustment. Returns `true` if any packet was sent.
    pub fn tick(&self, now: Instant) -> bool {
        let listeners = self.listeners();
        let mut packet_sent = false;

        for connection in self.connections.load().values() {
            let result = connection.dequeue_outgoing_at(now, self);
            packet_sent |= result.packet_sent;

            if result.notify_drained {
                for listener in &listeners {
                    listener.on_queue_drained(connection.id(), result.drained);
                }
            }

            connection.perform_dynamic_throttle_adjustment();
        }
        packet_sent
    }

    /// Requeues timed out and fast-retransmit candidates of all connections
    pub fn check_resends(&self, now: Instant) {
        for connection in self.connections.load().values() {
            let num_resent = connection.resend_unacked(now);
            if num_resent > 0 {
                trace!("{}: requeued {} packets for resend", connection.id(), num_resent);
            }
        }
    }

    pub fn report_stats(&self) {
        let listeners = self.listeners();
        for connection in self.connections.load().values() {
            let stats = connection.take_packet_stats();
            for listener in &listeners {
                listener.on_packet_stats(connection.id(), stats);
            }
        }
    }

    /// Closes and removes connections that received nothing for the configured timeout
    pub fn remove_timed_out(&self, now: Instant) -> Vec<ConnectionId> {
        let timed_out = self.connections.load()
            .values()
            .filter(|c| c.is_timed_out(now))
            .map(|c| c.id())
            .collect::<Vec<_>>();

        for &id in &timed_out {
            warn!("{} timed out", id);
            self.remove_connection(id);
        }
        timed_out
    }

    /// Runs until the end point is shut down. Passes follow each other back to back as long as
    ///  they send packets; otherwise the scheduler waits for the next interval.
    pub async fn run_scheduler(self: Arc<Self>) {
        info!("starting scheduler for {:?}", self.self_addr());

        let mut interval = tokio::time::interval(self.config.scheduler_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let start = Instant::now();
        let mut next_resend_check = start + self.config.resend_check_interval;
        let mut next_stats = start + self.config.stats_interval;

        while self.udp.is_running() {
            let now = Instant::now();
            let packet_sent = self.tick(now);

            if now >= next_resend_check {
                self.check_resends(now);
                self.remove_timed_out(now);
                next_resend_check = now + self.config.resend_check_interval;
            }
            if now >= next_stats {
                self.report_stats();
                next_stats = now + self.config.stats_interval;
            }

            if packet_sent {
                tokio::task::yield_now().await;
            }
            else {
                interval.tick().await;
            }
        }

        info!("scheduler for {:?} stopped", self.self_addr());
    }

    /// Stops the socket and closes all connections
    pub fn shutdown(&self) {
        self.udp.stop();

        let connections = self.connections.update(std::mem::take);
        self.connections_by_addr.update(|m| m.clear());
        for connection in connections.values() {
            connection.shutdown();
        }
    }
}

impl PacketSink for EndPoint {
    fn send_packet_final(&self, packet: Arc<OutgoingPacket>) {
        self.udp.send_async(packet);
    }
}

#[async_trait]
impl DatagramHandler for EndPoint {
    async fn on_datagram_received(&self, buf: PooledBuffer, from: SocketAddr) {
        let header = match PacketHeader::deser(&buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received unparsable datagram from {:?}, dropping: {}", from, e);
                return;
            }
        };

        let Some(connection) = self.connection_by_addr(from) else {
            trace!("datagram from unknown peer {:?}", from);
            self.dispatcher.on_packet(&buf, from, None).await;
            return;
        };

        let now = Instant::now();
        connection.register_received(now);

        if header.has_appended_acks() {
            match PacketHeader::appended_acks(&buf) {
                Ok(acks) => {
                    for ack in acks {
                        connection.acknowledge(ack, now, header.is_resent());
                    }
                }
                Err(e) => debug!("{}: invalid appended acks: {}", connection.id(), e),
            }
        }

        if header.is_reliable() && !connection.register_incoming_reliable(header.sequence_number) {
            trace!("{}: dropping duplicate of packet #{}", connection.id(), header.sequence_number);
            return;
        }

        self.dispatcher.on_packet(&buf, from, Some(connection.id())).await;
    }

    fn on_send_completed(&self, packet: Arc<OutgoingPacket>) {
        trace!("send completed: {:?}", packet);
    }
}
