use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::io::buffer_pool::{BufferPool, PooledBuffer};
use crate::io::datagram_socket::{bind_udp_socket, DatagramSocket};
use crate::packet::OutgoingPacket;

/// The upper layer of the I/O base
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// The buffer holds exactly the received datagram. It goes back to the receive pool when
    ///  it is dropped.
    async fn on_datagram_received(&self, buf: PooledBuffer, from: SocketAddr);

    /// Called exactly once per [UdpBase::send_async], whether the send succeeded or not
    fn on_send_completed(&self, packet: Arc<OutgoingPacket>);
}

/// Owns the UDP socket and drives asynchronous receives and sends on it.
///
/// Send errors are logged and swallowed: a lost packet surfaces only as a missing ack, and that
///  is handled by retransmission. Shutdown is a one-way flag transition that releases the socket;
///  operations still in flight run to completion against their own reference.
pub struct UdpBase {
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    local_addr: SocketAddr,
    recv_pool: Arc<BufferPool>,
    send_pool: Arc<BufferPool>,
    max_datagram_size: usize,
    async_packet_handling: bool,
    is_shut_down: AtomicBool,
    shutdown_notify: Notify,
    handler: OnceLock<Weak<dyn DatagramHandler>>,
}

impl UdpBase {
    /// Binds a socket to the configured address. This is the only fatal error in the transport.
    pub fn bind(config: &TransportConfig) -> anyhow::Result<Arc<UdpBase>> {
        let socket = bind_udp_socket(
            config.self_addr,
            config.effective_recv_buffer_size(),
            TransportConfig::DEFAULT_SOCKET_BUFFER_SIZE,
        )?;
        Self::with_socket(Arc::new(socket), config)
    }

    pub fn with_socket(socket: Arc<dyn DatagramSocket>, config: &TransportConfig) -> anyhow::Result<Arc<UdpBase>> {
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(UdpBase {
            socket: RwLock::new(Some(socket)),
            local_addr,
            recv_pool: BufferPool::new(config.max_datagram_size, config.recv_buffer_pool_size),
            send_pool: BufferPool::new(config.max_datagram_size, config.send_buffer_pool_size),
            max_datagram_size: config.max_datagram_size,
            async_packet_handling: config.async_packet_handling,
            is_shut_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            handler: OnceLock::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.is_shut_down.load(Ordering::Acquire)
    }

    pub fn recv_pool(&self) -> &Arc<BufferPool> {
        &self.recv_pool
    }

    fn socket(&self) -> Option<Arc<dyn DatagramSocket>> {
        if !self.is_running() {
            return None;
        }
        self.socket.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn handler(&self) -> Option<Arc<dyn DatagramHandler>> {
        self.handler.get()
            .and_then(Weak::upgrade)
    }

    /// Registers the handler and spawns the receive loop. The handler is held weakly since it
    ///  typically owns this `UdpBase`.
    pub fn start(self: &Arc<Self>, handler: Weak<dyn DatagramHandler>) -> anyhow::Result<JoinHandle<()>> {
        if self.handler.set(handler.clone()).is_err() {
            bail!("UDP base on {:?} was already started", self.local_addr);
        }
        let udp_base = self.clone();
        Ok(tokio::spawn(async move {
            udp_base.recv_loop(handler).await
        }))
    }

    async fn recv_loop(&self, handler: Weak<dyn DatagramHandler>) {
        info!("starting receive loop on {:?}", self.local_addr);

        while let Some(socket) = self.socket() {
            let mut buf = self.recv_pool.get_from_pool();
            buf.resize(self.max_datagram_size, 0);

            let received = tokio::select! {
                r = socket.recv_from(&mut buf[..]) => r,
                _ = self.shutdown_notify.notified() => break,
            };
            drop(socket);

            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) => {
                    if self.is_running() {
                        error!("socket error: {}", e);
                    }
                    continue;
                }
            };
            buf.truncate(num_read);

            let Some(handler) = handler.upgrade() else {
                debug!("datagram handler was dropped - stopping receive loop");
                break;
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            trace!(parent: &span, "received {} bytes from {:?}", num_read, from);

            if self.async_packet_handling {
                tokio::spawn(async move {
                    handler.on_datagram_received(buf, from).await
                }.instrument(span));
            }
            else {
                handler.on_datagram_received(buf, from).instrument(span).await;
            }
        }

        info!("receive loop on {:?} stopped", self.local_addr);
    }

    /// Sends a packet's wire image in the background
    pub fn send_async(self: &Arc<Self>, packet: Arc<OutgoingPacket>) {
        let udp_base = self.clone();
        tokio::spawn(async move {
            udp_base.send_packet(packet).await
        });
    }

    pub async fn send_packet(&self, packet: Arc<OutgoingPacket>) {
        if let Some(socket) = self.socket() {
            let mut buf = self.send_pool.get_from_pool();
            packet.write_wire_image(&mut buf);

            trace!("sending {} bytes to {:?}", buf.len(), packet.destination());
            if let Err(e) = socket.send_to(packet.destination(), &buf).await {
                debug!("error sending UDP packet to {:?}: {}", packet.destination(), e);
            }
        }
        else {
            trace!("socket is closed - not sending {:?}", packet);
        }

        if let Some(handler) = self.handler() {
            handler.on_send_completed(packet);
        }
    }

    /// Closes the socket. All subsequent operations are no-ops.
    pub fn stop(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down UDP socket on {:?}", self.local_addr);

        self.socket.write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown_notify.notify_one();
    }
}
