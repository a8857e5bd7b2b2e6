use std::io;
use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// This is an abstraction for a UDP socket, introduced to facilitate mocking the I/O part away
///  for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Creates a non-blocking UDP socket with the given OS buffer sizes and registers it with the
///  tokio runtime. This must be called from inside a runtime.
pub fn bind_udp_socket(addr: SocketAddr, recv_buffer_size: usize, send_buffer_size: usize) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
        debug!("could not set receive buffer size to {}: {}", recv_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(send_buffer_size) {
        debug!("could not set send buffer size to {}: {}", send_buffer_size, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("bound UDP socket to {:?}", socket.local_addr()?);
    Ok(socket)
}
