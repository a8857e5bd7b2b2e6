//! The socket side of the transport: pooled buffers, the mockable datagram socket and the
//!  [UdpBase] that runs the receive loop and background sends.

pub mod buffer_pool;
pub mod datagram_socket;
pub mod udp_base;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use datagram_socket::DatagramSocket;
pub use udp_base::{DatagramHandler, UdpBase};
