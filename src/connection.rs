//! Per-viewer connection state: queueing and scheduling of outgoing packets, reliability
//!  bookkeeping and round trip estimation.

pub mod connection_state;
pub mod packet_archive;
pub mod rtt;
pub mod unacked_packets;

pub use connection_state::{ConnectionId, ConnectionState, DequeueResult, PacketSink, PacketStats};
