//! Packet-level building blocks: the traffic categories that bandwidth is shaped by, the bits of
//!  the viewer protocol's packet header that the transport needs to understand, and the
//!  [OutgoingPacket] that travels through queues, the unacked collection and the socket.
//!
//! Packet header (the first bytes of every datagram):
//! ```ascii
//! 0: flags (u8)
//!    * 0x80 zerocoded (payload compression, opaque to the transport)
//!    * 0x40 reliable - the receiver must acknowledge the sequence number
//!    * 0x20 resent - this is a retransmission of a previously sent packet
//!    * 0x10 appended acks - the datagram ends with acknowledgements, see below
//! 1: sequence number (u32 BE)
//! 5: length of an optional extra header (u8)
//! ```
//!
//! Appended acks are stored at the very end of a datagram: a count byte `n` is the last byte,
//!  preceded by `n` sequence numbers (u32 BE each).

pub mod packet_category;
pub mod outgoing_packet;
pub mod packet_header;

pub use outgoing_packet::{OutgoingPacket, PacketKind};
pub use packet_category::{CategoryFlags, PacketCategory};
