use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use crate::packet::packet_category::PacketCategory;
use crate::packet::packet_header::PacketHeader;

/// What an outgoing packet is, as far as the overflow policy is concerned: acknowledgements and
///  ping replies keep a connection alive and survive longer than regular traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Regular,
    Ack,
    Ping,
}

/// A serialized packet on its way to a viewer.
///
/// The payload is immutable after construction. A packet is shared (as `Arc<OutgoingPacket>`)
///  between its category queue, the unacked collection and in-flight socket sends, and the
///  payload's storage is released when the last of them lets go.
///
/// The bookkeeping that changes over the packet's lifetime (sequence number, send timestamp,
///  resend counter) is atomic so that all holders see a consistent view without locking.
pub struct OutgoingPacket {
    destination: SocketAddr,
    category: PacketCategory,
    kind: PacketKind,
    reliable: bool,
    payload: Bytes,

    /// 0 until the packet is transmitted for the first time
    sequence_number: AtomicU32,
    resend_count: AtomicU32,
    /// tick count of the most recent transmission, 0 if the packet is not on the wire (not sent
    ///  yet, or expired and waiting to be resent)
    sent_at: AtomicU64,
}

impl Debug for OutgoingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutgoingPacket{{to:{:?}, {:?}, {:?}, reliable:{}, len:{}, seq:{}, resends:{}}}",
               self.destination,
               self.category,
               self.kind,
               self.reliable,
               self.payload.len(),
               self.sequence_number(),
               self.resend_count(),
        )
    }
}

impl OutgoingPacket {
    pub fn new(destination: SocketAddr, category: PacketCategory, reliable: bool, kind: PacketKind, payload: Bytes) -> anyhow::Result<OutgoingPacket> {
        if payload.len() < PacketHeader::SERIALIZED_LEN {
            bail!("packet payload of {} bytes is shorter than the packet header", payload.len());
        }

        Ok(OutgoingPacket {
            destination,
            category,
            kind,
            reliable,
            payload,
            sequence_number: AtomicU32::new(0),
            resend_count: AtomicU32::new(0),
            sent_at: AtomicU64::new(0),
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn category(&self) -> PacketCategory {
        self.category
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// This is the number of bytes that a transmission of this packet costs in terms of throttling
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number.load(Ordering::Acquire)
    }

    pub fn has_sequence_number(&self) -> bool {
        self.sequence_number() != 0
    }

    pub fn assign_sequence_number(&self, sequence_number: u32) {
        self.sequence_number.store(sequence_number, Ordering::Release);
    }

    pub fn resend_count(&self) -> u32 {
        self.resend_count.load(Ordering::Acquire)
    }

    pub fn is_resend(&self) -> bool {
        self.resend_count() > 0
    }

    pub fn increment_resend_count(&self) -> u32 {
        self.resend_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn sent_at(&self) -> u64 {
        self.sent_at.load(Ordering::Acquire)
    }

    pub fn mark_sent(&self, ticks: u64) {
        self.sent_at.store(ticks, Ordering::Release);
    }

    pub fn mark_pending_resend(&self) {
        self.sent_at.store(0, Ordering::Release);
    }

    /// Writes the bytes that actually go on the wire: the payload with the reliable and resent
    ///  flags and the assigned sequence number patched into the header.
    pub fn write_wire_image(&self, buf: &mut BytesMut) {
        let mut flags = self.payload[0] & !(PacketHeader::FLAG_RELIABLE | PacketHeader::FLAG_RESENT);
        if self.reliable {
            flags |= PacketHeader::FLAG_RELIABLE;
        }
        if self.is_resend() {
            flags |= PacketHeader::FLAG_RESENT;
        }

        buf.reserve(self.payload.len());
        buf.put_u8(flags);
        buf.put_u32(self.sequence_number());
        buf.put_slice(&self.payload[5..]);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([1,2,3,4], 9))
    }

    #[test]
    fn test_new_rejects_short_payload() {
        assert!(OutgoingPacket::new(addr(), PacketCategory::Task, false, PacketKind::Regular, Bytes::from_static(&[0, 0, 0])).is_err());
    }

    #[rstest]
    #[case::unreliable(false, 0, 0, vec![0x00, 0,0,0,0, 0, 7, 8])]
    #[case::reliable(true, 0, 5, vec![0x40, 0,0,0,5, 0, 7, 8])]
    #[case::resent(true, 1, 0x01020304, vec![0x60, 1,2,3,4, 0, 7, 8])]
    #[case::resent_twice(true, 2, 9, vec![0x60, 0,0,0,9, 0, 7, 8])]
    fn test_write_wire_image(#[case] reliable: bool, #[case] resends: u32, #[case] seq: u32, #[case] expected: Vec<u8>) {
        let packet = OutgoingPacket::new(addr(), PacketCategory::Task, reliable, PacketKind::Regular, Bytes::from(vec![0x00, 0xff,0xff,0xff,0xff, 0, 7, 8])).unwrap();
        packet.assign_sequence_number(seq);
        for _ in 0..resends {
            packet.increment_resend_count();
        }

        let mut buf = BytesMut::new();
        packet.write_wire_image(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_wire_image_keeps_other_flags() {
        let packet = OutgoingPacket::new(addr(), PacketCategory::Land, false, PacketKind::Regular, Bytes::from(vec![0x80 | 0x40 | 0x20, 0,0,0,0, 0])).unwrap();

        let mut buf = BytesMut::new();
        packet.write_wire_image(&mut buf);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn test_send_bookkeeping() {
        let packet = OutgoingPacket::new(addr(), PacketCategory::Land, true, PacketKind::Regular, Bytes::from(vec![0; 10])).unwrap();
        assert_eq!(packet.data_size(), 10);
        assert!(!packet.has_sequence_number());
        assert_eq!(packet.sent_at(), 0);

        packet.mark_sent(17);
        assert_eq!(packet.sent_at(), 17);
        packet.mark_pending_resend();
        assert_eq!(packet.sent_at(), 0);

        assert!(!packet.is_resend());
        assert_eq!(packet.increment_resend_count(), 1);
        assert!(packet.is_resend());
    }
}
