use anyhow::bail;
use bytes::Buf;

/// The fixed part of a viewer protocol packet header. Everything after it is payload that the
///  transport treats as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub sequence_number: u32,
    pub extra_header_len: u8,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 6;

    pub const FLAG_ZEROCODED: u8 = 0x80;
    pub const FLAG_RELIABLE: u8 = 0x40;
    pub const FLAG_RESENT: u8 = 0x20;
    pub const FLAG_APPENDED_ACKS: u8 = 0x10;

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet of {} bytes is too short for a header", buf.len());
        }

        Ok(PacketHeader {
            flags: buf.get_u8(),
            sequence_number: buf.get_u32(),
            extra_header_len: buf.get_u8(),
        })
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & Self::FLAG_RELIABLE != 0
    }

    pub fn is_resent(&self) -> bool {
        self.flags & Self::FLAG_RESENT != 0
    }

    pub fn has_appended_acks(&self) -> bool {
        self.flags & Self::FLAG_APPENDED_ACKS != 0
    }

    /// Extracts the acknowledgements appended to the end of a datagram. The caller is responsible
    ///  for checking the 'appended acks' flag first.
    pub fn appended_acks(buf: &[u8]) -> anyhow::Result<Vec<u32>> {
        let Some(&count) = buf.last() else {
            bail!("empty packet has no appended acks");
        };

        let acks_len = count as usize * 4;
        if buf.len() < Self::SERIALIZED_LEN + acks_len + 1 {
            bail!("packet of {} bytes is too short for {} appended acks", buf.len(), count);
        }

        let mut acks_buf = &buf[buf.len() - 1 - acks_len .. buf.len() - 1];
        let mut result = Vec::with_capacity(count as usize);
        while acks_buf.has_remaining() {
            result.push(acks_buf.get_u32());
        }
        Ok(result)
    }
}
