use std::sync::{Mutex, PoisonError};
use bytes::{BufMut, Bytes, BytesMut};
use crate::packet::PacketCategory;

/// A snapshot of a connection's effective per-category rates in the form viewers expect them:
///  bits per second, in wire order (resend, land, wind, cloud, task, texture, asset), with the
///  State allowance folded into Task.
///
/// Packing into the wire format is cached for the most recently requested multiplier, which is
///  the common case when the same rates are announced repeatedly.
pub struct UnpackedThrottles {
    bits_per_second: [f32; PacketCategory::WIRE_COUNT],
    packed: Mutex<Option<(f32, Bytes)>>,
}

impl UnpackedThrottles {
    pub fn new(bits_per_second: [f32; PacketCategory::WIRE_COUNT]) -> UnpackedThrottles {
        UnpackedThrottles {
            bits_per_second,
            packed: Mutex::new(None),
        }
    }

    pub fn bits_per_second(&self) -> &[f32; PacketCategory::WIRE_COUNT] {
        &self.bits_per_second
    }

    /// Returns the rates scaled by `multiplier`, as 7 little-endian IEEE-754 floats
    pub fn packed(&self, multiplier: f32) -> Bytes {
        let mut cached = self.packed.lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some((last_multiplier, packed)) = cached.as_ref() {
            if *last_multiplier == multiplier {
                return packed.clone();
            }
        }

        let mut buf = BytesMut::with_capacity(PacketCategory::WIRE_COUNT * std::mem::size_of::<f32>());
        for value in self.bits_per_second {
            buf.put_f32_le(value * multiplier);
        }
        let packed = buf.freeze();
        *cached = Some((multiplier, packed.clone()));
        packed
    }

    /// The sum of all announced rates in bits per second
    pub fn throttle_total(&self) -> u64 {
        self.bits_per_second.iter()
            .map(|&v| v as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;
    use rstest::rstest;
    use super::*;

    fn unpack(mut buf: &[u8]) -> Vec<f32> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            result.push(buf.get_f32_le());
        }
        result
    }

    #[rstest]
    #[case::identity(1.0, vec![100.0, 200.0, 300.0, 400.0, 500.0, 600.0, 700.0])]
    #[case::half(0.5, vec![50.0, 100.0, 150.0, 200.0, 250.0, 300.0, 350.0])]
    #[case::zero(0.0, vec![0.0; 7])]
    fn test_packed(#[case] multiplier: f32, #[case] expected: Vec<f32>) {
        let throttles = UnpackedThrottles::new([100.0, 200.0, 300.0, 400.0, 500.0, 600.0, 700.0]);
        let packed = throttles.packed(multiplier);
        assert_eq!(packed.len(), 28);
        assert_eq!(unpack(&packed), expected);
    }

    #[test]
    fn test_packed_is_cached_per_multiplier() {
        let throttles = UnpackedThrottles::new([1.0; 7]);

        let a = throttles.packed(2.0);
        let b = throttles.packed(2.0);
        assert_eq!(a.as_ptr(), b.as_ptr());

        let c = throttles.packed(3.0);
        assert_ne!(a.as_ptr(), c.as_ptr());
        assert_eq!(unpack(&c), vec![3.0; 7]);
    }

    #[test]
    fn test_throttle_total() {
        let throttles = UnpackedThrottles::new([100.5, 200.0, 0.0, 0.0, 0.0, 0.0, 1.9]);
        assert_eq!(throttles.throttle_total(), 301);
    }
}
