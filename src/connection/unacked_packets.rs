use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use bitflags::bitflags;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::packet::OutgoingPacket;

/// The number of acks for higher sequence numbers after which an unacked packet is assumed lost
///  without waiting for its timeout
pub const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResendReason: u8 {
        const TIMEOUT_EXPIRED = 1 << 0;
        const FAST_RETRANSMIT = 1 << 1;
    }
}

/// An acknowledgement waiting to be applied to the collection
#[derive(Debug, Clone, Copy)]
pub struct PendingAck {
    pub sequence_number: u32,
    /// tick count at which the ack was received
    pub received_at: u64,
    /// acks that arrived on a resent packet do not yield RTT samples
    pub from_resend: bool,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub reason: ResendReason,
    /// Packets to be resent, in sequence order. Their send timestamp is reset to 0.
    pub expired: Vec<Arc<OutgoingPacket>>,
    /// round trip times in milliseconds, one per ack of a packet that was not resent
    pub rtt_samples: Vec<f64>,
}

struct UnackedInner {
    pending_adds: mpsc::UnboundedReceiver<Arc<OutgoingPacket>>,
    pending_removes: mpsc::UnboundedReceiver<PendingAck>,
    packets: BTreeMap<u32, Arc<OutgoingPacket>>,
    highest_ack: u32,
}

/// Tracks reliable packets that were sent but not acknowledged yet.
///
/// `add` and `remove` can be called from any number of threads (send completions, receive
///  handling) without ever blocking: they only push to unbounded lock-free queues. These queues
///  are applied to the sequence-indexed map by `drain_and_scan`, which is the only place that
///  touches the map and is called from the scheduler.
pub struct UnackedPacketCollection {
    pending_adds: mpsc::UnboundedSender<Arc<OutgoingPacket>>,
    pending_removes: mpsc::UnboundedSender<PendingAck>,
    unacked_bytes: AtomicUsize,
    inner: Mutex<UnackedInner>,
}

impl Default for UnackedPacketCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl UnackedPacketCollection {
    pub fn new() -> UnackedPacketCollection {
        let (adds_tx, adds_rx) = mpsc::unbounded_channel();
        let (removes_tx, removes_rx) = mpsc::unbounded_channel();

        UnackedPacketCollection {
            pending_adds: adds_tx,
            pending_removes: removes_tx,
            unacked_bytes: AtomicUsize::new(0),
            inner: Mutex::new(UnackedInner {
                pending_adds: adds_rx,
                pending_removes: removes_rx,
                packets: BTreeMap::new(),
                highest_ack: 0,
            }),
        }
    }

    /// Registers a packet that was just sent reliably. The packet must have its sequence number
    ///  assigned.
    pub fn add(&self, packet: Arc<OutgoingPacket>) {
        self.unacked_bytes.fetch_add(packet.data_size(), Ordering::AcqRel);
        // the receiver lives in `self`, so sending can not fail
        let _ = self.pending_adds.send(packet);
    }

    /// Registers an acknowledgement for a sequence number
    pub fn remove(&self, sequence_number: u32, received_at: u64, from_resend: bool) {
        let _ = self.pending_removes.send(PendingAck {
            sequence_number,
            received_at,
            from_resend,
        });
    }

    /// The number of payload bytes of packets that were added but not acknowledged yet. Acks are
    ///  accounted for when they are applied in [UnackedPacketCollection::drain_and_scan].
    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes.load(Ordering::Acquire)
    }

    /// The number of packets in the map, excluding operations that are still pending
    pub fn len(&self) -> usize {
        self.lock_inner().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn highest_ack(&self) -> u32 {
        self.lock_inner().highest_ack
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, UnackedInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies all pending adds and removes, and then determines packets that need to be resent:
    ///  the oldest packet that trails the highest acknowledged sequence number by at least
    ///  [FAST_RETRANSMIT_THRESHOLD] (if it was never resent before), and all packets whose last
    ///  transmission is at least `timeout_millis` ago.
    ///
    /// Packets that are waiting for retransmission (i.e. with a send timestamp of 0) are skipped.
    pub fn drain_and_scan(&self, now: u64, timeout_millis: u64) -> ScanResult {
        let mut inner = self.lock_inner();
        let mut result = ScanResult::default();

        self.process_queues(&mut inner, &mut result);

        let highest_ack = inner.highest_ack;
        let mut fast_retransmit_done = false;
        for packet in inner.packets.values() {
            let sent_at = packet.sent_at();
            if sent_at == 0 {
                continue;
            }

            if !fast_retransmit_done
                && packet.resend_count() == 0
                && packet.sequence_number().saturating_add(FAST_RETRANSMIT_THRESHOLD) <= highest_ack
            {
                trace!("fast retransmit of packet #{} (highest ack #{})", packet.sequence_number(), highest_ack);
                fast_retransmit_done = true;
                packet.mark_pending_resend();
                result.reason |= ResendReason::FAST_RETRANSMIT;
                result.expired.push(packet.clone());
            }
            else if now.saturating_sub(sent_at) >= timeout_millis {
                trace!("packet #{} timed out", packet.sequence_number());
                packet.mark_pending_resend();
                result.reason |= ResendReason::TIMEOUT_EXPIRED;
                result.expired.push(packet.clone());
            }
        }

        result
    }

    fn process_queues(&self, inner: &mut UnackedInner, result: &mut ScanResult) {
        while let Ok(packet) = inner.pending_adds.try_recv() {
            if let Some(replaced) = inner.packets.insert(packet.sequence_number(), packet) {
                // a packet with the same sequence number was registered twice
                self.unacked_bytes.fetch_sub(replaced.data_size(), Ordering::AcqRel);
            }
        }

        while let Ok(ack) = inner.pending_removes.try_recv() {
            let Some(acked) = inner.packets.remove(&ack.sequence_number) else {
                trace!("ack for unknown packet #{} - ignoring", ack.sequence_number);
                continue;
            };

            inner.highest_ack = inner.highest_ack.max(ack.sequence_number);
            if inner.highest_ack > ack.sequence_number && inner.highest_ack - ack.sequence_number > u32::MAX / 2 {
                debug!("sequence number wraparound: resetting highest ack from #{} to #{}", inner.highest_ack, ack.sequence_number);
                inner.highest_ack = ack.sequence_number;
            }

            self.unacked_bytes.fetch_sub(acked.data_size(), Ordering::AcqRel);

            if !ack.from_resend {
                let sent_at = acked.sent_at();
                if sent_at != 0 && ack.received_at > sent_at {
                    result.rtt_samples.push((ack.received_at - sent_at) as f64);
                }
            }
        }
    }

    /// Discards all packets and pending operations, e.g. when the connection is closed
    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        while inner.pending_adds.try_recv().is_ok() {}
        while inner.pending_removes.try_recv().is_ok() {}
        inner.packets.clear();
        self.unacked_bytes.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::packet::{PacketCategory, PacketKind};
    use super::*;

    fn packet(seq: u32, sent_at: u64) -> Arc<OutgoingPacket> {
        let result = OutgoingPacket::new(SocketAddr::from(([1,2,3,4], 5)), PacketCategory::Task, true, PacketKind::Regular, Bytes::from(vec![0; 10])).unwrap();
        result.assign_sequence_number(seq);
        result.mark_sent(sent_at);
        Arc::new(result)
    }

    fn seqs(packets: &[Arc<OutgoingPacket>]) -> Vec<u32> {
        packets.iter().map(|p| p.sequence_number()).collect()
    }

    #[test]
    fn test_add_is_deferred() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, 10));
        assert_eq!(unacked.unacked_bytes(), 10);
        assert_eq!(unacked.len(), 0);

        let result = unacked.drain_and_scan(11, 1000);
        assert!(result.expired.is_empty());
        assert_eq!(result.reason, ResendReason::empty());
        assert_eq!(unacked.len(), 1);
    }

    #[test]
    fn test_fast_retransmit_flags_oldest() {
        let unacked = UnackedPacketCollection::new();
        for seq in 100..=113 {
            unacked.add(packet(seq, 10));
        }
        unacked.remove(113, 20, false);

        let result = unacked.drain_and_scan(21, 100_000);
        assert_eq!(result.reason, ResendReason::FAST_RETRANSMIT);
        assert_eq!(seqs(&result.expired), vec![100]);
        assert_eq!(result.expired[0].sent_at(), 0);
        assert_eq!(unacked.highest_ack(), 113);

        // 100 is pending resend now, so the next scan picks the next one
        let result = unacked.drain_and_scan(22, 100_000);
        assert_eq!(seqs(&result.expired), vec![101]);
    }

    #[test]
    fn test_fast_retransmit_threshold() {
        let unacked = UnackedPacketCollection::new();
        for seq in 1..=3 {
            unacked.add(packet(seq, 10));
        }
        unacked.remove(3, 20, false);

        // 1 + 3 > 3
        let result = unacked.drain_and_scan(21, 100_000);
        assert!(result.expired.is_empty());

        unacked.add(packet(4, 10));
        unacked.remove(4, 20, false);
        let result = unacked.drain_and_scan(21, 100_000);
        assert_eq!(seqs(&result.expired), vec![1]);
    }

    #[test]
    fn test_fast_retransmit_skips_resent_packets() {
        let unacked = UnackedPacketCollection::new();
        let resent = packet(1, 10);
        resent.increment_resend_count();
        unacked.add(resent);
        unacked.add(packet(2, 10));
        for seq in 3..=5 {
            unacked.add(packet(seq, 10));
        }
        unacked.remove(5, 20, false);

        let result = unacked.drain_and_scan(21, 100_000);
        assert_eq!(seqs(&result.expired), vec![2]);
    }

    #[rstest]
    #[case::not_yet(100, 1099, 1000, vec![])]
    #[case::exact(100, 1100, 1000, vec![1, 2])]
    #[case::later(100, 5000, 1000, vec![1, 2])]
    fn test_timeout(#[case] sent_at: u64, #[case] now: u64, #[case] timeout: u64, #[case] expected: Vec<u32>) {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, sent_at));
        unacked.add(packet(2, sent_at));

        let result = unacked.drain_and_scan(now, timeout);
        assert_eq!(seqs(&result.expired), expected);
        if !expected.is_empty() {
            assert_eq!(result.reason, ResendReason::TIMEOUT_EXPIRED);
        }
    }

    #[test]
    fn test_pending_resend_is_skipped() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, 100));

        assert_eq!(unacked.drain_and_scan(2000, 1000).expired.len(), 1);
        assert!(unacked.drain_and_scan(5000, 1000).expired.is_empty());
    }

    #[test]
    fn test_remove_updates_bytes_and_rtt() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, 100));
        unacked.add(packet(2, 100));
        unacked.add(packet(3, 100));
        unacked.remove(1, 350, false);
        unacked.remove(2, 400, true);
        unacked.remove(99, 400, false);

        let result = unacked.drain_and_scan(400, 10_000);
        assert_eq!(result.rtt_samples, vec![250.0]);
        assert_eq!(unacked.unacked_bytes(), 10);
        assert_eq!(unacked.len(), 1);
    }

    #[test]
    fn test_adds_are_applied_before_removes() {
        let unacked = UnackedPacketCollection::new();
        unacked.remove(7, 200, false);
        unacked.add(packet(7, 100));

        let result = unacked.drain_and_scan(200, 10_000);
        assert_eq!(result.rtt_samples, vec![100.0]);
        assert!(unacked.is_empty());
        assert_eq!(unacked.unacked_bytes(), 0);
    }

    #[test]
    fn test_wraparound_resets_highest_ack() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(u32::MAX - 1, 10));
        unacked.remove(u32::MAX - 1, 20, false);
        unacked.drain_and_scan(20, 100_000);
        assert_eq!(unacked.highest_ack(), u32::MAX - 1);

        unacked.add(packet(2, 10));
        unacked.add(packet(5, 10));
        unacked.add(packet(6, 10));
        unacked.remove(6, 20, false);
        let result = unacked.drain_and_scan(20, 100_000);
        assert_eq!(unacked.highest_ack(), 6);
        assert_eq!(seqs(&result.expired), vec![2]);
    }

    #[test]
    fn test_duplicate_ack_decrements_once() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, 10));
        unacked.add(packet(2, 10));
        unacked.remove(1, 20, false);
        unacked.remove(1, 21, false);

        unacked.drain_and_scan(21, 100_000);
        assert_eq!(unacked.unacked_bytes(), 10);
    }

    #[test]
    fn test_concurrent_add_remove() {
        let unacked = Arc::new(UnackedPacketCollection::new());

        let handles = (0..8u32)
            .map(|t| {
                let unacked = unacked.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let seq = t * 1000 + i + 1;
                        unacked.add(packet(seq, 10));
                        if i % 2 == 0 {
                            unacked.remove(seq, 20, false);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        let result = unacked.drain_and_scan(20, 100_000);
        assert_eq!(unacked.len(), 4000);
        assert_eq!(unacked.unacked_bytes(), 4000 * 10);
        assert_eq!(result.rtt_samples.len(), 4000);
    }

    #[test]
    fn test_clear() {
        let unacked = UnackedPacketCollection::new();
        unacked.add(packet(1, 10));
        unacked.drain_and_scan(10, 1000);
        unacked.add(packet(2, 10));

        unacked.clear();
        assert!(unacked.is_empty());
        assert_eq!(unacked.unacked_bytes(), 0);
        assert!(unacked.drain_and_scan(10_000, 1000).expired.is_empty());
    }
}
