use std::collections::VecDeque;
use rustc_hash::FxHashSet;

/// Remembers the sequence numbers of the most recently received reliable packets so that
///  retransmissions of packets that were already processed can be detected and dropped. The peer
///  resends if our ack got lost, so duplicates are expected in normal operation.
pub struct PacketArchive {
    capacity: usize,
    set: FxHashSet<u32>,
    order: VecDeque<u32>,
}

impl PacketArchive {
    pub const DEFAULT_CAPACITY: usize = 384;

    pub fn new(capacity: usize) -> PacketArchive {
        PacketArchive {
            capacity,
            set: FxHashSet::default(),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `false` if the sequence number is already in the archive, i.e. for a duplicate.
    ///  Otherwise it is added, evicting the oldest entry if the archive is full.
    pub fn try_enqueue(&mut self, sequence_number: u32) -> bool {
        if !self.set.insert(sequence_number) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(sequence_number);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for PacketArchive {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates() {
        let mut archive = PacketArchive::default();
        assert!(archive.try_enqueue(1));
        assert!(archive.try_enqueue(2));
        assert!(!archive.try_enqueue(1));
        assert!(!archive.try_enqueue(2));
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_eviction() {
        let mut archive = PacketArchive::new(3);
        for seq in 1..=4 {
            assert!(archive.try_enqueue(seq));
        }
        assert_eq!(archive.len(), 3);

        // 1 was evicted
        assert!(archive.try_enqueue(1));
        assert!(!archive.try_enqueue(3));
        assert!(!archive.try_enqueue(4));
        assert!(archive.try_enqueue(2));
    }
}
