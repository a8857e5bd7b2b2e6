use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, Bytes};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::packet_archive::PacketArchive;
use crate::connection::rtt::RttEstimator;
use crate::connection::unacked_packets::{ResendReason, UnackedPacketCollection};
use crate::packet::{CategoryFlags, OutgoingPacket, PacketCategory, PacketKind};
use crate::throttle::{TokenBucket, UnpackedThrottles};
use crate::util::random::{Random, RngRandom};
use crate::util::tick_clock::TickClock;

/// The share of a viewer's Task rate that is set aside for avatar and object state updates
const STATE_TASK_PERCENTAGE: f32 = 0.8;

/// Viewers inflate their requested rates by this factor
const VIEWER_THROTTLE_INFLATION: f32 = 1.5;

/// Upper bound for a single category's rate in bytes per second. Viewer requests above it are
///  clamped.
const MAX_CATEGORY_RATE: u64 = u32::MAX as u64;

/// The critical ceiling for queued bytes, as a multiple of the configured maximum
const CRITICAL_QUEUE_FACTOR: f64 = 1.5;

/// The circuit code that identifies a viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit {}", self.0)
    }
}

/// The I/O side of the dequeue pass: packets that made it through throttling are handed over for
///  transmission
#[cfg_attr(test, mockall::automock)]
pub trait PacketSink: Send + Sync {
    fn send_packet_final(&self, packet: Arc<OutgoingPacket>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DequeueResult {
    pub packet_sent: bool,
    /// Categories whose queue was (or became) empty during this pass
    pub drained: CategoryFlags,
    /// `true` if listeners should be notified about `drained` now; notifications are rate limited
    pub notify_drained: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketStats {
    /// packets received since the previous report
    pub packets_received: u64,
    /// packets sent since the previous report
    pub packets_sent: u64,
    pub unacked_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReport {
    Unreliable,
    ShouldHaveDropped,
    Critical,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// The transport state of a single viewer connection: per-category queues and token buckets, the
///  dequeue scheduler, reliability bookkeeping (unacked packets, RTT, pending acks, duplicate
///  detection) and bandwidth renegotiation.
///
/// Enqueueing and inbound handling can happen from any thread. The dequeue pass and resend checks
///  are expected to be driven by a single scheduler; they take per-category locks only for the
///  duration of a single queue operation.
pub struct ConnectionState<R: Random = RngRandom> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    config: Arc<TransportConfig>,
    clock: TickClock,

    root_bucket: Arc<TokenBucket>,
    category_buckets: Vec<TokenBucket>,
    queues: Vec<Mutex<VecDeque<Arc<OutgoingPacket>>>>,
    /// a packet that was dequeued but failed its bucket debit, per category
    held_back: Vec<Mutex<Option<Arc<OutgoingPacket>>>>,
    /// categories that held back a packet since the last dynamic throttle adjustment
    starved: AtomicU8,
    queued_bytes: AtomicUsize,

    next_sequence_number: AtomicU32,
    unacked: UnackedPacketCollection,
    rtt: Mutex<RttEstimator>,

    archive: Mutex<PacketArchive>,
    pending_acks: Mutex<VecDeque<u32>>,
    last_packet_received: AtomicU64,

    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent_reported: AtomicU64,
    packets_received_reported: AtomicU64,

    is_connected: AtomicBool,
    last_drop_report: Mutex<Option<Instant>>,
    next_queue_drained: AtomicU64,
    unpacked_throttles: Mutex<Option<Arc<UnpackedThrottles>>>,

    pd: PhantomData<R>,
}

impl ConnectionState<RngRandom> {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, config: Arc<TransportConfig>, scene_bucket: Option<Arc<TokenBucket>>) -> ConnectionState<RngRandom> {
        Self::new_with_random(id, remote_addr, config, scene_bucket)
    }
}

impl <R: Random> ConnectionState<R> {
    pub fn new_with_random(id: ConnectionId, remote_addr: SocketAddr, config: Arc<TransportConfig>, scene_bucket: Option<Arc<TokenBucket>>) -> ConnectionState<R> {
        let now = Instant::now();
        let rates = &config.throttle_rates;

        let root_bucket = Arc::new(TokenBucket::new_at(scene_bucket, rates.total(), rates.total_limit(), now));
        let category_buckets = PacketCategory::ALL.iter()
            .map(|&c| TokenBucket::new_at(Some(root_bucket.clone()), rates.rate_for(c), rates.burst_for(c), now))
            .collect();

        let clock = TickClock::new(now);
        let rtt = RttEstimator::new(config.default_rto, config.max_rto, config.timer_resolution);

        debug!("new connection {} from {:?}", id, remote_addr);

        ConnectionState {
            id,
            remote_addr,
            clock,
            root_bucket,
            category_buckets,
            queues: (0..PacketCategory::COUNT).map(|_| Mutex::new(VecDeque::new())).collect(),
            held_back: (0..PacketCategory::COUNT).map(|_| Mutex::new(None)).collect(),
            starved: AtomicU8::new(0),
            queued_bytes: AtomicUsize::new(0),
            next_sequence_number: AtomicU32::new(0),
            unacked: UnackedPacketCollection::new(),
            rtt: Mutex::new(rtt),
            archive: Mutex::new(PacketArchive::default()),
            pending_acks: Mutex::new(VecDeque::new()),
            // initialized to 'now' to prevent early disconnects
            last_packet_received: AtomicU64::new(clock.ticks_at(now)),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent_reported: AtomicU64::new(0),
            packets_received_reported: AtomicU64::new(0),
            is_connected: AtomicBool::new(true),
            last_drop_report: Mutex::new(None),
            next_queue_drained: AtomicU64::new(0),
            unpacked_throttles: Mutex::new(None),
            config,
            pd: PhantomData::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn root_bucket(&self) -> &Arc<TokenBucket> {
        &self.root_bucket
    }

    pub fn category_bucket(&self, category: PacketCategory) -> &TokenBucket {
        &self.category_buckets[category.index()]
    }

    /// The number of payload bytes in the queues (including held back packets)
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub fn queue_len(&self, category: PacketCategory) -> usize {
        locked(&self.queues[category.index()]).len()
    }

    pub fn unacked(&self) -> &UnackedPacketCollection {
        &self.unacked
    }

    pub fn rto(&self) -> Duration {
        locked(&self.rtt).rto()
    }

    pub fn rtt_estimator(&self) -> RttEstimator {
        locked(&self.rtt).clone()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Acquire)
    }

    /// Adds a packet to its category's queue, subject to the overflow policy: once more than
    ///  the configured maximum is queued, unreliable packets (other than acks and ping replies)
    ///  are dropped, and beyond 1.5 times the maximum everything except resends is dropped.
    ///
    /// Returns `false` if the packet was dropped.
    pub fn enqueue_outgoing(&self, packet: Arc<OutgoingPacket>) -> bool {
        if !self.is_connected() {
            trace!("{} is closed - not enqueueing {:?}", self.id, packet);
            return false;
        }

        let queued = self.queued_bytes();
        let max_queued = self.config.max_outbound_queue_bytes;
        if queued > max_queued && !packet.is_resend() {
            if !packet.is_reliable() && packet.kind() == PacketKind::Regular {
                self.report_drop(DropReport::Unreliable, &packet);
                return false;
            }

            if (queued as f64) < max_queued as f64 * CRITICAL_QUEUE_FACTOR {
                self.report_drop(DropReport::ShouldHaveDropped, &packet);
            }
            else {
                self.report_drop(DropReport::Critical, &packet);
                return false;
            }
        }

        self.push(packet.category(), packet);
        true
    }

    /// Puts a packet that is due for retransmission on the Resend queue, bypassing the overflow
    ///  policy. The packet's own category is left unchanged.
    pub fn requeue_resend(&self, packet: Arc<OutgoingPacket>) {
        if !self.is_connected() {
            return;
        }
        self.push(PacketCategory::Resend, packet);
    }

    fn push(&self, queue: PacketCategory, packet: Arc<OutgoingPacket>) {
        self.queued_bytes.fetch_add(packet.data_size(), Ordering::AcqRel);
        locked(&self.queues[queue.index()]).push_back(packet);
    }

    fn report_drop(&self, kind: DropReport, packet: &OutgoingPacket) {
        let now = Instant::now();
        {
            let mut last = locked(&self.last_drop_report);
            if let Some(last) = *last {
                if now.saturating_duration_since(last) < self.config.drop_report_interval {
                    return;
                }
            }
            *last = Some(now);
        }

        match kind {
            DropReport::Unreliable => warn!("packets are being dropped for {} due to overfilled outbound queue, last packet {:?}", self.id, packet),
            DropReport::ShouldHaveDropped => warn!("packet should have been dropped for {} due to overfilled outbound queue, but was reliable. Last packet {:?}", self.id, packet),
            DropReport::Critical => warn!("reliable packets are being dropped for {} due to overfilled outbound queue, last packet {:?}", self.id, packet),
        }
    }

    pub fn dequeue_outgoing(&self, sink: &dyn PacketSink) -> DequeueResult {
        self.dequeue_outgoing_at(Instant::now(), sink)
    }

    /// One pass of the scheduler over all categories, starting at a random one: a held back
    ///  packet is retried, otherwise the next packet is taken from the queue. Packets that pass
    ///  their category's bucket (and thereby the connection's and the listener's buckets) are
    ///  handed to the sink, the others are held back for the next pass.
    pub fn dequeue_outgoing_at(&self, now: Instant, sink: &dyn PacketSink) -> DequeueResult {
        let mut result = DequeueResult::default();
        if !self.is_connected() {
            return result;
        }

        let now_ticks = self.clock.ticks_at(now);
        let start = R::gen_usize_range(0..PacketCategory::COUNT);

        for j in 0..PacketCategory::COUNT {
            let i = (j + start) % PacketCategory::COUNT;
            let bucket = &self.category_buckets[i];
            let flag = CategoryFlags::from_bits_truncate(1 << i);

            let mut held_back = locked(&self.held_back[i]);
            if let Some(packet) = held_back.as_ref() {
                if bucket.try_debit_at(packet.data_size(), now) {
                    if let Some(packet) = held_back.take() {
                        self.transmit(packet, now_ticks, sink);
                        result.packet_sent = true;
                    }
                }
                // a failed retry leaves the starved bits alone: the category was flagged once when
                //  the packet was first held back, and that single spare burst grant is intended
                continue;
            }

            let (popped, now_empty) = {
                let mut queue = locked(&self.queues[i]);
                let popped = queue.pop_front();
                (popped, queue.is_empty())
            };

            match popped {
                Some(packet) => {
                    if bucket.try_debit_at(packet.data_size(), now) {
                        self.transmit(packet, now_ticks, sink);
                        result.packet_sent = true;
                    }
                    else {
                        *held_back = Some(packet);
                        self.starved.fetch_or(flag.bits(), Ordering::AcqRel);
                    }
                    if now_empty {
                        result.drained |= flag;
                    }
                }
                None => {
                    result.drained |= flag;
                }
            }
        }

        if !result.drained.is_empty() {
            let next = self.next_queue_drained.load(Ordering::Acquire);
            if now_ticks >= next {
                let interval = self.config.queue_drained_min_interval.as_millis() as u64;
                self.next_queue_drained.store(now_ticks + interval, Ordering::Release);
                result.notify_drained = true;
            }
        }

        result
    }

    fn next_sequence_number(&self) -> u32 {
        loop {
            let seq = self.next_sequence_number.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Sequence numbers are assigned on first transmission so that sequence order is send order
    fn transmit(&self, packet: Arc<OutgoingPacket>, now_ticks: u64, sink: &dyn PacketSink) {
        let size = packet.data_size();
        self.queued_bytes.fetch_sub(size, Ordering::AcqRel);

        if !packet.has_sequence_number() {
            packet.assign_sequence_number(self.next_sequence_number());
        }
        packet.mark_sent(now_ticks);
        if packet.is_reliable() && !packet.is_resend() {
            self.unacked.add(packet.clone());
        }

        self.packets_sent.fetch_add(1, Ordering::AcqRel);
        self.bytes_sent.fetch_add(size as u64, Ordering::AcqRel);

        trace!("sending {:?}", packet);
        sink.send_packet_final(packet);
    }

    /// If categories were starved since the last call while the connection's aggregate bucket
    ///  still has content, that content is split evenly between the starved categories as a
    ///  one-shot burst allowance. Returns `true` if an adjustment was made.
    pub fn perform_dynamic_throttle_adjustment(&self) -> bool {
        let starved = CategoryFlags::from_bits_truncate(self.starved.swap(0, Ordering::AcqRel));
        let content = self.root_bucket.content();
        if content == 0 || starved.is_empty() {
            return false;
        }

        let share = content / starved.bits().count_ones() as u64;
        for category in starved.categories() {
            self.category_buckets[category.index()].grant_spare_burst(share);
        }
        trace!("{}: distributed {} spare bytes to {:?}", self.id, content, starved);
        true
    }

    /// Applies rates requested by the viewer: 7 little-endian floats in bits per second (resend,
    ///  land, wind, cloud, task, texture, asset), inflated by 1.5 on the viewer side. Every
    ///  category is floored at one MTU per second. Returns `true` if the connection's aggregate
    ///  rate changed.
    pub fn set_throttles(&self, blob: &[u8]) -> anyhow::Result<bool> {
        let expected_len = PacketCategory::WIRE_COUNT * std::mem::size_of::<f32>();
        if blob.len() < expected_len {
            bail!("throttle blob of {} bytes is too short, expected {}", blob.len(), expected_len);
        }

        let mut buf = blob;
        let mut wire = [0i64; PacketCategory::WIRE_COUNT];
        for value in wire.iter_mut() {
            let bits = buf.get_f32_le() as i64;
            let bits = (bits as f32 / VIEWER_THROTTLE_INFLATION) as i64;
            *value = bits.saturating_add(7) / 8;
        }
        let [resend, land, wind, cloud, task, texture, asset] = wire;

        let state = (task as f32 * STATE_TASK_PERCENTAGE) as i64;
        let task = task - state;

        let mtu = self.config.mtu;
        let floor = |v: i64| (v.max(0) as u64).clamp(mtu, MAX_CATEGORY_RATE.max(mtu));

        let mut rates = [0u64; PacketCategory::COUNT];
        rates[PacketCategory::Resend.index()] = floor(resend);
        rates[PacketCategory::Land.index()] = floor(land);
        rates[PacketCategory::Wind.index()] = floor(wind);
        rates[PacketCategory::Cloud.index()] = floor(cloud);
        rates[PacketCategory::Task.index()] = floor(task);
        rates[PacketCategory::Texture.index()] = floor(texture);
        rates[PacketCategory::Asset.index()] = floor(asset);
        rates[PacketCategory::State.index()] = floor(state);

        let total: u64 = rates.iter().sum();
        let old_total = self.root_bucket.drip_rate();
        let changed = old_total != total;
        if changed {
            info!("{}: viewer bandwidth throttle request {} kbps -> {} kbps", self.id, old_total.saturating_mul(8) / 1024, total.saturating_mul(8) / 1024);
        }

        self.root_bucket.set_rate(total, total);
        for category in PacketCategory::ALL {
            let rate = rates[category.index()];
            self.category_buckets[category.index()].set_rate(rate, rate);
        }
        debug!("{}: throttles set to {:?}", self.id, rates);

        *locked(&self.unpacked_throttles) = None;
        Ok(changed)
    }

    /// The effective per-category rates in the form they are announced to viewers
    pub fn throttles_unpacked(&self) -> Arc<UnpackedThrottles> {
        let mut cached = locked(&self.unpacked_throttles);
        if let Some(throttles) = cached.as_ref() {
            return throttles.clone();
        }

        let bits = |c: PacketCategory| (self.category_buckets[c.index()].drip_rate().saturating_mul(8)) as f32;
        let throttles = Arc::new(UnpackedThrottles::new([
            bits(PacketCategory::Resend),
            bits(PacketCategory::Land),
            bits(PacketCategory::Wind),
            bits(PacketCategory::Cloud),
            bits(PacketCategory::Task) + bits(PacketCategory::State),
            bits(PacketCategory::Texture),
            bits(PacketCategory::Asset),
        ]));
        *cached = Some(throttles.clone());
        throttles
    }

    pub fn get_current_throttles_wire_format(&self, multiplier: f32) -> Bytes {
        self.throttles_unpacked().packed(multiplier)
    }

    /// Bookkeeping for every datagram received from this connection's peer
    pub fn register_received(&self, now: Instant) {
        self.packets_received.fetch_add(1, Ordering::AcqRel);
        self.last_packet_received.store(self.clock.ticks_at(now), Ordering::Release);
    }

    /// Registers an incoming reliable packet: returns `false` for a duplicate (which must not be
    ///  processed again). The sequence number is queued for acknowledgement either way, since
    ///  the peer resends because our previous ack got lost.
    pub fn register_incoming_reliable(&self, sequence_number: u32) -> bool {
        locked(&self.pending_acks).push_back(sequence_number);
        locked(&self.archive).try_enqueue(sequence_number)
    }

    /// Removes up to `max` sequence numbers that are waiting to be acknowledged to the peer
    pub fn take_pending_acks(&self, max: usize) -> Vec<u32> {
        let mut pending = locked(&self.pending_acks);
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    pub fn has_pending_acks(&self) -> bool {
        !locked(&self.pending_acks).is_empty()
    }

    /// Registers an acknowledgement received from the peer. It is applied to the unacked
    ///  collection on the next resend check.
    pub fn acknowledge(&self, sequence_number: u32, now: Instant, from_resend: bool) {
        self.unacked.remove(sequence_number, self.clock.ticks_at(now), from_resend);
    }

    /// Applies pending acks (feeding RTT samples into the estimator) and requeues packets that
    ///  timed out or qualify for fast retransmit. A timeout backs off the RTO once per check,
    ///  regardless of the number of expired packets. Returns the number of requeued packets.
    pub fn resend_unacked(&self, now: Instant) -> usize {
        if !self.is_connected() {
            return 0;
        }

        let now_ticks = self.clock.ticks_at(now);
        let rto_millis = locked(&self.rtt).rto_millis();
        let scan = self.unacked.drain_and_scan(now_ticks, rto_millis);

        {
            let mut rtt = locked(&self.rtt);
            for sample in &scan.rtt_samples {
                rtt.update_round_trip(*sample);
            }
            if scan.reason.contains(ResendReason::TIMEOUT_EXPIRED) {
                rtt.backoff_rto();
                debug!("{}: packets timed out, RTO backed off to {}ms", self.id, rtt.rto_millis());
            }
        }

        let num_expired = scan.expired.len();
        for packet in scan.expired {
            let resends = packet.increment_resend_count();
            trace!("{}: resending {:?} ({:?}, resend #{})", self.id, packet, scan.reason, resends);
            self.requeue_resend(packet);
        }
        num_expired
    }

    /// Counters since the previous call
    pub fn take_packet_stats(&self) -> PacketStats {
        let sent = self.packets_sent.load(Ordering::Acquire);
        let received = self.packets_received.load(Ordering::Acquire);
        let sent_reported = self.packets_sent_reported.swap(sent, Ordering::AcqRel);
        let received_reported = self.packets_received_reported.swap(received, Ordering::AcqRel);

        PacketStats {
            packets_received: received.saturating_sub(received_reported),
            packets_sent: sent.saturating_sub(sent_reported),
            unacked_bytes: self.unacked.unacked_bytes(),
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        let last = self.last_packet_received.load(Ordering::Acquire);
        let timeout = self.config.connection_timeout.as_millis() as u64;
        self.clock.ticks_at(now).saturating_sub(last) >= timeout
    }

    /// Closes the connection: all queued and unacked packets are released, and nothing can be
    ///  enqueued afterwards
    pub fn shutdown(&self) {
        if !self.is_connected.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down connection {}", self.id);

        for i in 0..PacketCategory::COUNT {
            locked(&self.queues[i]).clear();
            *locked(&self.held_back[i]) = None;
        }
        self.queued_bytes.store(0, Ordering::Release);
        self.unacked.clear();
        locked(&self.pending_acks).clear();
    }
}
