use std::cmp::min;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

/// Token amounts are stored as fixed-point values with this many units per byte so that frequent
///  refills with small elapsed times do not lose fractions of a byte
const UNITS_PER_BYTE: u64 = 1000;

/// A token bucket that is (optionally) part of a hierarchy: a debit succeeds only if this bucket
///  *and* all its ancestors hold enough tokens, and it is then applied to all of them. That way a
///  per-category bucket can never exceed its connection's aggregate rate, which in turn can never
///  exceed the end point's aggregate rate.
///
/// All state is kept in atomics, and debits walk the chain from the root down using
///  compare-and-swap, rolling back already-applied debits if some bucket further down comes up
///  short. There is no lock shared between connections.
///
/// A drip rate of 0 means 'unlimited': such a bucket never blocks a debit.
pub struct TokenBucket {
    parent: Option<Arc<TokenBucket>>,

    /// bytes per second
    drip_rate: AtomicU64,
    /// bytes
    max_burst: AtomicU64,
    /// fixed-point, see [UNITS_PER_BYTE]
    content: AtomicU64,
    /// one-shot allowance above `max_burst`, fixed-point. It is granted by dynamic throttle
    ///  adjustment and used up by debits
    spare_burst: AtomicU64,

    created: Instant,
    /// microseconds since `created`
    last_refill: AtomicU64,
}

impl TokenBucket {
    pub fn new(parent: Option<Arc<TokenBucket>>, drip_rate: u64, max_burst: u64) -> TokenBucket {
        Self::new_at(parent, drip_rate, max_burst, Instant::now())
    }

    /// Creates a bucket that is initially full
    pub fn new_at(parent: Option<Arc<TokenBucket>>, drip_rate: u64, max_burst: u64, now: Instant) -> TokenBucket {
        TokenBucket {
            parent,
            drip_rate: AtomicU64::new(drip_rate),
            max_burst: AtomicU64::new(max_burst),
            content: AtomicU64::new(max_burst.saturating_mul(UNITS_PER_BYTE)),
            spare_burst: AtomicU64::new(0),
            created: now,
            last_refill: AtomicU64::new(0),
        }
    }

    pub fn parent(&self) -> Option<&Arc<TokenBucket>> {
        self.parent.as_ref()
    }

    pub fn drip_rate(&self) -> u64 {
        self.drip_rate.load(Ordering::Acquire)
    }

    pub fn max_burst(&self) -> u64 {
        self.max_burst.load(Ordering::Acquire)
    }

    pub fn is_unlimited(&self) -> bool {
        self.drip_rate() == 0
    }

    /// The number of whole bytes that can currently be spent from this bucket (ignoring ancestors)
    pub fn content(&self) -> u64 {
        self.content.load(Ordering::Acquire) / UNITS_PER_BYTE
    }

    pub fn spare_burst(&self) -> u64 {
        self.spare_burst.load(Ordering::Acquire) / UNITS_PER_BYTE
    }

    fn ceiling(&self) -> u64 {
        self.max_burst().saturating_mul(UNITS_PER_BYTE)
            .saturating_add(self.spare_burst.load(Ordering::Acquire))
    }

    /// Replaces both rate parameters. Content exceeding the new burst limit is discarded.
    pub fn set_rate(&self, drip_rate: u64, max_burst: u64) {
        self.drip_rate.store(drip_rate, Ordering::Release);
        self.max_burst.store(max_burst, Ordering::Release);

        let ceiling = self.ceiling();
        let _ = self.content.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(min(c, ceiling)));
    }

    /// Grants a one-shot allowance of at least `bytes` on top of the regular content, allowing
    ///  this bucket to temporarily exceed its burst limit. An allowance that is still outstanding
    ///  is raised rather than added to, so repeated grants do not accumulate.
    pub fn grant_spare_burst(&self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        let amount = bytes.saturating_mul(UNITS_PER_BYTE);
        let prev = self.spare_burst.fetch_max(amount, Ordering::AcqRel);
        if amount > prev {
            self.content.fetch_add(amount - prev, Ordering::AcqRel);
        }
    }

    pub fn refill(&self) {
        self.refill_at(Instant::now())
    }

    /// Adds tokens for the time elapsed since the previous refill, clamped to the burst limit.
    ///  Ancestors are not touched - each bucket refills at its own rate.
    pub fn refill_at(&self, now: Instant) {
        let now_micros = now.saturating_duration_since(self.created).as_micros() as u64;
        let last = self.last_refill.load(Ordering::Acquire);
        if now_micros <= last {
            return;
        }
        if self.last_refill.compare_exchange(last, now_micros, Ordering::AcqRel, Ordering::Acquire).is_err() {
            // a concurrent refill covered (most of) this interval
            return;
        }

        let drip_rate = self.drip_rate();
        if drip_rate == 0 {
            return;
        }

        // bytes/s * us / 1000 == bytes * UNITS_PER_BYTE
        let added = (drip_rate as u128 * (now_micros - last) as u128 * UNITS_PER_BYTE as u128 / 1_000_000)
            .min(u64::MAX as u128) as u64;
        let ceiling = self.ceiling();
        let _ = self.content.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(min(c.saturating_add(added), ceiling)));
    }

    pub fn try_debit(&self, num_bytes: usize) -> bool {
        self.try_debit_at(num_bytes, Instant::now())
    }

    /// Removes `num_bytes` tokens from this bucket and all its ancestors if all of them have
    ///  enough. Returns `false` and leaves all buckets unchanged otherwise.
    pub fn try_debit_at(&self, num_bytes: usize, now: Instant) -> bool {
        let mut chain: Vec<&TokenBucket> = Vec::with_capacity(4);
        let mut cur = Some(self);
        while let Some(bucket) = cur {
            chain.push(bucket);
            cur = bucket.parent.as_deref();
        }
        chain.reverse();

        for bucket in &chain {
            bucket.refill_at(now);
        }

        let amount = (num_bytes as u64).saturating_mul(UNITS_PER_BYTE);
        let mut taken: Vec<u64> = Vec::with_capacity(chain.len());
        for bucket in &chain {
            match bucket.try_take(amount) {
                Some(spare_taken) => taken.push(spare_taken),
                None => {
                    trace!("token bucket debit of {} bytes failed at depth {}", num_bytes, taken.len());
                    for (prev, spare_taken) in chain.iter().zip(taken) {
                        prev.give_back(amount, spare_taken);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// returns the part of the amount that was taken from the spare burst allowance
    fn try_take(&self, amount: u64) -> Option<u64> {
        if self.is_unlimited() {
            return Some(0);
        }

        self.content
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(amount))
            .ok()?;

        let spare_before = self.spare_burst
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.saturating_sub(amount)))
            .unwrap_or(0);
        Some(min(spare_before, amount))
    }

    fn give_back(&self, amount: u64, spare_taken: u64) {
        if self.is_unlimited() {
            return;
        }

        self.spare_burst.fetch_add(spare_taken, Ordering::AcqRel);
        let ceiling = self.ceiling();
        let _ = self.content.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(min(c.saturating_add(amount), ceiling)));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_starts_full() {
        let bucket = TokenBucket::new(None, 100, 500);
        assert_eq!(bucket.content(), 500);
    }

    #[rstest]
    #[case::exact(500, 500, true, 0)]
    #[case::less(500, 200, true, 300)]
    #[case::more(500, 501, false, 500)]
    #[case::zero(500, 0, true, 500)]
    fn test_debit(#[case] burst: u64, #[case] debit: usize, #[case] expected: bool, #[case] expected_content: u64) {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(None, 100, burst, now);

        assert_eq!(bucket.try_debit_at(debit, now), expected);
        assert_eq!(bucket.content(), expected_content);
    }

    #[test]
    fn test_refill_is_clamped_to_burst() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(None, 1000, 1500, t0);
        assert!(bucket.try_debit_at(1500, t0));
        assert_eq!(bucket.content(), 0);

        bucket.refill_at(t0 + Duration::from_millis(500));
        assert_eq!(bucket.content(), 500);

        bucket.refill_at(t0 + Duration::from_secs(100));
        assert_eq!(bucket.content(), 1500);
    }

    #[test]
    fn test_refill_accumulates_fractions() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(None, 1000, 1000, t0);
        assert!(bucket.try_debit_at(1000, t0));

        // 0.1 bytes per 100us
        for i in 1..=1000 {
            bucket.refill_at(t0 + Duration::from_micros(100 * i));
        }
        assert_eq!(bucket.content(), 100);
    }

    #[test]
    fn test_refill_ignores_going_back_in_time() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(None, 1000, 1000, t0);
        assert!(bucket.try_debit_at(1000, t0));

        bucket.refill_at(t0 + Duration::from_secs(1));
        assert!(bucket.try_debit_at(1000, t0 + Duration::from_secs(1)));
        bucket.refill_at(t0 + Duration::from_millis(500));
        assert_eq!(bucket.content(), 0);
    }

    #[test]
    fn test_failed_child_debit_leaves_parent_untouched() {
        let now = Instant::now();
        let parent = Arc::new(TokenBucket::new_at(None, 1000, 1000, now));
        let child = TokenBucket::new_at(Some(parent.clone()), 100, 100, now);

        assert!(!child.try_debit_at(200, now));
        assert_eq!(parent.content(), 1000);
        assert_eq!(child.content(), 100);

        assert!(child.try_debit_at(60, now));
        assert_eq!(parent.content(), 940);
        assert_eq!(child.content(), 40);
    }

    #[test]
    fn test_failed_parent_debit_leaves_child_untouched() {
        let now = Instant::now();
        let grandparent = Arc::new(TokenBucket::new_at(None, 1000, 1000, now));
        let parent = Arc::new(TokenBucket::new_at(Some(grandparent.clone()), 50, 50, now));
        let child = TokenBucket::new_at(Some(parent.clone()), 1000, 1000, now);

        assert!(!child.try_debit_at(100, now));
        assert_eq!(grandparent.content(), 1000);
        assert_eq!(parent.content(), 50);
        assert_eq!(child.content(), 1000);
    }

    #[test]
    fn test_unlimited_bucket_never_blocks() {
        let now = Instant::now();
        let root = Arc::new(TokenBucket::new_at(None, 0, 0, now));
        let child = TokenBucket::new_at(Some(root.clone()), 1000, 1000, now);

        assert!(root.is_unlimited());
        assert!(child.try_debit_at(1000, now));
        assert!(!child.try_debit_at(1, now));
        assert!(root.try_debit_at(1_000_000, now));
    }

    #[test]
    fn test_token_conservation() {
        let t0 = Instant::now();
        let drip = 10_000u64;
        let burst = 3_000u64;
        let bucket = TokenBucket::new_at(None, drip, burst, t0);

        let mut total_debited = 0u64;
        let mut now = t0;
        for i in 0..5_000u64 {
            now += Duration::from_micros(137 + (i % 7) * 50);
            let size = 100 + (i * 37 % 900) as usize;
            if bucket.try_debit_at(size, now) {
                total_debited += size as u64;
            }
        }

        let elapsed = now.duration_since(t0).as_secs_f64();
        assert!(total_debited as f64 <= burst as f64 + drip as f64 * elapsed + 1.0);
        // the bucket was busy all the time, so it should have come close to the limit
        assert!(total_debited as f64 >= drip as f64 * elapsed * 0.9);
    }

    #[test]
    fn test_hierarchical_cap() {
        let t0 = Instant::now();
        let parent = Arc::new(TokenBucket::new_at(None, 1_000, 1_000, t0));
        let child = TokenBucket::new_at(Some(parent.clone()), 100_000, 100_000, t0);

        let mut total_debited = 0u64;
        let mut now = t0;
        for _ in 0..100 {
            now += Duration::from_millis(100);
            while child.try_debit_at(50, now) {
                total_debited += 50;
            }
        }

        // 10 seconds at 1000 bytes/s plus the initial burst
        assert!(total_debited <= 1_000 * 10 + 1_000);
        assert!(total_debited >= 1_000 * 10);
    }

    #[test]
    fn test_set_rate_clamps_content() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(None, 1000, 1000, now);
        bucket.set_rate(500, 200);

        assert_eq!(bucket.drip_rate(), 500);
        assert_eq!(bucket.max_burst(), 200);
        assert_eq!(bucket.content(), 200);
    }

    #[test]
    fn test_spare_burst() {
        let t0 = Instant::now();
        let bucket = TokenBucket::new_at(None, 100, 100, t0);
        assert!(bucket.try_debit_at(100, t0));

        bucket.grant_spare_burst(300);
        assert_eq!(bucket.content(), 300);
        assert_eq!(bucket.spare_burst(), 300);

        bucket.grant_spare_burst(200);
        assert_eq!(bucket.content(), 300);
        assert_eq!(bucket.spare_burst(), 300);

        // refill may exceed max_burst while spare is outstanding
        bucket.refill_at(t0 + Duration::from_secs(1));
        assert_eq!(bucket.content(), 400);

        assert!(bucket.try_debit_at(350, t0 + Duration::from_secs(1)));
        assert_eq!(bucket.spare_burst(), 0);
        assert_eq!(bucket.content(), 50);
    }

    #[test]
    fn test_concurrent_debits_do_not_overdraw() {
        let now = Instant::now();
        let parent = Arc::new(TokenBucket::new_at(None, 1, 10_000, now));
        let children = (0..4)
            .map(|_| Arc::new(TokenBucket::new_at(Some(parent.clone()), 1, 10_000, now)))
            .collect::<Vec<_>>();

        let handles = children.into_iter()
            .map(|child| std::thread::spawn(move || {
                let mut debited = 0u64;
                for _ in 0..1_000 {
                    if child.try_debit_at(10, now) {
                        debited += 10;
                    }
                }
                debited
            }))
            .collect::<Vec<_>>();

        let total: u64 = handles.into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(total, 10_000);
        assert_eq!(parent.content(), 0);
    }
}
