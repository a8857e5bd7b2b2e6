use tokio::time::Instant;

/// Millisecond tick counts relative to a fixed epoch. Ticks start at 1 so that 0 can be used as a
///  'never' marker (e.g. for packets that are not on the wire).
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    epoch: Instant,
}

impl TickClock {
    pub fn new(epoch: Instant) -> TickClock {
        TickClock { epoch }
    }

    pub fn ticks_at(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }

    pub fn now(&self) -> u64 {
        self.ticks_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    #[test]
    fn test_ticks() {
        let epoch = Instant::now();
        let clock = TickClock::new(epoch);
        assert_eq!(clock.ticks_at(epoch), 1);
        assert_eq!(clock.ticks_at(epoch + Duration::from_micros(999)), 1);
        assert_eq!(clock.ticks_at(epoch + Duration::from_millis(250)), 251);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_before_epoch() {
        let epoch = Instant::now() + Duration::from_secs(1);
        let clock = TickClock::new(epoch);
        assert_eq!(clock.now(), 1);
    }
}
