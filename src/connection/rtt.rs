use std::cmp::min;
use std::time::Duration;
use tracing::trace;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const K: f64 = 4.0;

/// Round trip time estimation and retransmission timeout calculation along the lines of
///  RFC 2988. All values are in milliseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    rto_millis: u64,

    timer_resolution_millis: f64,
    default_rto_millis: u64,
    max_rto_millis: u64,
}

impl RttEstimator {
    pub fn new(default_rto: Duration, max_rto: Duration, timer_resolution: Duration) -> RttEstimator {
        let default_rto_millis = default_rto.as_millis() as u64;
        RttEstimator {
            srtt: 0.0,
            rttvar: 0.0,
            rto_millis: default_rto_millis,
            timer_resolution_millis: timer_resolution.as_millis() as f64,
            default_rto_millis,
            max_rto_millis: max_rto.as_millis() as u64,
        }
    }

    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    pub fn rto_millis(&self) -> u64 {
        self.rto_millis
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_millis)
    }

    /// Feeds a round trip sample (in milliseconds) into the estimate. A zero RTTVAR marks the
    ///  estimator as unsynchronized (initially and after a backoff), so the sample is taken as is.
    pub fn update_round_trip(&mut self, r: f64) {
        if self.rttvar == 0.0 {
            self.srtt = r;
            self.rttvar = r * 0.5;
        }
        else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        }

        let rto = (self.srtt + self.timer_resolution_millis.max(K * self.rttvar)) as u64;
        self.rto_millis = rto.clamp(self.default_rto_millis, self.max_rto_millis);
        trace!("RTT sample {}ms -> SRTT {:.1}, RTTVAR {:.1}, RTO {}ms", r, self.srtt, self.rttvar, self.rto_millis);
    }

    /// Exponential backoff after a loss: the current estimate is discarded as bogus, and the
    ///  timeout is doubled up to the configured maximum
    pub fn backoff_rto(&mut self) {
        self.srtt = 0.0;
        self.rttvar = 0.0;
        self.rto_millis = min(self.rto_millis.saturating_mul(2), self.max_rto_millis);
    }
}
