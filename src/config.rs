use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::throttle::ThrottleRates;

/// The rates of the listener-wide bucket that all connections' buckets are children of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneThrottle {
    /// bytes per second, 0 for 'unlimited'
    pub drip_rate: u64,
    pub max_burst: u64,
}

pub struct TransportConfig {
    pub self_addr: SocketAddr,

    /// Size of the socket's receive buffer (SO_RCVBUF). 0 means 'use the default of 32768 bytes'.
    pub recv_buffer_size: usize,

    /// If `true`, the next receive is issued before a received datagram is handled, so handling
    ///  runs concurrently with receiving. If `false`, datagrams are handled one at a time in the
    ///  order they were received, and the socket is not read while a datagram is being handled.
    pub async_packet_handling: bool,

    /// This is the number of receive buffers that are pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub recv_buffer_pool_size: usize,
    pub send_buffer_pool_size: usize,

    /// The maximum size of a received datagram. Longer datagrams are truncated by the OS.
    pub max_datagram_size: usize,

    /// No category's rate is ever set below this many bytes per second, otherwise a category
    ///  could be blocked permanently by a single packet bigger than its burst limit.
    pub mtu: u64,

    pub default_rto: Duration,
    pub max_rto: Duration,
    /// The granularity of timers, used as a lower bound for the variance term of the RTO
    pub timer_resolution: Duration,

    /// When this many bytes are waiting in a connection's queues, unreliable packets are dropped.
    ///  At 1.5 times this, reliable packets are dropped as well.
    pub max_outbound_queue_bytes: usize,

    pub scheduler_interval: Duration,
    pub resend_check_interval: Duration,
    pub stats_interval: Duration,
    pub queue_drained_min_interval: Duration,
    pub drop_report_interval: Duration,

    /// A connection that received nothing for this long is closed
    pub connection_timeout: Duration,

    /// `None` for no listener-wide limit
    pub scene_throttle: Option<SceneThrottle>,
    pub throttle_rates: ThrottleRates,
}

impl TransportConfig {
    pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 32768;

    pub fn default_ipv4(self_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            self_addr,
            recv_buffer_size: 0,
            async_packet_handling: true,
            recv_buffer_pool_size: 2048,
            send_buffer_pool_size: 2048,
            max_datagram_size: 4096,
            mtu: 1400,
            default_rto: Duration::from_millis(3000),
            max_rto: Duration::from_millis(60000),
            timer_resolution: Duration::from_millis(15),
            max_outbound_queue_bytes: 4 * 1024 * 1024,
            scheduler_interval: Duration::from_millis(1),
            resend_check_interval: Duration::from_millis(100),
            stats_interval: Duration::from_millis(1000),
            queue_drained_min_interval: Duration::from_millis(30),
            drop_report_interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(60),
            scene_throttle: None,
            throttle_rates: ThrottleRates::default(),
        }
    }

    pub fn effective_recv_buffer_size(&self) -> usize {
        if self.recv_buffer_size == 0 {
            Self::DEFAULT_SOCKET_BUFFER_SIZE
        }
        else {
            self.recv_buffer_size
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("max datagram size is too small");
        }
        if self.mtu == 0 {
            bail!("MTU must be positive");
        }
        if self.default_rto.is_zero() {
            bail!("default RTO must be positive");
        }
        if self.max_rto < self.default_rto {
            bail!("max RTO {:?} is smaller than default RTO {:?}", self.max_rto, self.default_rto);
        }
        if self.max_outbound_queue_bytes == 0 {
            bail!("max outbound queue size must be positive");
        }
        if self.scheduler_interval.is_zero() || self.resend_check_interval.is_zero() || self.stats_interval.is_zero() {
            bail!("scheduler intervals must be positive");
        }
        if self.throttle_rates.rates.iter().any(|&r| r == 0) {
            bail!("category throttle rates must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig::default_ipv4(SocketAddr::from(([127,0,0,1], 9000)))
    }

    #[test]
    fn test_default_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_effective_recv_buffer_size() {
        let mut config = config();
        assert_eq!(config.effective_recv_buffer_size(), 32768);
        config.recv_buffer_size = 1_000_000;
        assert_eq!(config.effective_recv_buffer_size(), 1_000_000);
    }

    #[test]
    fn test_validate_rto() {
        let mut config = config();
        config.max_rto = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rates() {
        let mut config = config();
        config.throttle_rates.rates[3] = 0;
        assert!(config.validate().is_err());
    }
}
