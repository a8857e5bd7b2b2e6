//! The reliable UDP transport between a virtual world simulator and its viewers: per-connection
//!  queues that are shaped by hierarchical token buckets, a randomized fair scheduler, acks and
//!  retransmission with RTT-based timeouts, and bandwidth renegotiation with the viewer.

pub mod config;
pub mod connection;
pub mod end_point;
pub mod events;
pub mod io;
pub mod packet;
pub mod throttle;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
