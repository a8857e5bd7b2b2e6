//! Bandwidth shaping: the hierarchical [TokenBucket], the configured per-category seed rates and
//!  the wire-format cache of a connection's effective rates.

pub mod token_bucket;
pub mod throttle_rates;
pub mod unpacked_throttles;

pub use throttle_rates::ThrottleRates;
pub use token_bucket::TokenBucket;
pub use unpacked_throttles::UnpackedThrottles;
