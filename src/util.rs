pub mod atomic_map;
pub mod random;
pub mod tick_clock;
