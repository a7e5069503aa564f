//! Time keeping and the millisecond sleep queue.

pub mod timer;

pub use timer::{sleep_milli, tick, uptime_ms};
